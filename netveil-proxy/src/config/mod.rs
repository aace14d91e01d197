//! Policy configuration: schema, loading, validation and the shared store

pub mod loader;
pub mod schema;
pub mod store;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::{
    BypassSettings, Category, CategoryKind, ContentSettings, DnsSettings, PolicyConfiguration,
    RuleGroup, ServiceSettings, ThresholdSettings, TimeRestrictionModel, WeeklyRestrictions,
};
pub use store::{LoadedPolicy, PolicyStore};
pub use validator::ConfigValidator;
