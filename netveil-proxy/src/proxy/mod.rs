//! Interception engine: session model, callback contract and HTTP server

pub mod engine;
pub mod server;
pub mod session;

pub use engine::{FilterCallbacks, ProxyEngine};
pub use server::{ProxyServer, ProxyServerConfig};
pub use session::{CustomResponse, ServerCertificate, Session, UpstreamResponse};
