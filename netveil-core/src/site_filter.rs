//! The filtering pipeline driven by the proxy engine

use crate::accountability::{AccountabilityReporter, BlockEvent, BlockType, ThresholdEnforcer};
use crate::auth::AuthenticationStorage;
use crate::block_page::{render_bad_certificate_page, BlockPage, TRANSPARENT_PNG};
use crate::certs::CertificateExemptions;
use crate::classify::{ContentKind, ImageClassifier};
use crate::notify::Notifier;
use crate::relaxed::RelaxedPolicy;
use crate::time::TimeDetection;
use async_trait::async_trait;
use chrono::Utc;
use netveil_proxy::config::{LoadedPolicy, PolicyStore};
use netveil_proxy::proxy::{FilterCallbacks, Session};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Collaborators of [`SiteFiltering`]
pub struct SiteFilteringDeps {
    pub policy: Arc<PolicyStore>,
    pub auth: Arc<AuthenticationStorage>,
    pub time: Arc<TimeDetection>,
    pub certs: Arc<CertificateExemptions>,
    pub relaxed: Arc<RelaxedPolicy>,
    pub threshold: Arc<ThresholdEnforcer>,
    pub reporter: Arc<AccountabilityReporter>,
    pub notifier: Arc<Notifier>,
    pub classifier: Option<Arc<dyn ImageClassifier>>,
}

pub struct SiteFiltering {
    deps: SiteFilteringDeps,
    blocked: broadcast::Sender<BlockEvent>,
}

impl SiteFiltering {
    pub fn new(deps: SiteFilteringDeps) -> Self {
        let (blocked, _) = broadcast::channel(64);
        Self { deps, blocked }
    }

    /// Every `RequestBlocked` event, as it happens
    pub fn subscribe(&self) -> broadcast::Receiver<BlockEvent> {
        self.blocked.subscribe()
    }

    /// Policy to apply to this session, or `None` when filtering is suspended:
    /// re-authentication pending, nothing loaded, or the management server itself
    fn active_policy(&self, session: &Session) -> Option<Arc<LoadedPolicy>> {
        if self.deps.auth.is_reauthentication_required() {
            debug!("Re-authentication pending, not filtering {}", session.host());
            return None;
        }
        let policy = self.deps.policy.snapshot()?;
        if policy.is_management_host(session.host()) {
            return None;
        }
        Some(policy)
    }

    fn block_page(&self, policy: &LoadedPolicy, page: BlockPage<'_>) -> String {
        let token = self.deps.auth.token();
        BlockPage {
            device_name: policy.config.service.device_name.as_deref(),
            unblock_base: policy.config.service.api_base_url.as_deref(),
            token: token.as_deref(),
            ..page
        }
        .render()
    }

    fn on_blocked(&self, event: BlockEvent) {
        info!(
            block_type = ?event.block_type,
            category = event.category.as_deref().unwrap_or("-"),
            "Blocked {}",
            event.uri
        );
        self.deps.threshold.record_block();
        self.deps.notifier.notify(&event.notification());
        self.deps.reporter.report_block(event.clone());
        let _ = self.blocked.send(event);
    }

    fn now(&self) -> chrono::DateTime<Utc> {
        self.deps.time.real_time().with_timezone(&Utc)
    }

    /// Substitute a response of the same kind as the blocked one
    fn send_block_response(&self, session: &mut Session, kind: ContentKind, html: impl FnOnce() -> String) {
        match kind {
            ContentKind::Html => session.send_custom_response(200, "text/html; charset=utf-8", html()),
            ContentKind::Json => session.send_custom_response(200, "application/json", "{}"),
            ContentKind::Text => {
                session.send_custom_response(200, "text/plain; charset=utf-8", "Blocked by netveil")
            }
            ContentKind::Image => session.send_custom_response(200, "image/png", TRANSPARENT_PNG),
        }
    }

    async fn inspect_content(&self, session: &mut Session, policy: &LoadedPolicy) {
        let Some(content_type) = session.response_content_type() else {
            return;
        };
        let Some(kind) = ContentKind::from_content_type(&content_type) else {
            return;
        };
        let Some((body, truncated)) = session.response().map(|r| (r.body.clone(), r.truncated)) else {
            return;
        };
        let content = &policy.config.content;
        let relaxed = self.deps.policy.is_bypass_enabled();

        let event = if kind.is_text() {
            let scanned = &body[..body.len().min(content.max_text_scan_bytes)];
            let text = String::from_utf8_lossy(scanned);
            let Some(hit) = policy.engine.match_text(&text, content.max_text_scan_bytes, relaxed) else {
                return;
            };
            BlockEvent::new(BlockType::TextTrigger, session.url().as_str(), self.now())
                .with_category(policy.engine.category_name(hit.category))
                .with_trigger(hit.trigger)
        } else {
            if truncated || body.len() < content.min_image_bytes || body.len() > content.max_image_bytes {
                return;
            }
            let Some(classifier) = &self.deps.classifier else {
                return;
            };
            match classifier.is_objectionable(&body, &content_type).await {
                Ok(true) => BlockEvent::new(BlockType::ImageClassification, session.url().as_str(), self.now()),
                Ok(false) => return,
                Err(e) => {
                    warn!("Image classification failed: {}", e);
                    return;
                }
            }
        };

        let applied: Vec<String> = event.category.iter().cloned().collect();
        let url = session.url().to_string();
        self.send_block_response(session, kind, || {
            self.block_page(
                policy,
                BlockPage {
                    block_type: Some(event.block_type),
                    url: &url,
                    category: event.category.as_deref(),
                    applied_categories: &applied,
                    trigger: event.trigger.as_deref(),
                    ..Default::default()
                },
            )
        });
        self.on_blocked(event);
    }
}

#[async_trait]
impl FilterCallbacks for SiteFiltering {
    fn inspects_content_type(&self, content_type: &str) -> bool {
        ContentKind::from_content_type(content_type).is_some()
    }

    async fn before_request(&self, session: &mut Session) -> bool {
        let Some(policy) = self.active_policy(session) else {
            return false;
        };
        if self.deps.time.is_now_allowed(&policy.config) {
            return false;
        }

        let url = session.url().to_string();
        let page = self.block_page(
            &policy,
            BlockPage {
                block_type: Some(BlockType::TimeRestriction),
                url: &url,
                ..Default::default()
            },
        );
        session.send_custom_response(200, "text/html; charset=utf-8", page);
        self.on_blocked(BlockEvent::new(BlockType::TimeRestriction, url, self.now()));
        true
    }

    async fn before_response(&self, session: &mut Session) {
        let Some(policy) = self.active_policy(session) else {
            return;
        };
        if session.is_whitelisted() {
            return;
        }

        if let Some(certificate) = session.certificate().cloned() {
            if !certificate.is_valid() && !self.deps.certs.is_exempted(session.host(), &certificate) {
                let page = render_bad_certificate_page(
                    session.host(),
                    &certificate.thumbprint,
                    &certificate.validation_errors,
                );
                session.send_custom_response(200, "text/html; charset=utf-8", page);
                self.on_blocked(BlockEvent::new(
                    BlockType::BadCertificate,
                    session.url().as_str(),
                    self.now(),
                ));
                return;
            }
        }

        self.inspect_content(session, &policy).await;
    }

    fn blacklisted(&self, session: &mut Session, categories: &[u32]) -> Option<u32> {
        let policy = self.active_policy(session)?;
        let enforced = *categories.first()?;

        let names: Vec<String> = categories
            .iter()
            .map(|id| policy.engine.category_name(*id))
            .collect();
        let relaxable = categories
            .iter()
            .all(|id| policy.engine.category(*id).is_some_and(|c| c.relaxable));
        let relaxed_available = relaxable && self.deps.relaxed.has_remaining();

        let url = session.url().to_string();
        let page = self.block_page(
            &policy,
            BlockPage {
                block_type: Some(BlockType::Url),
                url: &url,
                category: names.first().map(String::as_str),
                applied_categories: &names,
                relaxed_available,
                ..Default::default()
            },
        );
        session.send_custom_response(200, "text/html; charset=utf-8", page);

        let mut event = BlockEvent::new(BlockType::Url, url, self.now());
        if let Some(name) = names.first() {
            event = event.with_category(name.clone());
        }
        self.on_blocked(event);
        Some(enforced)
    }

    fn whitelisted(&self, session: &mut Session, categories: &[u32]) -> Option<u32> {
        session.mark_whitelisted();
        categories.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notification;
    use crate::settings::SettingsStore;
    use crate::testing::{FakeClock, FakeImageClassifier, FakeRemoteApi, FakeSwitch, RecordingSink};
    use bytes::Bytes;
    use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
    use hyper::Method;
    use netveil_proxy::config::{Category, CategoryKind, PolicyConfiguration, RuleGroup, TimeRestrictionModel};
    use netveil_proxy::proxy::ServerCertificate;
    use netveil_proxy::UrlVerdict;
    use tempfile::TempDir;
    use url::Url;

    struct Fixture {
        _dir: TempDir,
        policy: Arc<PolicyStore>,
        auth: Arc<AuthenticationStorage>,
        certs: Arc<CertificateExemptions>,
        sink: Arc<RecordingSink>,
        classifier: Arc<FakeImageClassifier>,
        filter: SiteFiltering,
    }

    fn config() -> PolicyConfiguration {
        let mut config = PolicyConfiguration::default();
        config.service.management_host = Some("manage.example.com".to_string());
        config.service.api_base_url = Some("https://manage.example.com/api".to_string());
        config.groups.insert(
            "casino".to_string(),
            RuleGroup {
                hosts: vec!["*.casino.example".to_string()],
                ..Default::default()
            },
        );
        config.categories.insert(
            "gambling".to_string(),
            Category {
                id: 20,
                description: "Gambling".to_string(),
                kind: CategoryKind::Block,
                relaxable: true,
                groups: vec!["casino".to_string()],
                triggers: vec!["online poker".to_string()],
            },
        );
        config.bypass.permitted = 1;
        config.content.min_image_bytes = 4;
        config
    }

    fn fixture(config: PolicyConfiguration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let policy = Arc::new(PolicyStore::new());
        policy.replace(config).unwrap();

        let clock = Arc::new(FakeClock::default());
        let api = Arc::new(FakeRemoteApi::new());
        let notifier = Arc::new(Notifier::new());
        let sink = Arc::new(RecordingSink::new());
        notifier.subscribe(sink.clone());
        let auth = Arc::new(AuthenticationStorage::with_token("secret"));
        let certs = Arc::new(CertificateExemptions::in_memory(clock.clone()).unwrap());
        let settings = Arc::new(SettingsStore::load(dir.path().join("settings.json")).unwrap());
        let classifier = Arc::new(FakeImageClassifier::new(true));

        let filter = SiteFiltering::new(SiteFilteringDeps {
            policy: policy.clone(),
            auth: auth.clone(),
            time: Arc::new(TimeDetection::new(clock.clone(), api.clone())),
            certs: certs.clone(),
            relaxed: RelaxedPolicy::new(policy.clone(), api.clone(), settings, notifier.clone(), clock),
            threshold: Arc::new(ThresholdEnforcer::new(
                policy.clone(),
                Arc::new(FakeSwitch::default()),
                notifier.clone(),
            )),
            reporter: Arc::new(AccountabilityReporter::new(api)),
            notifier,
            classifier: Some(classifier.clone()),
        });
        Fixture {
            _dir: dir,
            policy,
            auth,
            certs,
            sink,
            classifier,
            filter,
        }
    }

    fn session(url: &str) -> Session {
        Session::new(Method::GET, Url::parse(url).unwrap())
    }

    fn with_body(url: &str, content_type: &'static str, body: impl Into<Bytes>) -> Session {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        session(url).with_response(200, headers, body)
    }

    fn blocks(sink: &RecordingSink) -> Vec<Notification> {
        sink.received()
            .into_iter()
            .filter(|n| matches!(n, Notification::BlockAction { .. }))
            .collect()
    }

    #[tokio::test]
    async fn test_time_restriction_blocks_request() {
        let mut config = config();
        // The fake clock reads Wednesday noon
        config.time_restrictions.wednesday = Some(TimeRestrictionModel::new(true, [18.0, 22.0]));
        let f = fixture(config);

        let mut s = session("http://news.example/");
        assert!(f.filter.before_request(&mut s).await);
        let page = s.custom_response().unwrap();
        assert!(String::from_utf8_lossy(&page.body).contains("not allowed at this time"));
        assert_eq!(blocks(&f.sink).len(), 1);

        // The management server stays reachable
        let mut s = session("https://manage.example.com/api/time");
        assert!(!f.filter.before_request(&mut s).await);
    }

    #[tokio::test]
    async fn test_inside_window_passes() {
        let mut config = config();
        config.time_restrictions.wednesday = Some(TimeRestrictionModel::new(true, [8.0, 17.0]));
        let f = fixture(config);
        let mut s = session("http://news.example/");
        assert!(!f.filter.before_request(&mut s).await);
        assert!(s.custom_response().is_none());
    }

    #[tokio::test]
    async fn test_reauthentication_suspends_filtering() {
        let mut config = config();
        config.time_restrictions.wednesday = Some(TimeRestrictionModel::new(true, Vec::new()));
        let f = fixture(config);
        f.auth.require_reauthentication();

        let mut s = session("http://news.example/");
        assert!(!f.filter.before_request(&mut s).await);
        let mut s = with_body("http://news.example/", "text/html", "online poker tonight");
        f.filter.before_response(&mut s).await;
        assert!(s.custom_response().is_none());
    }

    #[tokio::test]
    async fn test_no_policy_passes() {
        let f = fixture(config());
        f.policy.clear();
        let mut s = session("http://www.casino.example/");
        assert!(!f.filter.before_request(&mut s).await);
        assert_eq!(f.filter.blacklisted(&mut s, &[20]), None);
    }

    #[tokio::test]
    async fn test_url_block_page() {
        let f = fixture(config());
        let mut events = f.filter.subscribe();
        let mut s = session("http://www.casino.example/slots");

        let policy = f.policy.snapshot().unwrap();
        let UrlVerdict::Blacklisted(categories) = policy.engine.classify(s.host(), None, false) else {
            panic!("expected a block");
        };
        assert_eq!(f.filter.blacklisted(&mut s, &categories), Some(20));

        let page = String::from_utf8_lossy(&s.custom_response().unwrap().body).to_string();
        assert!(page.contains("gambling"));
        assert!(page.contains("/api/unblock?"));
        assert!(page.contains("relaxed policy"));

        let event = events.try_recv().unwrap();
        assert_eq!(event.block_type, BlockType::Url);
        assert_eq!(event.category.as_deref(), Some("gambling"));
    }

    #[tokio::test]
    async fn test_text_trigger_mirrors_content_type() {
        let f = fixture(config());

        let mut html = with_body("http://blog.example/", "text/html", "<p>Play Online Poker now</p>");
        f.filter.before_response(&mut html).await;
        let custom = html.custom_response().unwrap();
        assert!(custom.content_type.starts_with("text/html"));
        assert!(String::from_utf8_lossy(&custom.body).contains("Page blocked"));

        let mut json = with_body("http://api.example/", "application/json", r#"{"game":"online poker"}"#);
        f.filter.before_response(&mut json).await;
        assert_eq!(json.custom_response().unwrap().body, Bytes::from_static(b"{}"));

        let mut text = with_body("http://api.example/t", "text/plain", "online poker");
        f.filter.before_response(&mut text).await;
        assert!(text.custom_response().unwrap().content_type.starts_with("text/plain"));

        let mut css = with_body("http://api.example/s.css", "text/css", "online poker");
        f.filter.before_response(&mut css).await;
        assert!(css.custom_response().is_none());

        assert_eq!(blocks(&f.sink).len(), 3);
    }

    #[tokio::test]
    async fn test_relaxed_policy_suspends_relaxable_triggers() {
        let f = fixture(config());
        f.policy.set_bypass_enabled(true);
        let mut s = with_body("http://blog.example/", "text/html", "online poker");
        f.filter.before_response(&mut s).await;
        assert!(s.custom_response().is_none());
    }

    #[tokio::test]
    async fn test_whitelisted_skips_inspection() {
        let f = fixture(config());
        let mut s = with_body("http://blog.example/", "text/html", "online poker");
        assert_eq!(f.filter.whitelisted(&mut s, &[1]), Some(1));
        f.filter.before_response(&mut s).await;
        assert!(s.custom_response().is_none());
    }

    #[tokio::test]
    async fn test_images() {
        let f = fixture(config());
        let mut small = with_body("http://img.example/a.png", "image/png", "ab");
        f.filter.before_response(&mut small).await;
        assert!(small.custom_response().is_none());
        assert_eq!(f.classifier.calls(), 0);

        let mut large = with_body("http://img.example/b.png", "image/png", "abcdefgh");
        f.filter.before_response(&mut large).await;
        let custom = large.custom_response().unwrap();
        assert_eq!(custom.content_type, "image/png");
        assert_eq!(custom.body, Bytes::from_static(TRANSPARENT_PNG));
        assert_eq!(f.classifier.calls(), 1);

        let mut partial = with_body("http://img.example/c.png", "image/png", "abcdefgh");
        partial.mark_response_truncated();
        f.filter.before_response(&mut partial).await;
        assert!(partial.custom_response().is_none());
        assert_eq!(f.classifier.calls(), 1);
    }

    #[tokio::test]
    async fn test_inspected_content_types() {
        let f = fixture(config());
        assert!(f.filter.inspects_content_type("text/html"));
        assert!(f.filter.inspects_content_type("image/jpeg"));
        assert!(!f.filter.inspects_content_type("video/mp4"));
        assert!(!f.filter.inspects_content_type("application/zip"));
    }

    #[tokio::test]
    async fn test_bad_certificate_until_trusted() {
        let f = fixture(config());
        let certificate = ServerCertificate {
            thumbprint: "AB12".to_string(),
            subject: "CN=nas.local".to_string(),
            validation_errors: vec!["UntrustedRoot".to_string()],
        };

        let mut s = with_body("https://nas.local/", "text/html", "hello")
            .with_certificate(certificate.clone());
        f.filter.before_response(&mut s).await;
        let page = String::from_utf8_lossy(&s.custom_response().unwrap().body).to_string();
        assert!(page.contains("Untrusted certificate"));

        f.certs.trust_certificate("nas.local", "AB12");
        let mut s = with_body("https://nas.local/", "text/html", "hello").with_certificate(certificate);
        f.filter.before_response(&mut s).await;
        assert!(s.custom_response().is_none());
    }
}
