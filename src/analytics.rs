//! Consent-gated event tracking
//!
//! Events are enriched with app and session context and handed to an
//! [`EventSink`]. Until [`AnalyticsService::start`] runs they are queued;
//! without consent they are dropped. Events about ensaios are also forwarded
//! to the API through an [`EventForwarder`].
//!
//! Tracking never fails the caller: sink and forwarder errors are logged.

use std::error::Error as StdError;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use reqwest::Method;
use serde_json::{Map, Value, json};
use tracing::{debug, error};

use crate::auth::AuthProvider;
use crate::clock::{Clock, SystemClock, to_rfc3339};
use crate::document_store::DocumentStore;
use crate::gateway::{Gateway, RequestOptions};
use crate::{AnalyticsConfig, RequestError};

/// Error type of sink implementations
pub type SinkError = Box<dyn StdError + Send + Sync>;

/// Endpoint receiving forwarded ensaio events
pub const ENSAIO_EVENTS_ENDPOINT: &str = "/analytics/ensaios";

/// Destination of tracked events (an analytics SDK, a log, ...)
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn log_event(&self, name: &str, params: &Map<String, Value>) -> Result<(), SinkError>;

    async fn set_user(
        &self,
        user_id: &str,
        properties: &Map<String, Value>,
    ) -> Result<(), SinkError>;
}

/// Secondary destination for ensaio events
#[async_trait]
pub trait EventForwarder: Send + Sync + 'static {
    async fn forward(&self, event: &str, params: &Map<String, Value>) -> Result<(), RequestError>;
}

#[async_trait]
impl<S: DocumentStore, A: AuthProvider> EventForwarder for Gateway<S, A> {
    async fn forward(&self, event: &str, params: &Map<String, Value>) -> Result<(), RequestError> {
        let mut body = Map::with_capacity(params.len() + 1);
        body.insert("event".to_owned(), json!(event));
        body.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));

        self.request(
            Method::POST,
            ENSAIO_EVENTS_ENDPOINT,
            Some(&Value::Object(body)),
            RequestOptions::default(),
        )
        .await?;
        Ok(())
    }
}

/// Profile attributes reported by [`AnalyticsService::set_user_data`]
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub uid: String,
    pub is_pro: bool,
    pub created_at: DateTime<Utc>,
    pub has_lab_access: bool,
}

#[derive(Debug)]
struct QueuedEvent {
    name: String,
    params: Map<String, Value>,
}

#[derive(Debug)]
struct State {
    consent: bool,
    started: bool,
    page_path: String,
    queue: Vec<QueuedEvent>,
}

pub struct AnalyticsService {
    sink: Arc<dyn EventSink>,
    auth: Arc<dyn AuthProvider>,
    forwarder: Option<Arc<dyn EventForwarder>>,
    clock: Arc<dyn Clock>,
    config: AnalyticsConfig,
    state: Mutex<State>,
}

impl AnalyticsService {
    /// Create a stopped service. Debug mode grants consent regardless of `consent`.
    pub fn new(
        sink: Arc<dyn EventSink>,
        auth: Arc<dyn AuthProvider>,
        config: AnalyticsConfig,
        consent: bool,
    ) -> Self {
        if config.debug {
            debug!("[Analytics] Running in debug mode");
        }
        let state = State {
            consent: consent || config.debug,
            started: false,
            page_path: "/".to_owned(),
            queue: Vec::new(),
        };
        Self {
            sink,
            auth,
            forwarder: None,
            clock: Arc::new(SystemClock),
            config,
            state: Mutex::new(state),
        }
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn EventForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_consent(&self) -> bool {
        self.state().consent
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    /// Start delivering events, flushing the ones queued so far. Idempotent.
    pub async fn start(&self) {
        let queued = {
            let mut state = self.state();
            if state.started {
                return;
            }
            state.started = true;
            std::mem::take(&mut state.queue)
        };
        if !queued.is_empty() {
            debug!("[Analytics] Flushing {} queued events", queued.len());
        }
        for event in queued {
            self.dispatch(&event.name, &event.params).await;
        }
    }

    /// Record the user's consent; granting it starts the service.
    pub async fn set_consent(&self, granted: bool) {
        let start = {
            let mut state = self.state();
            state.consent = granted || self.config.debug;
            granted && !state.started
        };
        if start {
            self.start().await;
        }
    }

    /// Track `name` with `params`.
    ///
    /// `page_path` defaults to the path of the last page view.
    pub async fn track_event(
        &self,
        name: &str,
        params: Map<String, Value>,
        page_path: Option<&str>,
    ) {
        let page_path = {
            let state = self.state();
            if !state.consent {
                return;
            }
            page_path.map_or_else(|| state.page_path.clone(), str::to_owned)
        };

        let mut enriched = params;
        enriched.insert("app_version".to_owned(), json!(self.config.app_version));
        enriched.insert("page_path".to_owned(), json!(page_path));
        enriched.insert(
            "user_id".to_owned(),
            json!(self.auth.user_id().unwrap_or_else(|| "anonymous".to_owned())),
        );
        enriched.insert(
            "timestamp".to_owned(),
            json!(to_rfc3339(self.clock.now_millis())),
        );

        {
            let mut state = self.state();
            if !state.started {
                state.queue.push(QueuedEvent {
                    name: name.to_owned(),
                    params: enriched,
                });
                return;
            }
        }
        self.dispatch(name, &enriched).await;
    }

    async fn dispatch(&self, name: &str, params: &Map<String, Value>) {
        if let Err(e) = self.sink.log_event(name, params).await {
            error!("Analytics tracking error: {}", e);
            return;
        }
        if self.config.debug {
            debug!("[Analytics Event] {} {:?}", name, params);
        }

        if name.contains("ensaio_")
            && let Some(forwarder) = &self.forwarder
            && let Err(e) = forwarder.forward(name, params).await
        {
            error!("Analytics forwarding error for {}: {}", name, e);
        }
    }

    pub async fn track_page_view(&self, title: &str, page_path: &str) {
        self.state().page_path = page_path.to_owned();
        let mut params = Map::new();
        params.insert("page_title".to_owned(), json!(title));
        self.track_event("page_view", params, Some(page_path)).await;
    }

    /// `ensaio_name` is expected as `{category}_{rest}`, e.g. `solos_compressao`.
    pub async fn track_ensaio_view(&self, ensaio_id: &str, ensaio_name: &str) {
        let category = ensaio_name.split('_').next().unwrap_or(ensaio_name);
        let mut params = Map::new();
        params.insert("ensaio_id".to_owned(), json!(ensaio_id));
        params.insert("ensaio_name".to_owned(), json!(ensaio_name));
        params.insert("category".to_owned(), json!(category));
        self.track_event("ensaio_view", params, None).await;
    }

    pub async fn track_search(&self, query: &str, results_count: usize) {
        let search_type = if query.chars().count() > 5 {
            "complex"
        } else {
            "simple"
        };
        let mut params = Map::new();
        params.insert("search_term".to_owned(), json!(query));
        params.insert("results_count".to_owned(), json!(results_count));
        params.insert("search_type".to_owned(), json!(search_type));
        self.track_event("search_performed", params, None).await;
    }

    pub async fn set_user_data(&self, user: &UserProfile) {
        if !self.has_consent() {
            return;
        }
        let mut properties = Map::new();
        properties.insert(
            "user_type".to_owned(),
            json!(if user.is_pro { "professional" } else { "student" }),
        );
        properties.insert(
            "account_created".to_owned(),
            json!(user.created_at.year().to_string()),
        );
        properties.insert(
            "lab_access".to_owned(),
            json!(if user.has_lab_access { "yes" } else { "no" }),
        );

        if let Err(e) = self.sink.set_user(&user.uid, &properties).await {
            error!("User analytics error: {}", e);
        }
    }

    /// Report `err`; its source chain is included only in debug mode.
    pub async fn track_error<E: StdError>(&self, err: &E, context: &str) {
        let mut params = Map::new();
        params.insert("error_name".to_owned(), json!(std::any::type_name::<E>()));
        params.insert("error_message".to_owned(), json!(err.to_string()));
        if self.config.debug {
            let mut chain = Vec::new();
            let mut source = err.source();
            while let Some(cause) = source {
                chain.push(cause.to_string());
                source = cause.source();
            }
            params.insert("error_stack".to_owned(), json!(chain.join("\ncaused by: ")));
        }
        params.insert("context".to_owned(), json!(context));
        self.track_event("app_error", params, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticSession;
    use crate::clock::ManualClock;
    use crate::error::ErrorCode;
    use chrono::TimeZone;
    use httpmock::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    const START: i64 = 1_700_000_000_000;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, Map<String, Value>)>>,
        users: Mutex<Vec<(String, Map<String, Value>)>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<(String, Map<String, Value>)> {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        fn names(&self) -> Vec<String> {
            self.events().into_iter().map(|(name, _)| name).collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn log_event(
            &self,
            name: &str,
            params: &Map<String, Value>,
        ) -> Result<(), SinkError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err("sink offline".into());
            }
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((name.to_owned(), params.clone()));
            Ok(())
        }

        async fn set_user(
            &self,
            user_id: &str,
            properties: &Map<String, Value>,
        ) -> Result<(), SinkError> {
            self.users
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((user_id.to_owned(), properties.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingForwarder {
        forwarded: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl EventForwarder for RecordingForwarder {
        async fn forward(&self, event: &str, _: &Map<String, Value>) -> Result<(), RequestError> {
            self.forwarded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.to_owned());
            if self.fail {
                return Err(RequestError::new(ErrorCode::Unknown, "offline"));
            }
            Ok(())
        }
    }

    fn service(
        sink: &Arc<RecordingSink>,
        config: AnalyticsConfig,
        consent: bool,
    ) -> AnalyticsService {
        AnalyticsService::new(
            Arc::clone(sink) as Arc<dyn EventSink>,
            Arc::new(StaticSession::signed_in("u1", "tok")),
            config,
            consent,
        )
        .with_clock(Arc::new(ManualClock::new(START)))
    }

    #[tokio::test]
    async fn events_are_queued_until_start() {
        let sink = Arc::new(RecordingSink::default());
        let analytics = service(&sink, AnalyticsConfig::default(), true);

        analytics.track_search("cbr", 2).await;
        analytics.track_search("granulometria", 7).await;
        assert!(sink.events().is_empty());

        analytics.start().await;
        analytics.start().await;
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1.get("search_type"), Some(&json!("simple")));
        assert_eq!(events[1].1.get("search_type"), Some(&json!("complex")));
        assert_eq!(events[1].1.get("results_count"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn events_without_consent_are_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let analytics = service(&sink, AnalyticsConfig::default(), false);

        analytics.track_page_view("Início", "/").await;
        analytics.start().await;
        analytics.track_page_view("Ensaios", "/ensaios").await;
        assert!(sink.events().is_empty());

        analytics.set_consent(true).await;
        analytics.track_page_view("Ensaios", "/ensaios").await;
        assert_eq!(sink.names(), vec!["page_view"]);

        analytics.set_consent(false).await;
        analytics.track_page_view("Sobre", "/sobre").await;
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn granting_consent_starts_the_service() {
        let sink = Arc::new(RecordingSink::default());
        let analytics = service(&sink, AnalyticsConfig::default(), false);
        assert!(!analytics.is_started());

        analytics.set_consent(true).await;
        assert!(analytics.is_started());
        analytics.track_search("cbr", 1).await;
        assert_eq!(sink.names(), vec!["search_performed"]);
    }

    #[tokio::test]
    async fn debug_mode_forces_consent() {
        let sink = Arc::new(RecordingSink::default());
        let config = AnalyticsConfig {
            debug: true,
            ..AnalyticsConfig::default()
        };
        let analytics = service(&sink, config, false);
        assert!(analytics.has_consent());

        analytics.set_consent(false).await;
        assert!(analytics.has_consent());
    }

    #[tokio::test]
    async fn events_are_enriched() {
        let sink = Arc::new(RecordingSink::default());
        let config = AnalyticsConfig {
            app_version: "2.3.0".to_owned(),
            debug: false,
        };
        let analytics = service(&sink, config, true);
        analytics.start().await;

        analytics.track_page_view("Ensaios", "/ensaios").await;
        analytics.track_ensaio_view("e1", "solos_compressao").await;

        let events = sink.events();
        let (_, view) = &events[1];
        assert_eq!(view.get("category"), Some(&json!("solos")));
        assert_eq!(view.get("app_version"), Some(&json!("2.3.0")));
        assert_eq!(view.get("page_path"), Some(&json!("/ensaios")));
        assert_eq!(view.get("user_id"), Some(&json!("u1")));
        assert_eq!(view.get("timestamp"), Some(&json!(to_rfc3339(START))));
    }

    #[tokio::test]
    async fn anonymous_users_are_labelled() {
        let sink = Arc::new(RecordingSink::default());
        let analytics = AnalyticsService::new(
            Arc::clone(&sink) as Arc<dyn EventSink>,
            Arc::new(crate::auth::Anonymous),
            AnalyticsConfig::default(),
            true,
        );
        analytics.start().await;
        analytics.track_search("x", 0).await;
        assert_eq!(sink.events()[0].1.get("user_id"), Some(&json!("anonymous")));
    }

    #[tokio::test]
    async fn only_ensaio_events_are_forwarded() {
        let sink = Arc::new(RecordingSink::default());
        let forwarder = Arc::new(RecordingForwarder::default());
        let analytics = service(&sink, AnalyticsConfig::default(), true)
            .with_forwarder(Arc::clone(&forwarder) as Arc<dyn EventForwarder>);
        analytics.start().await;

        analytics.track_search("cbr", 1).await;
        analytics.track_ensaio_view("e1", "solos_cbr").await;

        let forwarded = forwarder
            .forwarded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        assert_eq!(forwarded, vec!["ensaio_view"]);
    }

    #[tokio::test]
    async fn failures_never_reach_the_caller() {
        let sink = Arc::new(RecordingSink::default());
        let forwarder = Arc::new(RecordingForwarder {
            fail: true,
            ..RecordingForwarder::default()
        });
        let analytics = service(&sink, AnalyticsConfig::default(), true)
            .with_forwarder(forwarder as Arc<dyn EventForwarder>);
        analytics.start().await;

        analytics.track_ensaio_view("e1", "solos_cbr").await;
        assert_eq!(sink.names(), vec!["ensaio_view"]);

        sink.fail.store(true, Ordering::SeqCst);
        analytics.track_ensaio_view("e2", "rochas_ucs").await;
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn user_properties() {
        let sink = Arc::new(RecordingSink::default());
        let analytics = service(&sink, AnalyticsConfig::default(), true);
        let created_at = Utc
            .with_ymd_and_hms(2021, 3, 14, 12, 0, 0)
            .single()
            .unwrap_or_default();

        analytics
            .set_user_data(&UserProfile {
                uid: "u1".to_owned(),
                is_pro: true,
                created_at,
                has_lab_access: false,
            })
            .await;

        let users = sink.users.lock().unwrap_or_else(PoisonError::into_inner).clone();
        assert_eq!(users.len(), 1);
        let (uid, props) = &users[0];
        assert_eq!(uid, "u1");
        assert_eq!(props.get("user_type"), Some(&json!("professional")));
        assert_eq!(props.get("account_created"), Some(&json!("2021")));
        assert_eq!(props.get("lab_access"), Some(&json!("no")));
    }

    #[derive(Debug, thiserror::Error)]
    #[error("calculation failed")]
    struct CalcError(#[source] std::io::Error);

    #[tokio::test]
    async fn error_stack_only_in_debug() {
        let err = CalcError(std::io::Error::other("disk full"));

        let sink = Arc::new(RecordingSink::default());
        let analytics = service(&sink, AnalyticsConfig::default(), true);
        analytics.start().await;
        analytics.track_error(&err, "cbr calculator").await;
        let (name, params) = &sink.events()[0];
        assert_eq!(name, "app_error");
        assert_eq!(params.get("error_message"), Some(&json!("calculation failed")));
        assert_eq!(params.get("context"), Some(&json!("cbr calculator")));
        assert!(params.get("error_stack").is_none());

        let sink = Arc::new(RecordingSink::default());
        let config = AnalyticsConfig {
            debug: true,
            ..AnalyticsConfig::default()
        };
        let analytics = service(&sink, config, false);
        analytics.start().await;
        analytics.track_error(&err, "cbr calculator").await;
        assert_eq!(
            sink.events()[0].1.get("error_stack"),
            Some(&json!("disk full"))
        );
    }

    #[tokio::test]
    async fn gateway_forwards_ensaio_events() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(ENSAIO_EVENTS_ENDPOINT)
                    .header("authorization", "Bearer tok")
                    .json_body(json!({"event": "ensaio_view", "ensaio_id": "e1"}));
                then.status(204);
            })
            .await;

        let gw = crate::gateway::tests::gateway_with(
            &server.base_url(),
            Arc::new(crate::test_support::FlakyStore::new()),
            crate::GatewayConfig::default(),
        );
        let mut params = Map::new();
        params.insert("ensaio_id".to_owned(), json!("e1"));

        let result = gw.forward("ensaio_view", &params).await;
        assert!(result.is_ok());
        mock.assert_async().await;
    }
}
