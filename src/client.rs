//! The client facade: typed variation accessors over the evaluator, wired to
//! the data-source pipeline and the event pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use reqwest::Url;
use tokio::sync::watch;

use crate::config::Config;
use crate::data_source::{
    FeatureRequestor, InitState, PollingUpdateProcessor, StreamingUpdateProcessor, UpdateProcessor,
};
use crate::eval::{evaluate, Detail, ErrorKind, PrerequisiteEvent};
use crate::events::{
    BaseEvent, CustomEvent, EventProcessor, EventSender, FeatureRequestEvent, IdentifyEvent,
    InputEvent,
};
use crate::model::FeatureFlag;
use crate::store::{AllData, DataStore, InMemoryDataStore};
use crate::str::ArcStr;
use crate::{Error, Result, User, Value};

/// A client for evaluating feature flags against a continuously synchronized
/// dataset.
///
/// Build one from a [`Config`], call [`Client::start`] inside a tokio
/// runtime, and optionally wait for initialization:
///
/// ```no_run
/// # async fn run() -> darklaunch::Result<()> {
/// # use std::time::Duration;
/// use darklaunch::{Client, Config, User};
///
/// let client = Client::build(Config::builder("sdk-key").build())?;
/// client.start();
/// client.wait_for_initialization(Duration::from_secs(5)).await?;
///
/// let user = User::with_key("user-key").build();
/// if client.bool_variation(&user, "new-checkout", false) {
///     // ...
/// }
/// # Ok(()) }
/// ```
pub struct Client {
    config: Config,
    store: Arc<dyn DataStore>,
    events: ArcSwapOption<EventProcessor>,
    init_tx: Mutex<Option<watch::Sender<InitState>>>,
    init_rx: watch::Receiver<InitState>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl Client {
    /// Creates a client. Background work does not begin until
    /// [`Client::start`] is called.
    pub fn build(config: Config) -> Result<Client> {
        // Validate endpoints up front so misconfiguration fails at build
        // time, not inside a background task.
        for uri in [
            &config.endpoints.base_uri,
            &config.endpoints.streaming_base_uri,
            &config.endpoints.events_base_uri,
        ] {
            Url::parse(uri).map_err(Error::InvalidBaseUri)?;
        }

        let (init_tx, init_rx) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Client {
            config,
            store: Arc::new(InMemoryDataStore::new()),
            events: ArcSwapOption::empty(),
            init_tx: Mutex::new(Some(init_tx)),
            init_rx,
            shutdown_tx,
            started: AtomicBool::new(false),
        })
    }

    /// Starts the update processor and the event pipeline. Must be called
    /// from within a tokio runtime; later calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(init_tx) = self
            .init_tx
            .lock()
            .expect("client init lock poisoned")
            .take()
        else {
            return;
        };

        if self.config.offline {
            log::info!(target: "darklaunch", "offline mode, not connecting to services");
            self.store.init(AllData::default());
            let _ = init_tx.send(Some(Ok(())));
            return;
        }

        if self.config.events_enabled {
            let sender = EventSender::new(
                reqwest::Client::new(),
                self.config.endpoints.events_base_uri.clone(),
                self.config.sdk_key.clone(),
                self.config.events.retry_delay,
            );
            let processor = EventProcessor::start(self.config.events.clone(), sender);
            self.events.store(Some(Arc::new(processor)));
        }

        let requestor = FeatureRequestor::new(
            reqwest::Client::new(),
            self.config.endpoints.base_uri.clone(),
            self.config.sdk_key.clone(),
        );
        let processor: Box<dyn UpdateProcessor> = if self.config.streaming {
            Box::new(StreamingUpdateProcessor::new(
                self.config.endpoints.streaming_base_uri.clone(),
                self.config.sdk_key.clone(),
                self.config.initial_reconnect_delay,
                requestor,
            ))
        } else {
            Box::new(PollingUpdateProcessor::new(
                requestor,
                self.config.poll_interval,
            ))
        };
        processor.start(
            Arc::clone(&self.store),
            init_tx,
            self.shutdown_tx.subscribe(),
        );
    }

    /// Whether an initial dataset has been stored.
    pub fn initialized(&self) -> bool {
        self.store.initialized()
    }

    /// Waits until the first dataset arrives, a permanent error occurs, or
    /// the timeout elapses.
    pub async fn wait_for_initialization(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.init_rx.clone();
        tokio::time::timeout(timeout, async move {
            loop {
                let state = rx.borrow().clone();
                if let Some(outcome) = state {
                    return outcome;
                }
                rx.changed()
                    .await
                    .map_err(|_| Error::InitializationClosed)?;
            }
        })
        .await
        .map_err(|_| Error::InitializationTimeout)?
    }

    /// Evaluates a flag, returning the value as-is.
    pub fn variation(&self, user: &User, flag_key: &str, default: impl Into<Value>) -> Value {
        self.evaluate_core(user, flag_key, default.into(), false, None)
            .value
            .expect("evaluation detail always carries a value")
    }

    /// Evaluates a flag, returning the full detail with value, variation
    /// index, and reason.
    pub fn variation_detail(
        &self,
        user: &User,
        flag_key: &str,
        default: impl Into<Value>,
    ) -> Detail {
        self.evaluate_core(user, flag_key, default.into(), true, None)
    }

    /// Evaluates a boolean flag.
    pub fn bool_variation(&self, user: &User, flag_key: &str, default: bool) -> bool {
        self.typed(user, flag_key, default.into(), false, type_is_bool)
            .as_bool()
            .unwrap_or(default)
    }

    /// Evaluates a string flag.
    pub fn str_variation(&self, user: &User, flag_key: &str, default: impl Into<String>) -> String {
        let default = default.into();
        match self.typed(user, flag_key, default.clone().into(), false, type_is_string) {
            Value::Str(s) => s,
            _ => default,
        }
    }

    /// Evaluates a numeric flag as a float.
    pub fn float_variation(&self, user: &User, flag_key: &str, default: f64) -> f64 {
        self.typed(user, flag_key, default.into(), false, type_is_number)
            .as_float()
            .unwrap_or(default)
    }

    /// Evaluates a numeric flag as an integer.
    pub fn int_variation(&self, user: &User, flag_key: &str, default: i64) -> i64 {
        self.typed(user, flag_key, default.into(), false, type_is_int)
            .as_int()
            .unwrap_or(default)
    }

    /// Evaluates a flag of any JSON type.
    pub fn json_variation(&self, user: &User, flag_key: &str, default: Value) -> Value {
        self.variation(user, flag_key, default)
    }

    /// Detail variant of [`Client::bool_variation`].
    pub fn bool_variation_detail(&self, user: &User, flag_key: &str, default: bool) -> Detail {
        self.evaluate_core(user, flag_key, default.into(), true, Some(type_is_bool))
    }

    /// Detail variant of [`Client::str_variation`].
    pub fn str_variation_detail(
        &self,
        user: &User,
        flag_key: &str,
        default: impl Into<String>,
    ) -> Detail {
        self.evaluate_core(
            user,
            flag_key,
            Value::Str(default.into()),
            true,
            Some(type_is_string),
        )
    }

    /// Detail variant of [`Client::float_variation`].
    pub fn float_variation_detail(&self, user: &User, flag_key: &str, default: f64) -> Detail {
        self.evaluate_core(user, flag_key, default.into(), true, Some(type_is_number))
    }

    /// Detail variant of [`Client::int_variation`].
    pub fn int_variation_detail(&self, user: &User, flag_key: &str, default: i64) -> Detail {
        self.evaluate_core(user, flag_key, default.into(), true, Some(type_is_int))
    }

    /// Detail variant of [`Client::json_variation`].
    pub fn json_variation_detail(&self, user: &User, flag_key: &str, default: Value) -> Detail {
        self.variation_detail(user, flag_key, default)
    }

    /// Registers a user with the events service.
    pub fn identify(&self, user: &User) {
        if user.key().is_empty() {
            log::warn!(target: "darklaunch", "ignoring identify for user without key");
            return;
        }
        self.send_event(InputEvent::Identify(IdentifyEvent {
            base: BaseEvent::new(user.clone()),
        }));
    }

    /// Reports an application-defined event.
    pub fn track(&self, user: &User, key: impl Into<String>, data: Value, metric_value: Option<f64>) {
        if user.key().is_empty() {
            log::warn!(target: "darklaunch", "ignoring track for user without key");
            return;
        }
        self.send_event(InputEvent::Custom(CustomEvent {
            base: BaseEvent::new(user.clone()),
            key: key.into(),
            data,
            metric_value,
        }));
    }

    /// Flushes pending analytics events.
    pub async fn flush(&self) {
        if let Some(events) = self.events.load_full() {
            events.flush().await;
        }
    }

    /// Shuts down background tasks: stops the update processor, flushes and
    /// drains the event pipeline.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(events) = self.events.swap(None) {
            events.close().await;
        }
    }

    fn typed(
        &self,
        user: &User,
        flag_key: &str,
        default: Value,
        with_reasons: bool,
        type_check: fn(&Value) -> bool,
    ) -> Value {
        self.evaluate_core(user, flag_key, default, with_reasons, Some(type_check))
            .value
            .expect("evaluation detail always carries a value")
    }

    /// The one evaluation path: resolves the flag, evaluates, applies the
    /// type check, substitutes the default, and reports events. The returned
    /// detail always carries a value.
    fn evaluate_core(
        &self,
        user: &User,
        flag_key: &str,
        default: Value,
        with_reasons: bool,
        type_check: Option<fn(&Value) -> bool>,
    ) -> Detail {
        if user.key().is_empty() {
            log::warn!(target: "darklaunch",
                flag_key;
                "user has no key, serving default value");
            return detail_with_default(Detail::error(ErrorKind::UserNotSpecified), default);
        }

        if !self.store.initialized() {
            log::warn!(target: "darklaunch",
                flag_key;
                "evaluation before initialization, serving default value");
            let detail = detail_with_default(Detail::error(ErrorKind::ClientNotReady), default);
            self.send_unknown_flag_event(user, flag_key, &detail, with_reasons);
            return detail;
        }

        let Some(flag) = self.store.flag(flag_key) else {
            log::info!(target: "darklaunch",
                flag_key;
                "unknown flag, serving default value");
            let detail = detail_with_default(Detail::error(ErrorKind::FlagNotFound), default);
            self.send_unknown_flag_event(user, flag_key, &detail, with_reasons);
            return detail;
        };

        let (mut detail, prereq_events) = evaluate(&self.store, &flag, user);

        if let (Some(check), Some(value)) = (type_check, &detail.value) {
            if !check(value) {
                log::warn!(target: "darklaunch",
                    flag_key;
                    "flag value does not match the requested type, serving default value");
                detail = Detail::error(ErrorKind::WrongType);
            }
        }
        let detail = detail_with_default(detail, default.clone());

        for prereq in &prereq_events {
            self.send_prereq_event(user, prereq, with_reasons);
        }
        self.send_event(InputEvent::FeatureRequest(FeatureRequestEvent {
            base: BaseEvent::new(user.clone()),
            key: flag.key.clone(),
            value: detail.value.clone().unwrap_or(Value::Null),
            default,
            variation: detail.variation_index,
            version: Some(flag.version),
            reason: (with_reasons || flag.is_track_reason(&detail.reason))
                .then(|| detail.reason.clone()),
            prereq_of: None,
            track_events: flag.track_events || flag.is_track_reason(&detail.reason),
            debug_events_until_date: flag.debug_events_until_date,
        }));

        detail
    }

    fn send_prereq_event(&self, user: &User, prereq: &PrerequisiteEvent, with_reasons: bool) {
        let flag: &FeatureFlag = &prereq.flag;
        self.send_event(InputEvent::FeatureRequest(FeatureRequestEvent {
            base: BaseEvent::new(user.clone()),
            key: flag.key.clone(),
            value: prereq.detail.value.clone().unwrap_or(Value::Null),
            default: Value::Null,
            variation: prereq.detail.variation_index,
            version: Some(flag.version),
            reason: (with_reasons || flag.is_track_reason(&prereq.detail.reason))
                .then(|| prereq.detail.reason.clone()),
            prereq_of: Some(prereq.prereq_of.clone()),
            track_events: flag.track_events || flag.is_track_reason(&prereq.detail.reason),
            debug_events_until_date: flag.debug_events_until_date,
        }));
    }

    fn send_unknown_flag_event(
        &self,
        user: &User,
        flag_key: &str,
        detail: &Detail,
        with_reasons: bool,
    ) {
        self.send_event(InputEvent::FeatureRequest(FeatureRequestEvent {
            base: BaseEvent::new(user.clone()),
            key: ArcStr::from(flag_key),
            value: detail.value.clone().unwrap_or(Value::Null),
            default: detail.value.clone().unwrap_or(Value::Null),
            variation: None,
            version: None,
            reason: with_reasons.then(|| detail.reason.clone()),
            prereq_of: None,
            track_events: false,
            debug_events_until_date: None,
        }));
    }

    fn send_event(&self, event: InputEvent) {
        if let Some(events) = self.events.load_full() {
            events.send(event);
        }
    }
}

fn detail_with_default(mut detail: Detail, default: Value) -> Detail {
    if detail.value.is_none() {
        detail.value = Some(default);
    }
    detail
}

fn type_is_bool(value: &Value) -> bool {
    matches!(value, Value::Bool(_))
}

fn type_is_string(value: &Value) -> bool {
    matches!(value, Value::Str(_))
}

fn type_is_number(value: &Value) -> bool {
    matches!(value, Value::Number(_))
}

fn type_is_int(value: &Value) -> bool {
    value.is_int()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Client;
    use crate::eval::{ErrorKind, Reason};
    use crate::store::AllData;
    use crate::{Config, User, Value};

    fn offline_config() -> Config {
        Config::builder("sdk-key").offline(true).build()
    }

    fn seeded_client(flags_json: serde_json::Value) -> Client {
        let client = Client::build(
            Config::builder("sdk-key").events_enabled(false).offline(true).build(),
        )
        .unwrap();
        let data: AllData = serde_json::from_value(serde_json::json!({
            "flags": flags_json,
            "segments": {},
        }))
        .unwrap();
        client.store.init(data);
        client
    }

    #[test]
    fn build_rejects_bad_endpoints() {
        let mut config = Config::builder("sdk-key").build();
        config.endpoints.base_uri = "not a uri".to_owned();
        assert!(Client::build(config).is_err());
    }

    #[tokio::test]
    async fn offline_client_initializes_immediately() {
        let client = Client::build(offline_config()).unwrap();
        assert!(!client.initialized());
        client.start();
        assert!(client.initialized());
        client
            .wait_for_initialization(Duration::from_millis(100))
            .await
            .unwrap();

        // No data: defaults everywhere.
        let user = User::with_key("u").build();
        assert!(!client.bool_variation(&user, "missing", false));
        let detail = client.bool_variation_detail(&user, "missing", true);
        assert_eq!(detail.value, Some(Value::Bool(true)));
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::FlagNotFound
            }
        );
    }

    #[tokio::test]
    async fn evaluation_before_initialization_serves_default() {
        let client = Client::build(
            Config::builder("sdk-key").events_enabled(false).offline(true).build(),
        )
        .unwrap();
        // Not started: the store has no data.
        let user = User::with_key("u").build();
        let detail = client.str_variation_detail(&user, "f", "fallback");
        assert_eq!(detail.value, Some(Value::Str("fallback".into())));
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::ClientNotReady
            }
        );
    }

    #[test]
    fn typed_variations_serve_matching_values() {
        let client = seeded_client(serde_json::json!({
            "bool-flag": {"key": "bool-flag", "version": 1, "on": false,
                          "offVariation": 0, "variations": [true, false], "salt": "s"},
            "str-flag": {"key": "str-flag", "version": 1, "on": false,
                         "offVariation": 0, "variations": ["hello"], "salt": "s"},
            "num-flag": {"key": "num-flag", "version": 1, "on": false,
                         "offVariation": 0, "variations": [2.5], "salt": "s"},
            "int-flag": {"key": "int-flag", "version": 1, "on": false,
                         "offVariation": 0, "variations": [7], "salt": "s"},
        }));
        let user = User::with_key("u").build();

        assert!(client.bool_variation(&user, "bool-flag", false));
        assert_eq!(client.str_variation(&user, "str-flag", "d"), "hello");
        assert_eq!(client.float_variation(&user, "num-flag", 0.0), 2.5);
        assert_eq!(client.int_variation(&user, "int-flag", 0), 7);
        assert_eq!(
            client.json_variation(&user, "str-flag", Value::Null),
            Value::Str("hello".into())
        );
    }

    #[test]
    fn type_mismatch_serves_default_with_wrong_type_reason() {
        let client = seeded_client(serde_json::json!({
            "str-flag": {"key": "str-flag", "version": 1, "on": false,
                         "offVariation": 0, "variations": ["hello"], "salt": "s"},
            "num-flag": {"key": "num-flag", "version": 1, "on": false,
                         "offVariation": 0, "variations": [2.5], "salt": "s"},
        }));
        let user = User::with_key("u").build();

        assert!(!client.bool_variation(&user, "str-flag", false));
        let detail = client.bool_variation_detail(&user, "str-flag", false);
        assert_eq!(detail.value, Some(Value::Bool(false)));
        assert_eq!(detail.variation_index, None);
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::WrongType
            }
        );

        // A non-integer number fails the integer accessor.
        assert_eq!(client.int_variation(&user, "num-flag", 9), 9);
    }

    #[test]
    fn empty_user_key_serves_default() {
        let client = seeded_client(serde_json::json!({
            "f": {"key": "f", "version": 1, "on": false,
                  "offVariation": 0, "variations": [true, false], "salt": "s"},
        }));
        let user = User::with_key("").build();
        let detail = client.bool_variation_detail(&user, "f", false);
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::UserNotSpecified
            }
        );
    }

    #[test]
    fn variation_detail_reports_evaluation_reason() {
        let client = seeded_client(serde_json::json!({
            "f": {"key": "f", "version": 1, "on": true, "salt": "s",
                  "variations": ["A", "B"],
                  "targets": [{"values": ["u"], "variation": 1}],
                  "fallthrough": {"variation": 0}},
        }));
        let user = User::with_key("u").build();
        let detail = client.variation_detail(&user, "f", "d");
        assert_eq!(detail.value, Some(Value::Str("B".into())));
        assert_eq!(detail.variation_index, Some(1));
        assert_eq!(detail.reason, Reason::TargetMatch);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_safe_without_start() {
        let client = Client::build(offline_config()).unwrap();
        client.close().await;
        client.close().await;
    }
}
