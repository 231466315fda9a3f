//! The analytics event pipeline: a bounded producer/consumer that summarizes
//! flag evaluations and ships batched JSON payloads back to the control
//! plane.

mod output;
mod processor;
mod sender;
mod summarizer;

pub use processor::EventProcessor;

pub(crate) use sender::EventSender;

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::eval::Reason;
use crate::str::ArcStr;
use crate::{User, Value};

/// Settings for the event pipeline.
#[derive(Debug, Clone)]
pub struct EventsConfiguration {
    /// Bound of the inbound event channel; events past it are dropped.
    pub capacity: usize,
    /// How often pending events and the summary are flushed to the sender.
    pub flush_interval: Duration,
    /// Bound of the user-key dedup set.
    pub user_keys_capacity: usize,
    /// How often the user-key dedup set is fully purged.
    pub user_keys_flush_interval: Duration,
    /// Inline full users in feature and custom events instead of emitting
    /// index events.
    pub inline_users_in_events: bool,
    /// Redact every user attribute from event payloads.
    pub all_attributes_private: bool,
    /// Attribute names to redact from event payloads for all users.
    pub private_attribute_names: HashSet<String>,
    /// Delay before the sender's single retry of a failed delivery.
    pub retry_delay: Duration,
}

impl Default for EventsConfiguration {
    fn default() -> Self {
        EventsConfiguration {
            capacity: 10_000,
            flush_interval: Duration::from_secs(5),
            user_keys_capacity: 1_000,
            user_keys_flush_interval: Duration::from_secs(300),
            inline_users_in_events: false,
            all_attributes_private: false,
            private_attribute_names: HashSet::new(),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Common fields of every input event.
#[derive(Debug, Clone)]
pub struct BaseEvent {
    /// Event creation time, epoch milliseconds.
    pub creation_date: u64,
    /// The user the event concerns.
    pub user: User,
}

impl BaseEvent {
    /// A base event stamped with the current time.
    pub fn new(user: User) -> Self {
        BaseEvent {
            creation_date: now_millis(),
            user,
        }
    }
}

/// A flag evaluation, as reported into the pipeline.
#[derive(Debug, Clone)]
pub struct FeatureRequestEvent {
    /// Timestamp and user.
    pub base: BaseEvent,
    /// Key of the evaluated flag.
    pub key: ArcStr,
    /// The value served to the caller (the default when evaluation produced
    /// none).
    pub value: Value,
    /// The caller-supplied default value.
    pub default: Value,
    /// Index of the served variation, if one was chosen.
    pub variation: Option<usize>,
    /// Version of the evaluated flag; unset when the flag was unknown.
    pub version: Option<u64>,
    /// Evaluation reason, when the caller requested it.
    pub reason: Option<Reason>,
    /// Key of the parent flag when this evaluation was a prerequisite check.
    pub prereq_of: Option<ArcStr>,
    /// Whether the flag asks for full event output.
    pub track_events: bool,
    /// Debug-event deadline from the flag, epoch milliseconds.
    pub debug_events_until_date: Option<u64>,
}

/// An application-defined event reported through `track`.
#[derive(Debug, Clone)]
pub struct CustomEvent {
    /// Timestamp and user.
    pub base: BaseEvent,
    /// The event key.
    pub key: String,
    /// Attached payload data, if any.
    pub data: Value,
    /// Numeric value for metrics, if any.
    pub metric_value: Option<f64>,
}

/// A user registration event reported through `identify`.
#[derive(Debug, Clone)]
pub struct IdentifyEvent {
    /// Timestamp and user.
    pub base: BaseEvent,
}

/// Any event accepted by the processor.
#[derive(Debug, Clone)]
pub enum InputEvent {
    /// A flag evaluation.
    FeatureRequest(FeatureRequestEvent),
    /// An application-defined event.
    Custom(CustomEvent),
    /// A user registration.
    Identify(IdentifyEvent),
}

/// Current time as epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
