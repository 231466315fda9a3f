//! The wire format of the event batch POSTed to `/bulk`.

use std::collections::HashMap;

use serde::Serialize;

use crate::eval::Reason;
use crate::str::ArcStr;
use crate::{User, Value};

use super::summarizer::EventSummary;
use super::{CustomEvent, EventsConfiguration, FeatureRequestEvent, IdentifyEvent};

/// One element of the event batch; the `kind` tag selects the wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub(crate) enum OutputEvent {
    /// Full detail of one flag evaluation.
    #[serde(rename = "feature")]
    Feature(FeatureOutput),
    /// Same fields as `feature`, emitted while the flag's debug deadline is
    /// active; the user is always inlined.
    #[serde(rename = "debug")]
    Debug(FeatureOutput),
    /// A user registration.
    #[serde(rename = "identify")]
    Identify(IdentifyOutput),
    /// First sighting of a user within a flush window.
    #[serde(rename = "index")]
    Index(IndexOutput),
    /// An application-defined event.
    #[serde(rename = "custom")]
    Custom(CustomOutput),
    /// Per-flush aggregate of feature requests.
    #[serde(rename = "summary")]
    Summary(SummaryOutput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FeatureOutput {
    creation_date: u64,
    key: ArcStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<usize>,
    value: Value,
    default: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    prereq_of: Option<ArcStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<Reason>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IdentifyOutput {
    creation_date: u64,
    key: String,
    user: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IndexOutput {
    creation_date: u64,
    user: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CustomOutput {
    creation_date: u64,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_key: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    metric_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SummaryOutput {
    start_date: u64,
    end_date: u64,
    features: HashMap<ArcStr, FeatureSummary>,
}

#[derive(Debug, Clone, Serialize)]
struct FeatureSummary {
    default: Value,
    counters: Vec<CounterOutput>,
}

#[derive(Debug, Clone, Serialize)]
struct CounterOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    unknown: bool,
    value: Value,
    count: u64,
}

impl OutputEvent {
    /// A `feature` event, inlining the user or referencing it by key per
    /// configuration.
    pub(crate) fn feature(event: &FeatureRequestEvent, config: &EventsConfiguration) -> Self {
        OutputEvent::Feature(FeatureOutput::from_event(event, config, false))
    }

    /// A `debug` event; the user is always inlined.
    pub(crate) fn debug(event: &FeatureRequestEvent, config: &EventsConfiguration) -> Self {
        OutputEvent::Debug(FeatureOutput::from_event(event, config, true))
    }

    pub(crate) fn identify(event: &IdentifyEvent, config: &EventsConfiguration) -> Self {
        OutputEvent::Identify(IdentifyOutput {
            creation_date: event.base.creation_date,
            key: event.base.user.key().to_owned(),
            user: event_user(&event.base.user, config),
        })
    }

    pub(crate) fn index(
        creation_date: u64,
        user: &User,
        config: &EventsConfiguration,
    ) -> Self {
        OutputEvent::Index(IndexOutput {
            creation_date,
            user: event_user(user, config),
        })
    }

    pub(crate) fn custom(event: &CustomEvent, config: &EventsConfiguration) -> Self {
        let (user, user_key) = inline_or_key(&event.base.user, config, false);
        OutputEvent::Custom(CustomOutput {
            creation_date: event.base.creation_date,
            key: event.key.clone(),
            user,
            user_key,
            data: event.data.clone(),
            metric_value: event.metric_value,
        })
    }

    pub(crate) fn summary(summary: EventSummary) -> Self {
        let mut features: HashMap<ArcStr, FeatureSummary> = HashMap::new();
        for (key, counter) in summary.counters {
            let feature = features
                .entry(key.key)
                .or_insert_with(|| FeatureSummary {
                    default: counter.default.clone(),
                    counters: Vec::new(),
                });
            feature.counters.push(CounterOutput {
                variation: key.variation,
                version: key.version,
                unknown: key.version.is_none(),
                value: counter.value,
                count: counter.count,
            });
        }
        OutputEvent::Summary(SummaryOutput {
            start_date: summary.start_date,
            end_date: summary.end_date,
            features,
        })
    }
}

impl FeatureOutput {
    fn from_event(
        event: &FeatureRequestEvent,
        config: &EventsConfiguration,
        force_inline: bool,
    ) -> Self {
        let (user, user_key) = inline_or_key(&event.base.user, config, force_inline);
        FeatureOutput {
            creation_date: event.base.creation_date,
            key: event.key.clone(),
            user,
            user_key,
            version: event.version,
            variation: event.variation,
            value: event.value.clone(),
            default: event.default.clone(),
            prereq_of: event.prereq_of.clone(),
            reason: event.reason.clone(),
        }
    }
}

fn inline_or_key(
    user: &User,
    config: &EventsConfiguration,
    force_inline: bool,
) -> (Option<serde_json::Value>, Option<String>) {
    if force_inline || config.inline_users_in_events {
        (Some(event_user(user, config)), None)
    } else {
        (None, Some(user.key().to_owned()))
    }
}

/// Serializes a user for an event payload, redacting private attributes.
///
/// An attribute is private when the configuration says all attributes are,
/// when its name is in the global private set, or when the user itself marked
/// it private. Redacted names are listed under `privateAttrs`; the key is
/// never redacted.
fn event_user(user: &User, config: &EventsConfiguration) -> serde_json::Value {
    let is_private = |name: &str| {
        config.all_attributes_private
            || config.private_attribute_names.contains(name)
            || user.private_attribute_names().contains(name)
    };

    let mut out = serde_json::Map::new();
    let mut private_attrs: Vec<String> = Vec::new();
    out.insert("key".to_owned(), user.key().into());

    for (name, value) in user.set_attributes() {
        if is_private(name) {
            private_attrs.push(name.to_owned());
        } else {
            out.insert(name.to_owned(), value.into());
        }
    }

    let mut custom = serde_json::Map::new();
    for (name, value) in user.custom_attributes() {
        if is_private(name) {
            private_attrs.push(name.clone());
        } else {
            custom.insert(name.clone(), value.clone().into());
        }
    }
    if !custom.is_empty() {
        out.insert("custom".to_owned(), serde_json::Value::Object(custom));
    }

    if !private_attrs.is_empty() {
        private_attrs.sort();
        out.insert(
            "privateAttrs".to_owned(),
            serde_json::Value::Array(private_attrs.into_iter().map(Into::into).collect()),
        );
    }

    serde_json::Value::Object(out)
}
