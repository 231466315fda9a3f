//! Flag evaluation: the pure algorithm over flag, segment, and user data.
//!
//! Evaluation never fails with an `Err`: error conditions are encoded as a
//! [`Reason::Error`] inside the returned [`Detail`], and the caller falls back
//! to its default value.

mod bucket;
mod evaluate;
mod operators;

pub use evaluate::{evaluate, FlagLookup, PrerequisiteEvent};
pub use operators::Op;

pub(crate) use bucket::bucket_user;

use serde::Serialize;

use crate::str::ArcStr;
use crate::Value;

/// The result of evaluating a flag for a user.
#[derive(Debug, Clone, PartialEq)]
pub struct Detail {
    /// The evaluated value, or `None` when evaluation produced no variation
    /// (off flag without an off variation, or an error) and the caller's
    /// default applies.
    pub value: Option<Value>,
    /// Index of the chosen variation, when one was chosen.
    pub variation_index: Option<usize>,
    /// Why this value was chosen.
    pub reason: Reason,
}

impl Detail {
    pub(crate) fn error(error_kind: ErrorKind) -> Detail {
        Detail {
            value: None,
            variation_index: None,
            reason: Reason::Error { error_kind },
        }
    }

    /// The evaluated value, or `default` if evaluation produced none.
    pub fn value_or(&self, default: Value) -> Value {
        self.value.clone().unwrap_or(default)
    }
}

/// Why an evaluation produced its value.
///
/// Serializes to the wire reason object, e.g.
/// `{"kind":"RULE_MATCH","ruleIndex":1,"ruleId":"abc"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// The flag is off and the off variation (if any) applied.
    Off,
    /// The user key is individually targeted.
    TargetMatch,
    /// A rule matched. Instances are precomputed per rule at flag
    /// deserialization and reused on every evaluation.
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        /// Position of the matched rule in the flag's rule list.
        rule_index: usize,
        /// Stable identifier of the matched rule.
        rule_id: ArcStr,
    },
    /// A prerequisite flag did not produce the required variation. Instances
    /// are precomputed per prerequisite at flag deserialization.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed {
        /// Key of the failed prerequisite flag.
        prerequisite_key: ArcStr,
    },
    /// The flag is on and no target or rule matched.
    Fallthrough,
    /// Evaluation failed; the caller's default value applies.
    #[serde(rename_all = "camelCase")]
    Error {
        /// What went wrong.
        error_kind: ErrorKind,
    },
}

/// Evaluation error categories, serialized as the `errorKind` reason field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The client has not received an initial dataset yet.
    ClientNotReady,
    /// The requested flag does not exist in the store.
    FlagNotFound,
    /// The user was missing or had an empty key.
    UserNotSpecified,
    /// The flag data violates a model invariant (bad variation index, rule
    /// with neither variation nor rollout, empty rollout).
    MalformedFlag,
    /// A typed accessor was called for a flag of a different type.
    WrongType,
    /// An unexpected internal failure.
    Exception,
}
