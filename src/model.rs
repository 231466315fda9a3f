//! The flag and segment data model, matching the service's JSON field for
//! field.
//!
//! Flags deserialize through an intermediate wire struct so that per-rule and
//! per-prerequisite evaluation reasons can be computed once, at parse time,
//! and reused on every evaluation.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::eval::{Op, Reason};
use crate::str::ArcStr;
use crate::Value;

/// A feature flag: candidate values plus the targeting configuration that
/// picks one of them for a user.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "FeatureFlagWire")]
pub struct FeatureFlag {
    /// The flag's key.
    pub key: ArcStr,
    /// Monotonically increasing version assigned by the control plane.
    pub version: u64,
    /// Whether targeting is on. Off flags short-circuit to the off variation.
    pub on: bool,
    /// Deletion marker; a deleted flag acts as a versioned tombstone.
    pub deleted: bool,
    /// Salt mixed into rollout bucketing.
    pub salt: String,
    /// Candidate result values, referenced by index.
    pub variations: Vec<Value>,
    /// Variation served while the flag is off. When unset, an off flag
    /// produces no value.
    pub off_variation: Option<usize>,
    /// Served when the flag is on and no target or rule matched.
    pub fallthrough: VariationOrRollout,
    /// Explicit user-key overrides, checked before rules.
    pub targets: Vec<Target>,
    /// Ordered rules; the first full match wins.
    pub rules: Vec<Rule>,
    /// Flags that must evaluate to a specific variation first.
    pub prerequisites: Vec<Prerequisite>,
    /// Whether the flag is exposed to client-side SDKs.
    pub client_side: bool,
    /// Whether evaluations of this flag emit full feature events.
    pub track_events: bool,
    /// Whether fallthrough evaluations emit full feature events.
    pub track_events_fallthrough: bool,
    /// While this epoch-millisecond deadline is in the future, evaluations
    /// additionally emit debug events.
    pub debug_events_until_date: Option<u64>,
}

impl FeatureFlag {
    /// Whether an evaluation with the given reason should be tracked per the
    /// flag's own settings.
    pub(crate) fn is_track_reason(&self, reason: &Reason) -> bool {
        match reason {
            Reason::RuleMatch { rule_index, .. } => self
                .rules
                .get(*rule_index)
                .is_some_and(|rule| rule.track_events),
            Reason::Fallthrough => self.track_events_fallthrough,
            _ => false,
        }
    }
}

/// An explicit user-key to variation override.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// User keys this target applies to.
    #[serde(default)]
    pub values: HashSet<String>,
    /// Variation served to those users.
    pub variation: usize,
}

/// Either a fixed variation or a weighted rollout; exactly one side must be
/// populated, anything else is malformed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    /// Fixed variation index.
    #[serde(default)]
    pub variation: Option<usize>,
    /// Weighted rollout across variations.
    #[serde(default)]
    pub rollout: Option<Rollout>,
}

/// A probabilistic assignment of users to variations by hash bucket.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    /// Weighted variations; weights are expressed in units of 0.001%.
    pub variations: Vec<WeightedVariation>,
    /// Attribute to bucket by instead of the user key.
    #[serde(default)]
    pub bucket_by: Option<String>,
}

/// One slice of a rollout.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    /// Variation index this slice serves.
    pub variation: usize,
    /// Slice width; all weights in a rollout sum to 100000.
    pub weight: u32,
}

/// A targeting rule: AND-ed clauses producing a variation or rollout.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Stable rule identifier assigned by the control plane.
    pub id: ArcStr,
    /// Conditions that must all match.
    pub clauses: Vec<Clause>,
    /// Whether matches of this rule emit full feature events.
    pub track_events: bool,
    /// What a match serves.
    pub variation_or_rollout: VariationOrRollout,
    // Precomputed at deserialization; cloned (refcount bump) per evaluation.
    pub(crate) match_reason: Reason,
}

/// A negatable predicate over one user attribute.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    /// Attribute to test.
    pub attribute: String,
    /// Operator applied between the attribute and each clause value.
    pub op: Op,
    /// Candidate values; matching any one of them matches the clause.
    #[serde(default)]
    pub values: Vec<Value>,
    /// Inverts the result after match determination.
    #[serde(default)]
    pub negate: bool,
}

/// A dependency on another flag evaluating to a specific variation.
#[derive(Debug, Clone)]
pub struct Prerequisite {
    /// Key of the prerequisite flag.
    pub key: ArcStr,
    /// Variation the prerequisite must produce.
    pub variation: usize,
    // Precomputed at deserialization; cloned (refcount bump) per evaluation.
    pub(crate) failed_reason: Reason,
}

/// A named user cohort referenced from clauses via the `segmentMatch`
/// operator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// The segment's key.
    pub key: String,
    /// Monotonically increasing version assigned by the control plane.
    #[serde(default)]
    pub version: u64,
    /// Deletion marker; a deleted segment acts as a versioned tombstone.
    #[serde(default)]
    pub deleted: bool,
    /// Salt mixed into segment rule bucketing.
    #[serde(default)]
    pub salt: String,
    /// User keys always in the segment.
    #[serde(default)]
    pub included: HashSet<String>,
    /// User keys never in the segment; checked after `included`.
    #[serde(default)]
    pub excluded: HashSet<String>,
    /// Rules admitting further users.
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
}

/// A segment membership rule. Unlike flag rules, segment rules cannot
/// reference other segments.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    /// Conditions that must all match.
    #[serde(default)]
    pub clauses: Vec<Clause>,
    /// When set, only this fraction (in units of 0.001%) of matching users is
    /// admitted, chosen by hash bucket.
    #[serde(default)]
    pub weight: Option<u32>,
    /// Attribute to bucket by instead of the user key.
    #[serde(default)]
    pub bucket_by: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeatureFlagWire {
    key: String,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    on: bool,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    salt: String,
    #[serde(default)]
    variations: Vec<Value>,
    #[serde(default)]
    off_variation: Option<usize>,
    #[serde(default)]
    fallthrough: VariationOrRollout,
    #[serde(default)]
    targets: Vec<Target>,
    #[serde(default)]
    rules: Vec<RuleWire>,
    #[serde(default)]
    prerequisites: Vec<PrerequisiteWire>,
    #[serde(default)]
    client_side: bool,
    #[serde(default)]
    track_events: bool,
    #[serde(default)]
    track_events_fallthrough: bool,
    #[serde(default)]
    debug_events_until_date: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleWire {
    #[serde(default)]
    id: String,
    #[serde(default)]
    clauses: Vec<Clause>,
    #[serde(default)]
    track_events: bool,
    #[serde(flatten)]
    variation_or_rollout: VariationOrRollout,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrerequisiteWire {
    key: String,
    variation: usize,
}

impl From<FeatureFlagWire> for FeatureFlag {
    fn from(wire: FeatureFlagWire) -> Self {
        let rules = wire
            .rules
            .into_iter()
            .enumerate()
            .map(|(rule_index, rule)| {
                let id: ArcStr = rule.id.into();
                Rule {
                    match_reason: Reason::RuleMatch {
                        rule_index,
                        rule_id: id.clone(),
                    },
                    id,
                    clauses: rule.clauses,
                    track_events: rule.track_events,
                    variation_or_rollout: rule.variation_or_rollout,
                }
            })
            .collect();

        let prerequisites = wire
            .prerequisites
            .into_iter()
            .map(|prereq| {
                let key: ArcStr = prereq.key.into();
                Prerequisite {
                    failed_reason: Reason::PrerequisiteFailed {
                        prerequisite_key: key.clone(),
                    },
                    key,
                    variation: prereq.variation,
                }
            })
            .collect();

        FeatureFlag {
            key: wire.key.into(),
            version: wire.version,
            on: wire.on,
            deleted: wire.deleted,
            salt: wire.salt,
            variations: wire.variations,
            off_variation: wire.off_variation,
            fallthrough: wire.fallthrough,
            targets: wire.targets,
            rules,
            prerequisites,
            client_side: wire.client_side,
            track_events: wire.track_events,
            track_events_fallthrough: wire.track_events_fallthrough,
            debug_events_until_date: wire.debug_events_until_date,
        }
    }
}
