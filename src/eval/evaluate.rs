//! The flag evaluation algorithm: prerequisites, targets, rules, fallthrough.

use crate::model::{FeatureFlag, Segment, VariationOrRollout};
use crate::user::User;

use super::operators::clause_matches_user;
use super::{bucket_user, Detail, ErrorKind, Op, Reason};
use crate::model::Clause;
use crate::str::ArcStr;

/// Read access to related flags and segments during evaluation.
///
/// The evaluator resolves prerequisites and `segmentMatch` clauses through
/// this interface; the data store implements it over its current snapshot.
pub trait FlagLookup {
    /// Fetches a flag by key, if present and not deleted.
    fn flag(&self, key: &str) -> Option<FeatureFlag>;
    /// Fetches a segment by key, if present and not deleted.
    fn segment(&self, key: &str) -> Option<Segment>;
}

/// A prerequisite evaluation performed while evaluating a parent flag.
///
/// Each one becomes a feature-request event attributed to the parent via
/// `prereq_of`, whether or not the prerequisite was satisfied.
#[derive(Debug, Clone)]
pub struct PrerequisiteEvent {
    /// The prerequisite flag, as fetched during evaluation.
    pub flag: FeatureFlag,
    /// Key of the flag whose evaluation required this one.
    pub prereq_of: ArcStr,
    /// The prerequisite's own evaluation result.
    pub detail: Detail,
}

/// Evaluates a flag for a user.
///
/// Returns the evaluation [`Detail`] and the feature-request side-events
/// produced by prerequisite evaluations, in evaluation order. Errors are
/// reported inside the detail; this function does not fail.
pub fn evaluate(
    lookup: &dyn FlagLookup,
    flag: &FeatureFlag,
    user: &User,
) -> (Detail, Vec<PrerequisiteEvent>) {
    let mut prereq_events = Vec::new();
    let detail = evaluate_internal(lookup, flag, user, &mut prereq_events);
    (detail, prereq_events)
}

fn evaluate_internal(
    lookup: &dyn FlagLookup,
    flag: &FeatureFlag,
    user: &User,
    prereq_events: &mut Vec<PrerequisiteEvent>,
) -> Detail {
    if user.key().is_empty() {
        log::warn!(target: "darklaunch",
            flag_key = &*flag.key;
            "user has no key, cannot evaluate flag");
        return Detail::error(ErrorKind::UserNotSpecified);
    }

    if !flag.on {
        return off_value(flag, Reason::Off);
    }

    for prereq in &flag.prerequisites {
        let Some(prereq_flag) = lookup.flag(&prereq.key) else {
            // Nothing was evaluated, so no event is emitted for this one.
            return off_value(flag, prereq.failed_reason.clone());
        };

        let prereq_detail = evaluate_internal(lookup, &prereq_flag, user, prereq_events);
        let satisfied = prereq_flag.on
            && !matches!(prereq_detail.reason, Reason::Error { .. })
            && prereq_detail.variation_index == Some(prereq.variation);

        prereq_events.push(PrerequisiteEvent {
            flag: prereq_flag,
            prereq_of: flag.key.clone(),
            detail: prereq_detail,
        });

        if !satisfied {
            return off_value(flag, prereq.failed_reason.clone());
        }
    }

    for target in &flag.targets {
        if target.values.contains(user.key()) {
            return variation(flag, target.variation, Reason::TargetMatch);
        }
    }

    for rule in &flag.rules {
        let matched = rule
            .clauses
            .iter()
            .all(|clause| clause_matches(lookup, clause, user));
        if matched {
            return variation_or_rollout(
                flag,
                &rule.variation_or_rollout,
                rule.match_reason.clone(),
                user,
            );
        }
    }

    variation_or_rollout(flag, &flag.fallthrough, Reason::Fallthrough, user)
}

fn off_value(flag: &FeatureFlag, reason: Reason) -> Detail {
    match flag.off_variation {
        Some(index) => variation(flag, index, reason),
        None => Detail {
            value: None,
            variation_index: None,
            reason,
        },
    }
}

fn variation(flag: &FeatureFlag, index: usize, reason: Reason) -> Detail {
    match flag.variations.get(index) {
        Some(value) => Detail {
            value: Some(value.clone()),
            variation_index: Some(index),
            reason,
        },
        None => {
            log::warn!(target: "darklaunch",
                flag_key = &*flag.key, index;
                "variation index out of range");
            Detail::error(ErrorKind::MalformedFlag)
        }
    }
}

fn variation_or_rollout(
    flag: &FeatureFlag,
    vr: &VariationOrRollout,
    reason: Reason,
    user: &User,
) -> Detail {
    if let Some(index) = vr.variation {
        return variation(flag, index, reason);
    }

    let Some(rollout) = &vr.rollout else {
        log::warn!(target: "darklaunch",
            flag_key = &*flag.key;
            "rule or fallthrough has neither variation nor rollout");
        return Detail::error(ErrorKind::MalformedFlag);
    };
    let Some(last) = rollout.variations.last() else {
        log::warn!(target: "darklaunch",
            flag_key = &*flag.key;
            "rollout has no variations");
        return Detail::error(ErrorKind::MalformedFlag);
    };

    let bucket = bucket_user(user, &flag.key, rollout.bucket_by.as_deref(), &flag.salt);
    let mut cumulative = 0.0;
    for weighted in &rollout.variations {
        cumulative += weighted.weight as f64 / 100_000.0;
        if bucket < cumulative {
            return variation(flag, weighted.variation, reason);
        }
    }
    // The weights underflowed the bucket (rounding, or a sum below 100%);
    // such users deliberately land in the last variation.
    variation(flag, last.variation, reason)
}

fn clause_matches(lookup: &dyn FlagLookup, clause: &Clause, user: &User) -> bool {
    if clause.op != Op::SegmentMatch {
        return clause_matches_user(clause, user);
    }
    let matched = clause.values.iter().any(|value| {
        value
            .as_str()
            .and_then(|segment_key| lookup.segment(segment_key))
            .is_some_and(|segment| segment_matches(&segment, user))
    });
    matched != clause.negate
}

/// Tests segment membership. Segment-rule clauses are matched without segment
/// resolution, so segments cannot recurse into each other.
fn segment_matches(segment: &Segment, user: &User) -> bool {
    if segment.included.contains(user.key()) {
        return true;
    }
    if segment.excluded.contains(user.key()) {
        return false;
    }

    for rule in &segment.rules {
        let clauses_match = rule
            .clauses
            .iter()
            .all(|clause| clause_matches_user(clause, user));
        if !clauses_match {
            continue;
        }
        let Some(weight) = rule.weight else {
            return true;
        };
        let bucket = bucket_user(user, &segment.key, rule.bucket_by.as_deref(), &segment.salt);
        if bucket < weight as f64 / 100_000.0 {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{evaluate, FlagLookup};
    use crate::eval::{ErrorKind, Reason};
    use crate::model::{FeatureFlag, Segment};
    use crate::{User, Value};

    #[derive(Default)]
    struct TestStore {
        flags: HashMap<String, FeatureFlag>,
        segments: HashMap<String, Segment>,
    }

    impl TestStore {
        fn with_flag(mut self, json: &str) -> Self {
            let flag: FeatureFlag = serde_json::from_str(json).unwrap();
            self.flags.insert(flag.key.to_string(), flag);
            self
        }

        fn with_segment(mut self, json: &str) -> Self {
            let segment: Segment = serde_json::from_str(json).unwrap();
            self.segments.insert(segment.key.clone(), segment);
            self
        }

        fn flag(&self, key: &str) -> &FeatureFlag {
            &self.flags[key]
        }
    }

    impl FlagLookup for TestStore {
        fn flag(&self, key: &str) -> Option<FeatureFlag> {
            self.flags.get(key).cloned()
        }
        fn segment(&self, key: &str) -> Option<Segment> {
            self.segments.get(key).cloned()
        }
    }

    fn flag(json: &str) -> FeatureFlag {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn off_flag_returns_off_variation() {
        let store = TestStore::default();
        let f = flag(
            r#"{"key":"f1","version":1,"on":false,"offVariation":1,
                "variations":["a","b","c"],"salt":"s","fallthrough":{"variation":0}}"#,
        );
        let (detail, events) = evaluate(&store, &f, &User::with_key("u").build());
        assert_eq!(detail.value, Some(Value::Str("b".into())));
        assert_eq!(detail.variation_index, Some(1));
        assert_eq!(detail.reason, Reason::Off);
        assert!(events.is_empty());
    }

    #[test]
    fn off_flag_without_off_variation_returns_no_value() {
        let store = TestStore::default();
        let f = flag(r#"{"key":"f1","version":1,"on":false,"variations":["a"],"salt":"s"}"#);
        let (detail, _) = evaluate(&store, &f, &User::with_key("u").build());
        assert_eq!(detail.value, None);
        assert_eq!(detail.variation_index, None);
        assert_eq!(detail.reason, Reason::Off);
    }

    #[test]
    fn empty_user_key_is_an_error() {
        let store = TestStore::default();
        let f = flag(r#"{"key":"f1","version":1,"on":true,"variations":["a"],"salt":"s"}"#);
        let (detail, _) = evaluate(&store, &f, &User::with_key("").build());
        assert_eq!(detail.value, None);
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::UserNotSpecified
            }
        );
    }

    #[test]
    fn target_match_precedes_rules() {
        let store = TestStore::default();
        let f = flag(
            r#"{"key":"f1","version":1,"on":true,"salt":"s",
                "variations":["A","B"],
                "targets":[{"values":["u"],"variation":0}],
                "rules":[{"id":"r","clauses":[{"attribute":"key","op":"in","values":["u"]}],"variation":1}],
                "fallthrough":{"variation":1}}"#,
        );
        let (detail, _) = evaluate(&store, &f, &User::with_key("u").build());
        assert_eq!(detail.value, Some(Value::Str("A".into())));
        assert_eq!(detail.variation_index, Some(0));
        assert_eq!(detail.reason, Reason::TargetMatch);
    }

    #[test]
    fn first_matching_rule_wins_with_precomputed_reason() {
        let store = TestStore::default();
        let f = flag(
            r#"{"key":"f1","version":1,"on":true,"salt":"s",
                "variations":["A","B","C"],
                "rules":[
                    {"id":"never","clauses":[{"attribute":"country","op":"in","values":["FR"]}],"variation":2},
                    {"id":"de-rule","clauses":[{"attribute":"country","op":"in","values":["DE"]}],"variation":1}
                ],
                "fallthrough":{"variation":0}}"#,
        );
        let user = User::with_key("u").country("DE").build();
        let (detail, _) = evaluate(&store, &f, &user);
        assert_eq!(detail.variation_index, Some(1));
        assert_eq!(
            detail.reason,
            Reason::RuleMatch {
                rule_index: 1,
                rule_id: "de-rule".into()
            }
        );
    }

    #[test]
    fn rule_with_multiple_clauses_requires_all() {
        let store = TestStore::default();
        let f = flag(
            r#"{"key":"f1","version":1,"on":true,"salt":"s",
                "variations":[false,true],
                "rules":[{"id":"r","clauses":[
                    {"attribute":"country","op":"in","values":["DE"]},
                    {"attribute":"email","op":"endsWith","values":["@example.com"]}
                ],"variation":1}],
                "fallthrough":{"variation":0}}"#,
        );
        let half = User::with_key("u").country("DE").build();
        let full = User::with_key("u").country("DE").email("a@example.com").build();
        assert_eq!(evaluate(&store, &f, &half).0.variation_index, Some(0));
        assert_eq!(evaluate(&store, &f, &full).0.variation_index, Some(1));
    }

    #[test]
    fn fallthrough_rollout_is_deterministic() {
        let store = TestStore::default();
        let f = flag(
            r#"{"key":"hashKey","version":1,"on":true,"salt":"saltyA",
                "variations":["fall-through","go-up","go-down"],
                "fallthrough":{"rollout":{"variations":[
                    {"variation":1,"weight":50000},
                    {"variation":2,"weight":50000}
                ]}}}"#,
        );
        // userKeyA buckets to 0.42157587, userKeyB to 0.67084850.
        let (detail, _) = evaluate(&store, &f, &User::with_key("userKeyA").build());
        assert_eq!(detail.value, Some(Value::Str("go-up".into())));
        assert_eq!(detail.variation_index, Some(1));
        assert_eq!(detail.reason, Reason::Fallthrough);

        let (detail, _) = evaluate(&store, &f, &User::with_key("userKeyB").build());
        assert_eq!(detail.value, Some(Value::Str("go-down".into())));
        assert_eq!(detail.variation_index, Some(2));
    }

    #[test]
    fn rollout_with_undersized_weights_assigns_last_variation() {
        let store = TestStore::default();
        // Weights sum to 30%; userKeyB buckets to 0.67.
        let f = flag(
            r#"{"key":"hashKey","version":1,"on":true,"salt":"saltyA",
                "variations":["one","two"],
                "fallthrough":{"rollout":{"variations":[
                    {"variation":0,"weight":10000},
                    {"variation":1,"weight":20000}
                ]}}}"#,
        );
        let (detail, _) = evaluate(&store, &f, &User::with_key("userKeyB").build());
        assert_eq!(detail.variation_index, Some(1));
        assert_eq!(detail.value, Some(Value::Str("two".into())));
    }

    #[test]
    fn malformed_flags_degrade_to_error() {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = TestStore::default();
        // Fallthrough with neither variation nor rollout.
        let f = flag(
            r#"{"key":"f1","version":1,"on":true,"salt":"s","variations":["a"],
                "fallthrough":{}}"#,
        );
        let (detail, _) = evaluate(&store, &f, &User::with_key("u").build());
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::MalformedFlag
            }
        );

        // Variation index out of range.
        let f = flag(
            r#"{"key":"f1","version":1,"on":true,"salt":"s","variations":["a"],
                "fallthrough":{"variation":9}}"#,
        );
        let (detail, _) = evaluate(&store, &f, &User::with_key("u").build());
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::MalformedFlag
            }
        );

        // Rollout with no variations.
        let f = flag(
            r#"{"key":"f1","version":1,"on":true,"salt":"s","variations":["a"],
                "fallthrough":{"rollout":{"variations":[]}}}"#,
        );
        let (detail, _) = evaluate(&store, &f, &User::with_key("u").build());
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::MalformedFlag
            }
        );
    }

    #[test]
    fn failed_prerequisite_returns_off_value_and_emits_event() {
        let store = TestStore::default().with_flag(
            r#"{"key":"p1","version":2,"on":false,"offVariation":0,
                "variations":["px","py"],"salt":"s"}"#,
        );
        let f = flag(
            r#"{"key":"f1","version":1,"on":true,"salt":"s",
                "variations":["value","off-value"],"offVariation":1,
                "prerequisites":[{"key":"p1","variation":1}],
                "fallthrough":{"variation":0}}"#,
        );
        let (detail, events) = evaluate(&store, &f, &User::with_key("u").build());

        assert_eq!(detail.value, Some(Value::Str("off-value".into())));
        assert_eq!(detail.variation_index, Some(1));
        assert_eq!(
            detail.reason,
            Reason::PrerequisiteFailed {
                prerequisite_key: "p1".into()
            }
        );

        // Exactly one event, for p1's own (off) evaluation.
        assert_eq!(events.len(), 1);
        assert_eq!(&*events[0].flag.key, "p1");
        assert_eq!(&*events[0].prereq_of, "f1");
        assert_eq!(events[0].detail.value, Some(Value::Str("px".into())));
        assert_eq!(events[0].detail.reason, Reason::Off);
    }

    #[test]
    fn satisfied_prerequisites_emit_events_and_chain() {
        let store = TestStore::default()
            .with_flag(
                r#"{"key":"p1","version":2,"on":true,"salt":"s",
                    "variations":[false,true],"fallthrough":{"variation":1},
                    "prerequisites":[{"key":"p2","variation":0}]}"#,
            )
            .with_flag(
                r#"{"key":"p2","version":3,"on":true,"salt":"s",
                    "variations":["yes","no"],"fallthrough":{"variation":0}}"#,
            );
        let f = flag(
            r#"{"key":"f1","version":1,"on":true,"salt":"s",
                "variations":["value","off-value"],"offVariation":1,
                "prerequisites":[{"key":"p1","variation":1}],
                "fallthrough":{"variation":0}}"#,
        );
        let (detail, events) = evaluate(&store, &f, &User::with_key("u").build());

        assert_eq!(detail.value, Some(Value::Str("value".into())));
        assert_eq!(detail.reason, Reason::Fallthrough);

        // Depth-first: p2's event (prereq of p1) precedes p1's (prereq of f1).
        assert_eq!(events.len(), 2);
        assert_eq!(&*events[0].flag.key, "p2");
        assert_eq!(&*events[0].prereq_of, "p1");
        assert_eq!(&*events[1].flag.key, "p1");
        assert_eq!(&*events[1].prereq_of, "f1");
    }

    #[test]
    fn missing_prerequisite_fails_without_event() {
        let store = TestStore::default();
        let f = flag(
            r#"{"key":"f1","version":1,"on":true,"salt":"s",
                "variations":["value","off-value"],"offVariation":1,
                "prerequisites":[{"key":"ghost","variation":0}],
                "fallthrough":{"variation":0}}"#,
        );
        let (detail, events) = evaluate(&store, &f, &User::with_key("u").build());
        assert_eq!(
            detail.reason,
            Reason::PrerequisiteFailed {
                prerequisite_key: "ghost".into()
            }
        );
        assert!(events.is_empty());
    }

    #[test]
    fn prerequisite_satisfied_only_by_exact_variation() {
        let store = TestStore::default().with_flag(
            r#"{"key":"p1","version":2,"on":true,"salt":"s",
                "variations":[false,true],"fallthrough":{"variation":1}}"#,
        );
        let f = flag(
            r#"{"key":"f1","version":1,"on":true,"salt":"s",
                "variations":["value","off-value"],"offVariation":1,
                "prerequisites":[{"key":"p1","variation":0}],
                "fallthrough":{"variation":0}}"#,
        );
        let (detail, events) = evaluate(&store, &f, &User::with_key("u").build());
        assert_eq!(
            detail.reason,
            Reason::PrerequisiteFailed {
                prerequisite_key: "p1".into()
            }
        );
        // The mismatching evaluation still produced an event.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detail.variation_index, Some(1));
    }

    #[test]
    fn segment_match_clause_resolves_segments() {
        let store = TestStore::default()
            .with_segment(
                r#"{"key":"beta","version":1,"salt":"s",
                    "included":["in-user"],"excluded":["out-user"],
                    "rules":[{"clauses":[{"attribute":"email","op":"endsWith","values":["@example.com"]}]}]}"#,
            )
            .with_flag(
                r#"{"key":"f1","version":1,"on":true,"salt":"s",
                    "variations":[false,true],
                    "rules":[{"id":"seg","clauses":[{"attribute":"","op":"segmentMatch","values":["beta"]}],"variation":1}],
                    "fallthrough":{"variation":0}}"#,
            );
        let f = store.flag("f1").clone();

        let included = User::with_key("in-user").build();
        let excluded = User::with_key("out-user").email("x@example.com").build();
        let by_rule = User::with_key("other").email("y@example.com").build();
        let outsider = User::with_key("other").email("y@elsewhere.org").build();

        assert_eq!(evaluate(&store, &f, &included).0.variation_index, Some(1));
        assert_eq!(evaluate(&store, &f, &excluded).0.variation_index, Some(0));
        assert_eq!(evaluate(&store, &f, &by_rule).0.variation_index, Some(1));
        assert_eq!(evaluate(&store, &f, &outsider).0.variation_index, Some(0));
    }

    #[test]
    fn weighted_segment_rule_buckets_users() {
        // userKeyA buckets to 0.42157587 for ("hashKey", "saltyA"); a weight
        // above that admits the user, one below does not.
        let admit = TestStore::default().with_segment(
            r#"{"key":"hashKey","version":1,"salt":"saltyA",
                "rules":[{"clauses":[],"weight":43000}]}"#,
        );
        let reject = TestStore::default().with_segment(
            r#"{"key":"hashKey","version":1,"salt":"saltyA",
                "rules":[{"clauses":[],"weight":42000}]}"#,
        );
        let f = flag(
            r#"{"key":"f1","version":1,"on":true,"salt":"s",
                "variations":[false,true],
                "rules":[{"id":"seg","clauses":[{"attribute":"","op":"segmentMatch","values":["hashKey"]}],"variation":1}],
                "fallthrough":{"variation":0}}"#,
        );
        let user = User::with_key("userKeyA").build();
        assert_eq!(evaluate(&admit, &f, &user).0.variation_index, Some(1));
        assert_eq!(evaluate(&reject, &f, &user).0.variation_index, Some(0));
    }

    #[test]
    fn unknown_segment_does_not_match() {
        let store = TestStore::default();
        let f = flag(
            r#"{"key":"f1","version":1,"on":true,"salt":"s",
                "variations":[false,true],
                "rules":[{"id":"seg","clauses":[{"attribute":"","op":"segmentMatch","values":["ghost"]}],"variation":1}],
                "fallthrough":{"variation":0}}"#,
        );
        let (detail, _) = evaluate(&store, &f, &User::with_key("u").build());
        assert_eq!(detail.variation_index, Some(0));
    }
}
