//! The closed set of clause operators: pure binary predicates over values.

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;
use semver::Version;

use crate::model::Clause;
use crate::user::User;
use crate::Value;

/// A clause operator, serialized by its lowercase wire name.
///
/// Operators the SDK does not know are preserved as [`Op::Unknown`] and never
/// match, so newer flag data stays evaluable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    /// Structural equality.
    In,
    /// String prefix test.
    StartsWith,
    /// String suffix test.
    EndsWith,
    /// Substring test.
    Contains,
    /// Unanchored regex search of the clause value over the user value.
    Matches,
    /// Numeric comparison.
    LessThan,
    /// Numeric comparison.
    LessThanOrEqual,
    /// Numeric comparison.
    GreaterThan,
    /// Numeric comparison.
    GreaterThanOrEqual,
    /// Date comparison after coercing both sides to epoch milliseconds.
    Before,
    /// Date comparison after coercing both sides to epoch milliseconds.
    After,
    /// Semantic version equality (build metadata ignored).
    SemVerEqual,
    /// Semantic version ordering.
    SemVerLessThan,
    /// Semantic version ordering.
    SemVerGreaterThan,
    /// Segment membership; resolved by the evaluator, not here.
    SegmentMatch,
    /// Any operator this SDK version does not recognize.
    #[serde(other)]
    Unknown,
}

impl Op {
    /// Applies the operator to a user value and a clause value. Incompatible
    /// types always yield `false`.
    pub(crate) fn apply(self, user_value: &Value, clause_value: &Value) -> bool {
        self.try_apply(user_value, clause_value).unwrap_or(false)
    }

    /// Applies the operator, returning `None` when it is inapplicable to the
    /// operand types.
    fn try_apply(self, user_value: &Value, clause_value: &Value) -> Option<bool> {
        match self {
            Op::In => Some(user_value == clause_value),

            Op::StartsWith => {
                Some(user_value.as_str()?.starts_with(clause_value.as_str()?))
            }
            Op::EndsWith => Some(user_value.as_str()?.ends_with(clause_value.as_str()?)),
            Op::Contains => Some(user_value.as_str()?.contains(clause_value.as_str()?)),

            Op::Matches => {
                let pattern = Regex::new(clause_value.as_str()?).ok()?;
                Some(pattern.is_match(user_value.as_str()?))
            }

            Op::LessThan => Some(user_value.as_float()? < clause_value.as_float()?),
            Op::LessThanOrEqual => Some(user_value.as_float()? <= clause_value.as_float()?),
            Op::GreaterThan => Some(user_value.as_float()? > clause_value.as_float()?),
            Op::GreaterThanOrEqual => {
                Some(user_value.as_float()? >= clause_value.as_float()?)
            }

            Op::Before => Some(to_epoch_millis(user_value)? < to_epoch_millis(clause_value)?),
            Op::After => Some(to_epoch_millis(user_value)? > to_epoch_millis(clause_value)?),

            // cmp_precedence ignores build metadata, as the flag data model
            // requires; the Ord impl on Version does not.
            Op::SemVerEqual => Some(
                parse_semver(user_value)?.cmp_precedence(&parse_semver(clause_value)?)
                    == Ordering::Equal,
            ),
            Op::SemVerLessThan => Some(
                parse_semver(user_value)?.cmp_precedence(&parse_semver(clause_value)?)
                    == Ordering::Less,
            ),
            Op::SemVerGreaterThan => Some(
                parse_semver(user_value)?.cmp_precedence(&parse_semver(clause_value)?)
                    == Ordering::Greater,
            ),

            Op::SegmentMatch | Op::Unknown => None,
        }
    }
}

/// Matches a clause against the user without resolving segments.
///
/// An array attribute matches when any element matches any clause value; a
/// scalar matches when any clause value matches. Objects never match. Negation
/// applies after match determination, and never to an unset attribute.
pub(crate) fn clause_matches_user(clause: &Clause, user: &User) -> bool {
    let Some(user_value) = user.attribute(&clause.attribute) else {
        return false;
    };

    let matched = match &user_value {
        Value::Array(elements) => elements.iter().any(|element| {
            clause
                .values
                .iter()
                .any(|clause_value| clause.op.apply(element, clause_value))
        }),
        Value::Object(_) => {
            log::warn!(target: "darklaunch",
                attribute = clause.attribute.as_str();
                "got object value for user attribute, clauses cannot match objects");
            return false;
        }
        scalar => clause
            .values
            .iter()
            .any(|clause_value| clause.op.apply(scalar, clause_value)),
    };

    matched != clause.negate
}

/// Coerces a value to epoch milliseconds: numbers are taken as-is, strings
/// are parsed as RFC 3339 / ISO 8601 timestamps.
fn to_epoch_millis(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => Some(*n),
        Value::Str(s) => {
            let parsed = chrono::DateTime::parse_from_rfc3339(s).ok()?;
            Some(parsed.timestamp_millis() as f64)
        }
        _ => None,
    }
}

/// Parses a semantic version, tolerating missing minor or patch components
/// ("2" and "2.1" read as "2.0.0" and "2.1.0").
fn parse_semver(value: &Value) -> Option<Version> {
    static LOOSE_VERSION: OnceLock<Regex> = OnceLock::new();
    let pattern = LOOSE_VERSION.get_or_init(|| {
        Regex::new(r"^(?P<major>0|[1-9]\d*)(\.(?P<minor>0|[1-9]\d*))?(\.(?P<patch>0|[1-9]\d*))?(?P<rest>[\-+].*)?$")
            .expect("loose semver pattern is valid")
    });

    let s = value.as_str()?;
    let captures = pattern.captures(s)?;
    let normalized = format!(
        "{}.{}.{}{}",
        &captures["major"],
        captures.name("minor").map_or("0", |m| m.as_str()),
        captures.name("patch").map_or("0", |m| m.as_str()),
        captures.name("rest").map_or("", |m| m.as_str()),
    );
    Version::parse(&normalized).ok()
}
