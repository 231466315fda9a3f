//! Dependency ordering for store initialization.
//!
//! Persistent stores apply an `init` item by item, so the sequence must list
//! every flag after its prerequisites (and all segments before any flag). A
//! reader that sees a flag then also sees everything the flag depends on.

use std::collections::{HashMap, HashSet};

use crate::model::FeatureFlag;

/// Orders flags so that each flag's prerequisites precede it.
///
/// Depth-first from each unvisited flag, recursing into prerequisites before
/// emitting the flag itself. Prerequisites that are absent from the dataset
/// are skipped; cycles are broken by the visited set.
pub(crate) fn dependency_ordered_flags(
    flags: HashMap<String, FeatureFlag>,
) -> Vec<(String, FeatureFlag)> {
    let mut order = Vec::with_capacity(flags.len());
    let mut visited = HashSet::with_capacity(flags.len());

    for key in flags.keys() {
        visit(key, &flags, &mut visited, &mut order);
    }

    let mut flags = flags;
    order
        .into_iter()
        .filter_map(|key| {
            let flag = flags.remove(&key)?;
            Some((key, flag))
        })
        .collect()
}

fn visit(
    key: &str,
    flags: &HashMap<String, FeatureFlag>,
    visited: &mut HashSet<String>,
    order: &mut Vec<String>,
) {
    if visited.contains(key) {
        return;
    }
    visited.insert(key.to_owned());

    if let Some(flag) = flags.get(key) {
        for prereq in &flag.prerequisites {
            visit(&prereq.key, flags, visited, order);
        }
        order.push(key.to_owned());
    }
}
