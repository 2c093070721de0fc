//! Dependency ordering of network groups.
//!
//! A group depends on every sibling listed in its `network_groups`. Groups
//! are peeled off in waves: a wave holds every group whose children were
//! all emitted by earlier waves, and the wave number is the group's level.
//! Leaves get level 1.

use super::{GroupSet, SyncError};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A group placed in dependency order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub name: String,
    pub level: usize,
}

/// Order `groups` so that every child precedes the groups that reference
/// it. Within a level names are sorted.
///
/// Fails with `UnknownChild` when a child name is not a key of `groups`
/// and with `Cycle` naming every group left once no wave can make progress.
pub fn topological_seq(groups: &GroupSet) -> Result<Vec<GraphNode>, SyncError> {
    let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
    let mut parents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (name, group) in groups {
        let children: BTreeSet<&str> = group.network_groups.iter().map(String::as_str).collect();
        for child in &children {
            if !groups.contains_key(*child) {
                return Err(SyncError::UnknownChild {
                    group: name.clone(),
                    child: child.to_string(),
                });
            }
            parents.entry(*child).or_default().push(name.as_str());
        }
        pending.insert(name.as_str(), children.len());
    }

    let mut wave: Vec<&str> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut seq = Vec::with_capacity(groups.len());
    let mut level = 1;

    while !wave.is_empty() {
        let mut next = Vec::new();

        for name in &wave {
            pending.remove(name);
            seq.push(GraphNode {
                name: name.to_string(),
                level,
            });

            for parent in parents.get(name).into_iter().flatten() {
                if let Some(count) = pending.get_mut(parent) {
                    *count -= 1;
                    if *count == 0 {
                        next.push(*parent);
                    }
                }
            }
        }

        next.sort_unstable();
        wave = next;
        level += 1;
    }

    if !pending.is_empty() {
        return Err(SyncError::Cycle {
            names: pending.keys().map(|name| name.to_string()).collect(),
        });
    }

    Ok(seq)
}
