//! Bulk creation of network groups, one POST per dependency level.

use super::graph::GraphNode;
use super::{GroupSet, NetworkGroup, SyncError};
use crate::client::{ClientError, NetworkGroupObject, NetworkGroupsApi};
use std::collections::HashMap;

/// Most items FMC accepts in one bulk POST
pub const MAX_BULK_SIZE: usize = 1000;

/// Groups of one dependency level that have no remote id yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkGroupsBulk {
    pub level: usize,
    pub names: Vec<String>,
}

/// Result of splitting a topological sequence
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Division {
    /// Ascending by level
    pub bulks: Vec<NetworkGroupsBulk>,
    /// Groups that already exist remotely, in sequence order
    pub leftovers: Vec<String>,
}

/// Split `seq` into creation batches and groups that already have an id.
/// A batch never spans two levels.
pub fn divide_to_bulks(seq: &[GraphNode], desired: &GroupSet) -> Division {
    let mut division = Division::default();

    for node in seq {
        let known = desired
            .get(&node.name)
            .map(|g| g.id.is_some())
            .unwrap_or(false);
        if known {
            division.leftovers.push(node.name.clone());
            continue;
        }

        match division.bulks.last_mut() {
            Some(bulk) if bulk.level == node.level => bulk.names.push(node.name.clone()),
            _ => division.bulks.push(NetworkGroupsBulk {
                level: node.level,
                names: vec![node.name.clone()],
            }),
        }
    }

    division
}

/// Request body for `name`, with each child resolved to its remote id
/// through `state`.
pub fn request_body(
    name: &str,
    group: &NetworkGroup,
    state: &GroupSet,
) -> Result<NetworkGroupObject, SyncError> {
    let child_ids = group
        .network_groups
        .iter()
        .map(|child| {
            state
                .get(child)
                .and_then(|c| c.id.clone())
                .ok_or_else(|| {
                    SyncError::Internal(format!(
                        "network group {} needs the id of {} before it was created",
                        name, child
                    ))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(group.to_request(name, child_ids))
}

impl NetworkGroupsBulk {
    /// POST the batch (in chunks of `MAX_BULK_SIZE`) and record every
    /// created group in `state`. Each chunk is all-or-nothing; chunks that
    /// succeeded stay recorded when a later one fails.
    pub async fn create<A>(
        &self,
        api: &A,
        domain: &str,
        desired: &GroupSet,
        state: &mut GroupSet,
    ) -> Result<(), SyncError>
    where
        A: NetworkGroupsApi + ?Sized,
    {
        for chunk in self.names.chunks(MAX_BULK_SIZE) {
            let mut bodies = Vec::with_capacity(chunk.len());
            for name in chunk {
                let group = desired.get(name).ok_or_else(|| {
                    SyncError::Internal(format!("network group {} is not planned", name))
                })?;
                bodies.push(request_body(name, group, state)?);
            }

            tracing::info!(level = self.level, count = chunk.len(), "Bulk creating network groups");

            let created = api
                .bulk_create_network_groups(domain, &bodies)
                .await
                .map_err(|e| SyncError::client("bulk create", &chunk.join(", "), e))?;

            let ids = assigned_ids(chunk, created)?;

            for name in chunk {
                let mut group = desired[name].clone();
                group.id = ids.get(name).cloned();
                tracing::debug!(group = %name, id = ?group.id, "Network group created");
                state.insert(name.clone(), group);
            }
        }

        Ok(())
    }
}

/// Match created items back to requested names. Items are looked up by
/// name; an answer without names falls back to request order.
fn assigned_ids(
    chunk: &[String],
    created: Vec<NetworkGroupObject>,
) -> Result<HashMap<String, String>, SyncError> {
    let invalid = |msg: String| {
        SyncError::client(
            "bulk create",
            &chunk.join(", "),
            ClientError::InvalidResponse(msg),
        )
    };

    if created.len() != chunk.len() {
        return Err(invalid(format!(
            "expected {} created items, got {}",
            chunk.len(),
            created.len()
        )));
    }

    let by_name: HashMap<String, String> = created
        .iter()
        .filter_map(|item| Some((item.name.clone(), item.id.clone()?)))
        .collect();

    chunk
        .iter()
        .zip(created.iter())
        .map(|(name, item)| {
            let id = by_name
                .get(name)
                .cloned()
                .or_else(|| item.id.clone())
                .ok_or_else(|| invalid(format!("no id returned for {}", name)))?;
            Ok((name.clone(), id))
        })
        .collect()
}
