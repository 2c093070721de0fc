//! Reconciliation of a planned collection against tracked state.
//!
//! One pass runs strictly in this order:
//! 1. bulk creates, ascending by dependency level
//! 2. individual PUTs for groups whose tracked fields changed, children
//!    before the parents that reference them
//! 3. DELETEs for groups dropped from the plan, walking the prior
//!    dependency order backwards so parents go before their children
//!
//! A failing step stops the pass, but the state accumulated up to that
//! point is always handed back so the caller can persist it.

use super::bulk::{divide_to_bulks, request_body};
use super::graph::{topological_seq, GraphNode};
use super::synthesis::{synthesize_network_groups, OwnedGroups};
use super::{GroupSet, NetworkGroup, SyncError};
use crate::client::{ClientError, NetworkGroupsApi};
use std::collections::{BTreeMap, BTreeSet};

/// Where a group stands during one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    /// No remote object: planned but not yet queued for creation, or
    /// dropped before it was ever created
    Absent,
    ToCreate,
    /// Created this pass; fields still compared against the plan
    CreatedPendingFields,
    UpToDate,
    ToUpdate,
    ToDelete,
    Deleted,
}

/// Classify every group named in `prior` or `desired` before any call is
/// made. Ids are taken from `prior`; a planned group without one starts
/// out `Absent` until it is placed in a bulk.
pub fn plan_phases(prior: &GroupSet, desired: &GroupSet) -> BTreeMap<String, GroupPhase> {
    let mut phases = BTreeMap::new();

    for (name, planned) in desired {
        let phase = match prior.get(name) {
            Some(tracked) if tracked.id.is_some() => {
                if planned.differs_from(tracked) {
                    GroupPhase::ToUpdate
                } else {
                    GroupPhase::UpToDate
                }
            }
            _ => GroupPhase::Absent,
        };
        phases.insert(name.clone(), phase);
    }

    for name in prior.keys() {
        if !desired.contains_key(name) {
            phases.insert(name.clone(), GroupPhase::ToDelete);
        }
    }

    phases
}

pub type Phases = BTreeMap<String, GroupPhase>;

/// State after a pass, plus the error that stopped it, if any.
#[derive(Debug)]
pub struct SyncOutcome {
    pub state: GroupSet,
    /// Phase each group reached; empty when the plan was rejected up front
    pub phases: Phases,
    pub error: Option<SyncError>,
}

impl SyncOutcome {
    fn done(state: GroupSet, phases: Phases) -> Self {
        Self {
            state,
            phases,
            error: None,
        }
    }

    fn failed(state: GroupSet, phases: Phases, error: SyncError) -> Self {
        if error.is_configuration() {
            tracing::warn!(error = %error, "Network groups plan rejected");
        } else {
            tracing::error!(error = %error, tracked = state.len(), "Network groups sync stopped");
        }
        Self {
            state,
            phases,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Sync engine for one `fmc_network_groups` instance in one domain
pub struct NetworkGroupsSync<'a, A: ?Sized> {
    api: &'a A,
    domain: &'a str,
}

impl<'a, A> NetworkGroupsSync<'a, A>
where
    A: NetworkGroupsApi + ?Sized,
{
    pub fn new(api: &'a A, domain: &'a str) -> Self {
        Self { api, domain }
    }

    /// Bring FMC from `prior` to `desired`. Ids present in `desired` are
    /// ignored; a group's identity comes from `prior` only.
    pub async fn reconcile(&self, prior: &GroupSet, desired: &GroupSet) -> SyncOutcome {
        let desired = adopt_known_ids(prior, desired);
        let mut state = prior.clone();

        let seq = match topological_seq(&desired) {
            Ok(seq) => seq,
            Err(e) => return SyncOutcome::failed(state, Phases::new(), e),
        };

        let mut phases = plan_phases(prior, &desired);
        let division = divide_to_bulks(&seq, &desired);
        for name in division.bulks.iter().flat_map(|bulk| &bulk.names) {
            phases.insert(name.clone(), GroupPhase::ToCreate);
        }

        tracing::info!(
            create = count(&phases, GroupPhase::ToCreate),
            update = count(&phases, GroupPhase::ToUpdate),
            delete = count(&phases, GroupPhase::ToDelete),
            "Reconciling network groups"
        );
        tracing::debug!(
            bulks = division.bulks.len(),
            existing = division.leftovers.len(),
            "Divided network groups into bulks"
        );
        for bulk in &division.bulks {
            let created = bulk.create(self.api, self.domain, &desired, &mut state).await;
            mark_created(&mut phases, &state);
            if let Err(e) = created {
                return SyncOutcome::failed(state, phases, e);
            }
        }

        let candidates = update_candidates(&seq, &division.leftovers, &phases);
        if let Err(e) = self
            .update_changed(&candidates, &desired, &mut state, &mut phases)
            .await
        {
            return SyncOutcome::failed(state, phases, e);
        }

        if let Err(e) = self.delete_dropped(prior, &desired, &mut state, &mut phases).await {
            return SyncOutcome::failed(state, phases, e);
        }

        SyncOutcome::done(state, phases)
    }

    /// PUT each of `names` whose tracked copy differs, in the given order.
    /// Groups created earlier in this pass already match and are skipped by
    /// the same check.
    async fn update_changed(
        &self,
        names: &[String],
        desired: &GroupSet,
        state: &mut GroupSet,
        phases: &mut Phases,
    ) -> Result<(), SyncError> {
        for name in names {
            let planned = desired.get(name).ok_or_else(|| {
                SyncError::Internal(format!("network group {} is not planned", name))
            })?;
            let tracked = match state.get(name) {
                Some(tracked) => tracked,
                None => {
                    return Err(SyncError::Internal(format!(
                        "network group {} was neither created nor tracked",
                        name
                    )))
                }
            };
            if !planned.differs_from(tracked) {
                phases.insert(name.clone(), GroupPhase::UpToDate);
                continue;
            }
            phases.insert(name.clone(), GroupPhase::ToUpdate);

            let id = tracked.id.clone().ok_or_else(|| {
                SyncError::Internal(format!("network group {} has no id to update", name))
            })?;
            let body = request_body(name, planned, state)?;

            tracing::info!(group = %name, id = %id, "Updating network group");
            self.api
                .update_network_group(self.domain, &id, &body)
                .await
                .map_err(|e| SyncError::client("update", name, e))?;

            let mut updated = planned.clone();
            updated.id = Some(id);
            state.insert(name.clone(), updated);
            phases.insert(name.clone(), GroupPhase::UpToDate);
        }

        Ok(())
    }

    /// DELETE groups that were tracked but are no longer planned, parents
    /// first. A 404 means the group is already gone.
    async fn delete_dropped(
        &self,
        prior: &GroupSet,
        desired: &GroupSet,
        state: &mut GroupSet,
        phases: &mut Phases,
    ) -> Result<(), SyncError> {
        let doomed: BTreeSet<&str> = prior
            .keys()
            .filter(|name| !desired.contains_key(*name))
            .map(String::as_str)
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }

        let del_seq = topological_seq(&without_dangling_children(prior))?;

        for node in del_seq.iter().rev() {
            if !doomed.contains(node.name.as_str()) {
                continue;
            }

            let id = match state.get(&node.name).and_then(|g| g.id.clone()) {
                Some(id) => id,
                None => {
                    state.remove(&node.name);
                    phases.insert(node.name.clone(), GroupPhase::Absent);
                    continue;
                }
            };

            tracing::info!(group = %node.name, id = %id, level = node.level, "Deleting network group");
            match self.api.delete_network_group(self.domain, &id).await {
                Ok(()) => {}
                Err(ClientError::NotFound(_)) => {
                    tracing::warn!(group = %node.name, id = %id, "Network group already deleted");
                }
                Err(e) => return Err(SyncError::client("delete", &node.name, e)),
            }
            state.remove(&node.name);
            phases.insert(node.name.clone(), GroupPhase::Deleted);
        }

        Ok(())
    }

    /// Refresh the groups tracked in `tracked` from FMC. Groups missing
    /// remotely are dropped; child references to owned groups are turned
    /// back into `network_groups` names.
    pub async fn read(&self, tracked: &GroupSet) -> Result<GroupSet, SyncError> {
        let listing = self
            .api
            .list_network_groups(self.domain)
            .await
            .map_err(|e| SyncError::client("read", "*", e))?;

        let owned = OwnedGroups::from_listing(&listing, tracked.keys().map(String::as_str));
        let groups = synthesize_network_groups(&listing, &owned);

        for name in tracked.keys().filter(|name| !groups.contains_key(*name)) {
            tracing::warn!(group = %name, "Network group no longer exists on FMC");
        }

        Ok(groups)
    }
}

/// Existing groups plus the ones created this pass, in `seq` order so a
/// child is rewritten before any parent that starts referencing it.
fn update_candidates(seq: &[GraphNode], leftovers: &[String], phases: &Phases) -> Vec<String> {
    let existing: BTreeSet<&str> = leftovers.iter().map(String::as_str).collect();
    seq.iter()
        .filter(|node| {
            existing.contains(node.name.as_str())
                || phases.get(&node.name) == Some(&GroupPhase::CreatedPendingFields)
        })
        .map(|node| node.name.clone())
        .collect()
}

/// Groups the bulks just gave an id still owe a field comparison.
fn mark_created(phases: &mut Phases, state: &GroupSet) {
    for (name, phase) in phases.iter_mut() {
        let has_id = state.get(name).map(|g| g.id.is_some()).unwrap_or(false);
        if *phase == GroupPhase::ToCreate && has_id {
            *phase = GroupPhase::CreatedPendingFields;
        }
    }
}

/// Copy remote ids from `prior` onto the plan by name.
fn adopt_known_ids(prior: &GroupSet, desired: &GroupSet) -> GroupSet {
    desired
        .iter()
        .map(|(name, planned)| {
            let group = NetworkGroup {
                id: prior.get(name).and_then(|g| g.id.clone()),
                ..planned.clone()
            };
            (name.clone(), group)
        })
        .collect()
}

/// Tracked state may name children that vanished remotely; ordering only
/// needs the edges that still resolve.
fn without_dangling_children(groups: &GroupSet) -> GroupSet {
    groups
        .iter()
        .map(|(name, group)| {
            let mut group = group.clone();
            group.network_groups.retain(|child| groups.contains_key(child));
            (name.clone(), group)
        })
        .collect()
}

fn count(phases: &Phases, phase: GroupPhase) -> usize {
    phases.values().filter(|p| **p == phase).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_groups::fake::{Call, FakeFmc};
    use crate::network_groups::{Literal, ObjectRef};

    const DOMAIN: &str = "domain-uuid";

    fn group(children: &[&str]) -> NetworkGroup {
        NetworkGroup {
            network_groups: children.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    fn set(items: Vec<(&str, NetworkGroup)>) -> GroupSet {
        items
            .into_iter()
            .map(|(name, group)| (name.to_string(), group))
            .collect()
    }

    async fn apply(api: &FakeFmc, prior: &GroupSet, desired: &GroupSet) -> GroupSet {
        let outcome = NetworkGroupsSync::new(api, DOMAIN)
            .reconcile(prior, desired)
            .await;
        assert!(outcome.is_ok(), "unexpected error: {:?}", outcome.error);
        outcome.state
    }

    #[test]
    fn test_plan_phases() {
        let prior = set(vec![
            ("same", NetworkGroup { id: Some("1".into()), ..group(&[]) }),
            ("changed", NetworkGroup { id: Some("2".into()), ..group(&[]) }),
            ("dropped", NetworkGroup { id: Some("3".into()), ..group(&[]) }),
        ]);
        let desired = set(vec![
            ("same", group(&[])),
            (
                "changed",
                NetworkGroup {
                    description: Some("new".into()),
                    ..group(&[])
                },
            ),
            ("new", group(&[])),
        ]);

        let phases = plan_phases(&prior, &desired);
        assert_eq!(phases["same"], GroupPhase::UpToDate);
        assert_eq!(phases["changed"], GroupPhase::ToUpdate);
        assert_eq!(phases["dropped"], GroupPhase::ToDelete);
        assert_eq!(phases["new"], GroupPhase::Absent);
    }

    #[tokio::test]
    async fn test_new_groups_queue_for_creation() {
        let api = FakeFmc::new().fail_bulk_at(0);
        let desired = set(vec![("A", group(&["B"])), ("B", group(&[]))]);

        let outcome = NetworkGroupsSync::new(&api, DOMAIN)
            .reconcile(&GroupSet::new(), &desired)
            .await;

        assert!(outcome.error.is_some());
        assert!(outcome.state.is_empty());
        assert_eq!(outcome.phases["A"], GroupPhase::ToCreate);
        assert_eq!(outcome.phases["B"], GroupPhase::ToCreate);
    }

    #[tokio::test]
    async fn test_restructure_updates_children_first() {
        let api = FakeFmc::new();
        let prior = apply(
            &api,
            &GroupSet::new(),
            &set(vec![("P", group(&["C"])), ("C", group(&[]))]),
        )
        .await;
        api.clear_calls();

        // C now contains P; P has to let go of C before C may point at it
        let desired = set(vec![("P", group(&[])), ("C", group(&["P"]))]);
        let state = apply(&api, &prior, &desired).await;

        assert_eq!(
            api.writes(),
            vec![Call::Update("P".into()), Call::Update("C".into())]
        );
        assert_eq!(state["C"].network_groups, vec!["P".to_string()]);
        assert!(state["P"].network_groups.is_empty());
        let p_id = state["P"].id.clone().unwrap();
        assert!(api.group("C").unwrap().objects.iter().any(|o| o.id == p_id));
    }

    #[tokio::test]
    async fn test_create_children_first() {
        let api = FakeFmc::new();
        let desired = set(vec![("A", group(&["B"])), ("B", group(&[]))]);

        let state = apply(&api, &GroupSet::new(), &desired).await;

        assert_eq!(
            api.writes(),
            vec![
                Call::BulkCreate(vec!["B".into()]),
                Call::BulkCreate(vec!["A".into()]),
            ]
        );
        let b_id = state["B"].id.clone().unwrap();
        assert!(state["A"].id.is_some());
        assert!(api.group("A").unwrap().objects.iter().any(|o| o.id == b_id));
        assert_eq!(state["A"].network_groups, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_cycle_blocks_every_call() {
        let api = FakeFmc::new();
        let desired = set(vec![("A", group(&["B"])), ("B", group(&["A"]))]);

        let outcome = NetworkGroupsSync::new(&api, DOMAIN)
            .reconcile(&GroupSet::new(), &desired)
            .await;

        match outcome.error {
            Some(SyncError::Cycle { names }) => assert_eq!(names, vec!["A", "B"]),
            other => panic!("expected cycle, got {:?}", other),
        }
        assert!(api.calls().is_empty());
        assert!(outcome.state.is_empty());
        assert!(outcome.phases.is_empty());
    }

    #[tokio::test]
    async fn test_second_apply_is_noop() {
        let api = FakeFmc::new().with_external_object("host-1");
        let desired = set(vec![
            (
                "A",
                NetworkGroup {
                    objects: vec![ObjectRef { id: "host-1".into() }],
                    literals: vec![Literal { value: "10.0.0.0/8".into() }],
                    ..group(&["B", "C"])
                },
            ),
            ("B", group(&["C"])),
            ("C", group(&[])),
        ]);

        let first = apply(&api, &GroupSet::new(), &desired).await;
        api.clear_calls();

        let second = apply(&api, &first, &desired).await;
        assert!(api.writes().is_empty());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_update_only_changed_keys() {
        let api = FakeFmc::new();
        let desired = set(vec![("A", group(&[])), ("B", group(&[]))]);
        let prior = apply(&api, &GroupSet::new(), &desired).await;
        api.clear_calls();

        let desired = set(vec![
            ("A", group(&[])),
            (
                "B",
                NetworkGroup {
                    description: Some("updated".into()),
                    ..group(&[])
                },
            ),
        ]);
        let state = apply(&api, &prior, &desired).await;

        assert_eq!(api.writes(), vec![Call::Update("B".into())]);
        assert_eq!(state["B"].id, prior["B"].id);
        assert_eq!(api.group("B").unwrap().description.as_deref(), Some("updated"));
    }

    #[tokio::test]
    async fn test_existing_group_adopts_new_child() {
        let api = FakeFmc::new();
        let prior = apply(&api, &GroupSet::new(), &set(vec![("A", group(&[]))])).await;
        api.clear_calls();

        let desired = set(vec![("A", group(&["N"])), ("N", group(&[]))]);
        let state = apply(&api, &prior, &desired).await;

        assert_eq!(
            api.writes(),
            vec![Call::BulkCreate(vec!["N".into()]), Call::Update("A".into())]
        );
        let n_id = state["N"].id.clone().unwrap();
        assert!(api.group("A").unwrap().objects.iter().any(|o| o.id == n_id));
    }

    #[tokio::test]
    async fn test_delete_parents_first() {
        let api = FakeFmc::new();
        let desired = set(vec![("A", group(&["B"])), ("B", group(&[]))]);
        let prior = apply(&api, &GroupSet::new(), &desired).await;
        api.clear_calls();

        let state = apply(&api, &prior, &GroupSet::new()).await;

        assert_eq!(
            api.writes(),
            vec![Call::Delete("A".into()), Call::Delete("B".into())]
        );
        assert!(state.is_empty());
        assert_eq!(api.group_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_parent_delete_keeps_child_tracked() {
        let api = FakeFmc::new().fail_delete_of("A");
        let desired = set(vec![("A", group(&["B"])), ("B", group(&[]))]);
        let prior = apply(&api, &GroupSet::new(), &desired).await;
        api.clear_calls();

        let outcome = NetworkGroupsSync::new(&api, DOMAIN)
            .reconcile(&prior, &GroupSet::new())
            .await;

        assert!(matches!(
            outcome.error,
            Some(SyncError::Client { operation: "delete", ref group, .. }) if group == "A"
        ));
        assert_eq!(api.writes(), vec![Call::Delete("A".into())]);
        assert_eq!(outcome.state, prior);
        assert_eq!(outcome.phases["A"], GroupPhase::ToDelete);
        assert_eq!(outcome.phases["B"], GroupPhase::ToDelete);
    }

    #[tokio::test]
    async fn test_phases_after_full_pass() {
        let api = FakeFmc::new();
        let mut prior = apply(
            &api,
            &GroupSet::new(),
            &set(vec![("keep", group(&[])), ("drop", group(&[]))]),
        )
        .await;
        prior.insert("never-created".into(), group(&[]));

        let desired = set(vec![
            ("keep", NetworkGroup { description: Some("x".into()), ..group(&[]) }),
            ("fresh", group(&[])),
        ]);
        let outcome = NetworkGroupsSync::new(&api, DOMAIN)
            .reconcile(&prior, &desired)
            .await;

        assert!(outcome.is_ok());
        assert_eq!(outcome.phases["keep"], GroupPhase::UpToDate);
        assert_eq!(outcome.phases["fresh"], GroupPhase::UpToDate);
        assert_eq!(outcome.phases["drop"], GroupPhase::Deleted);
        assert_eq!(outcome.phases["never-created"], GroupPhase::Absent);
        assert!(!outcome.state.contains_key("never-created"));
    }

    #[tokio::test]
    async fn test_delete_404_is_success() {
        let api = FakeFmc::new();
        let prior = apply(&api, &GroupSet::new(), &set(vec![("A", group(&[]))])).await;
        api.vanish("A");

        let state = apply(&api, &prior, &GroupSet::new()).await;
        assert!(state.is_empty());
        assert_eq!(api.writes(), vec![Call::Delete("A".into())]);
    }

    #[tokio::test]
    async fn test_failed_bulk_keeps_earlier_levels() {
        let api = FakeFmc::new().fail_bulk_at(1);
        let desired = set(vec![("A", group(&["B"])), ("B", group(&[]))]);

        let outcome = NetworkGroupsSync::new(&api, DOMAIN)
            .reconcile(&GroupSet::new(), &desired)
            .await;

        assert!(matches!(
            outcome.error,
            Some(SyncError::Client { operation: "bulk create", .. })
        ));
        assert_eq!(outcome.state.len(), 1);
        assert!(outcome.state["B"].id.is_some());
        assert_eq!(outcome.phases["B"], GroupPhase::CreatedPendingFields);
        assert_eq!(outcome.phases["A"], GroupPhase::ToCreate);

        // The retry creates only what is still missing.
        api.clear_calls();
        let state = apply(&api, &outcome.state, &desired).await;
        assert_eq!(api.writes(), vec![Call::BulkCreate(vec!["A".into()])]);
        assert_eq!(state.len(), 2);
    }

    #[tokio::test]
    async fn test_rename_creates_then_deletes() {
        let api = FakeFmc::new();
        let prior = apply(&api, &GroupSet::new(), &set(vec![("old", group(&[]))])).await;
        api.clear_calls();

        let state = apply(&api, &prior, &set(vec![("new", group(&[]))])).await;
        assert_eq!(
            api.writes(),
            vec![
                Call::BulkCreate(vec!["new".into()]),
                Call::Delete("old".into()),
            ]
        );
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_detach_then_delete_child() {
        let api = FakeFmc::new();
        let desired = set(vec![("A", group(&["B"])), ("B", group(&[]))]);
        let prior = apply(&api, &GroupSet::new(), &desired).await;
        api.clear_calls();

        let state = apply(&api, &prior, &set(vec![("A", group(&[]))])).await;
        assert_eq!(
            api.writes(),
            vec![Call::Update("A".into()), Call::Delete("B".into())]
        );
        assert!(state["A"].network_groups.is_empty());
    }

    #[tokio::test]
    async fn test_read_synthesizes_children() {
        let api = FakeFmc::new();
        let desired = set(vec![("A", group(&["B"])), ("B", group(&[]))]);
        let state = apply(&api, &GroupSet::new(), &desired).await;

        let read = NetworkGroupsSync::new(&api, DOMAIN).read(&state).await.unwrap();
        assert_eq!(read, state);
    }

    #[tokio::test]
    async fn test_read_drops_vanished_groups() {
        let api = FakeFmc::new();
        let state = apply(
            &api,
            &GroupSet::new(),
            &set(vec![("A", group(&[])), ("B", group(&[]))]),
        )
        .await;
        api.vanish("B");

        let read = NetworkGroupsSync::new(&api, DOMAIN).read(&state).await.unwrap();
        assert_eq!(read.keys().collect::<Vec<_>>(), vec!["A"]);
    }
}
