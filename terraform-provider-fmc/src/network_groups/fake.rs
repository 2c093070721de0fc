//! In-memory FMC used by the engine tests.
//!
//! Enforces the referential rules that make ordering matter: a group may
//! only reference ids that exist, group membership never loops, and a
//! group still referenced by another cannot be deleted.

use crate::client::{ClientError, NetworkGroupObject, NetworkGroupsApi, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List,
    BulkCreate(Vec<String>),
    Update(String),
    Delete(String),
}

#[derive(Default)]
struct Inner {
    groups: BTreeMap<String, NetworkGroupObject>,
    external: HashSet<String>,
    calls: Vec<Call>,
    next_id: usize,
    fail_bulk_at: Option<usize>,
    fail_delete: HashSet<String>,
    vanished: BTreeMap<String, String>,
    bulk_seen: usize,
}

#[derive(Default)]
pub struct FakeFmc {
    inner: Mutex<Inner>,
}

impl FakeFmc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-group object every group may reference, e.g. a host.
    pub fn with_external_object(self, id: &str) -> Self {
        self.lock().external.insert(id.to_string());
        self
    }

    /// Fail the n-th bulk POST (0-based)
    pub fn fail_bulk_at(self, n: usize) -> Self {
        self.lock().fail_bulk_at = Some(n);
        self
    }

    /// Fail DELETE for the group with this name
    pub fn fail_delete_of(self, name: &str) -> Self {
        self.lock().fail_delete.insert(name.to_string());
        self
    }

    /// Remove the group behind the API's back so DELETE answers 404
    pub fn vanish(&self, name: &str) {
        let mut inner = self.lock();
        let id = inner
            .groups
            .iter()
            .find(|(_, g)| g.name == name)
            .map(|(id, _)| id.clone());
        if let Some(id) = id {
            inner.groups.remove(&id);
            inner.vanished.insert(id, name.to_string());
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Remote copy of a group by name
    pub fn group(&self, name: &str) -> Option<NetworkGroupObject> {
        self.lock().groups.values().find(|g| g.name == name).cloned()
    }

    pub fn group_count(&self) -> usize {
        self.lock().groups.len()
    }

    /// Writes made so far, ignoring listings
    pub fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| *c != Call::List)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

impl Inner {
    fn check_references(&self, group: &NetworkGroupObject) -> Result<()> {
        for object in &group.objects {
            if !self.groups.contains_key(&object.id) && !self.external.contains(&object.id) {
                return Err(ClientError::Api {
                    status: 400,
                    message: format!("{} references unknown object {}", group.name, object.id),
                });
            }
        }
        Ok(())
    }

    /// Whether `target` is reachable from `from` through stored members
    fn contains(&self, from: &str, target: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(group) = self.groups.get(id) {
                stack.extend(group.objects.iter().map(|o| o.id.as_str()));
            }
        }
        false
    }
}

#[async_trait]
impl NetworkGroupsApi for FakeFmc {
    async fn list_network_groups(&self, _domain: &str) -> Result<Vec<NetworkGroupObject>> {
        let mut inner = self.lock();
        inner.calls.push(Call::List);
        Ok(inner.groups.values().cloned().collect())
    }

    async fn bulk_create_network_groups(
        &self,
        _domain: &str,
        groups: &[NetworkGroupObject],
    ) -> Result<Vec<NetworkGroupObject>> {
        let mut inner = self.lock();
        inner
            .calls
            .push(Call::BulkCreate(groups.iter().map(|g| g.name.clone()).collect()));

        let attempt = inner.bulk_seen;
        inner.bulk_seen += 1;
        if inner.fail_bulk_at == Some(attempt) {
            return Err(ClientError::Api {
                status: 422,
                message: "bulk rejected".to_string(),
            });
        }

        for group in groups {
            inner.check_references(group)?;
            if inner.groups.values().any(|g| g.name == group.name) {
                return Err(ClientError::Api {
                    status: 400,
                    message: format!("duplicate name {}", group.name),
                });
            }
        }

        let mut created = Vec::new();
        for group in groups {
            inner.next_id += 1;
            let id = format!("id-{}", inner.next_id);
            let mut stored = group.clone();
            stored.id = Some(id.clone());
            for object in &mut stored.objects {
                let kind = if inner.groups.contains_key(&object.id) {
                    "NetworkGroup"
                } else {
                    "Host"
                };
                object.kind = Some(kind.to_string());
            }
            inner.groups.insert(id, stored.clone());
            created.push(stored);
        }
        Ok(created)
    }

    async fn update_network_group(
        &self,
        _domain: &str,
        id: &str,
        group: &NetworkGroupObject,
    ) -> Result<NetworkGroupObject> {
        let mut inner = self.lock();
        inner.calls.push(Call::Update(group.name.clone()));

        if !inner.groups.contains_key(id) {
            return Err(ClientError::NotFound(id.to_string()));
        }
        inner.check_references(group)?;
        if let Some(member) = group.objects.iter().find(|o| inner.contains(&o.id, id)) {
            return Err(ClientError::Api {
                status: 400,
                message: format!("{} would contain itself through {}", group.name, member.id),
            });
        }

        let mut stored = group.clone();
        stored.id = Some(id.to_string());
        for object in &mut stored.objects {
            let kind = if inner.groups.contains_key(&object.id) {
                "NetworkGroup"
            } else {
                "Host"
            };
            object.kind = Some(kind.to_string());
        }
        inner.groups.insert(id.to_string(), stored.clone());
        Ok(stored)
    }

    async fn delete_network_group(&self, _domain: &str, id: &str) -> Result<()> {
        let mut inner = self.lock();
        let name = inner
            .groups
            .get(id)
            .map(|g| g.name.clone())
            .or_else(|| inner.vanished.get(id).cloned())
            .unwrap_or_else(|| id.to_string());
        inner.calls.push(Call::Delete(name.clone()));

        if inner.fail_delete.contains(&name) {
            return Err(ClientError::Api {
                status: 500,
                message: format!("cannot delete {}", name),
            });
        }
        if !inner.groups.contains_key(id) {
            return Err(ClientError::NotFound(id.to_string()));
        }
        if let Some(user) = inner
            .groups
            .values()
            .find(|g| g.objects.iter().any(|o| o.id == id))
        {
            return Err(ClientError::Api {
                status: 400,
                message: format!("{} is in use by {}", name, user.name),
            });
        }

        inner.groups.remove(id);
        Ok(())
    }
}
