//! Network Groups Engine
//!
//! Keeps a named collection of FMC network groups in sync with a desired
//! state. Groups may list sibling groups as children, so creation follows
//! dependency levels and deletion walks the same order backwards.

pub mod bulk;
pub mod error;
pub mod graph;
pub mod reconcile;
pub mod synthesis;

#[cfg(test)]
pub(crate) mod fake;

pub use error::SyncError;
pub use reconcile::{NetworkGroupsSync, SyncOutcome};

use crate::client::{LiteralValue, NetworkGroupObject, ObjectReference};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Stands in for the whole collection, which has no remote object of its own.
pub const ROOT_ID: &str = "00000000-0000-0000-0000-000000000000";

/// FMC object type of a network group
pub const GROUP_KIND: &str = "NetworkGroup";

/// Groups keyed by name, iterated in name order
pub type GroupSet = BTreeMap<String, NetworkGroup>;

/// Reference to a non-group network object by remote id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub id: String,
}

/// Literal host address or CIDR network
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Literal {
    pub value: String,
}

impl Literal {
    /// FMC literal type derived from the value
    pub fn kind(&self) -> &'static str {
        if self.value.contains('/') {
            "Network"
        } else {
            "Host"
        }
    }
}

/// One item of the collection as tracked in Terraform state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkGroup {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub overridable: bool,
    /// Names of sibling groups in the same collection
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub network_groups: Vec<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub objects: Vec<ObjectRef>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub literals: Vec<Literal>,
}

/// Terraform sends `null` for unset optional attributes.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl NetworkGroup {
    /// True when any field sent to FMC differs. Set-typed attributes are
    /// compared without regard to order or duplicates, and the remote id is
    /// not a tracked field.
    pub fn differs_from(&self, other: &NetworkGroup) -> bool {
        fn set<T: Ord + Clone>(items: &[T]) -> BTreeSet<T> {
            items.iter().cloned().collect()
        }

        self.description != other.description
            || self.overridable != other.overridable
            || set(&self.network_groups) != set(&other.network_groups)
            || set(&self.objects) != set(&other.objects)
            || set(&self.literals) != set(&other.literals)
    }

    /// Request body for this group. `child_ids` must hold the remote id of
    /// every name in `network_groups`, in the same order.
    pub fn to_request(&self, name: &str, child_ids: Vec<String>) -> NetworkGroupObject {
        let mut objects: Vec<ObjectReference> = self
            .objects
            .iter()
            .map(|o| ObjectReference {
                id: o.id.clone(),
                kind: None,
                name: None,
            })
            .collect();
        objects.extend(child_ids.into_iter().map(|id| ObjectReference {
            id,
            kind: Some(GROUP_KIND.to_string()),
            name: None,
        }));

        NetworkGroupObject {
            id: self.id.clone(),
            name: name.to_string(),
            kind: GROUP_KIND.to_string(),
            description: self.description.clone(),
            overridable: self.overridable,
            objects,
            literals: self
                .literals
                .iter()
                .map(|l| LiteralValue {
                    kind: l.kind().to_string(),
                    value: l.value.clone(),
                })
                .collect(),
        }
    }
}
