//! Turn FMC's flat membership lists back into the Terraform model.
//!
//! FMC only knows one `objects` list per group. A member that is itself a
//! group owned by the same resource instance is reported by name under
//! `network_groups`; anything else, including groups managed elsewhere,
//! stays in `objects`.

use super::{GroupSet, Literal, NetworkGroup, ObjectRef, GROUP_KIND};
use crate::client::NetworkGroupObject;
use std::collections::{HashMap, HashSet};

/// Remote ids of the groups this instance owns, mapped to their names
#[derive(Debug, Default, Clone)]
pub struct OwnedGroups {
    by_id: HashMap<String, String>,
    names: HashSet<String>,
}

impl OwnedGroups {
    /// Owned ids as found in a listing, for the given names
    pub fn from_listing<'n>(
        listing: &[NetworkGroupObject],
        names: impl IntoIterator<Item = &'n str>,
    ) -> Self {
        let names: HashSet<&str> = names.into_iter().collect();
        let by_id = listing
            .iter()
            .filter(|item| names.contains(item.name.as_str()))
            .filter_map(|item| Some((item.id.clone()?, item.name.clone())))
            .collect::<HashMap<_, _>>();
        let names = by_id.values().cloned().collect();
        Self { by_id, names }
    }

    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.by_id.get(id).map(String::as_str)
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

/// Convert one listed group into its tracked form
pub fn synthesize_network_groups_item(
    item: &NetworkGroupObject,
    owned: &OwnedGroups,
) -> NetworkGroup {
    let mut network_groups = Vec::new();
    let mut objects = Vec::new();

    for object in &item.objects {
        let is_group = object.kind.as_deref() == Some(GROUP_KIND);
        match owned.name_of(&object.id) {
            Some(name) if is_group => network_groups.push(name.to_string()),
            _ => objects.push(ObjectRef {
                id: object.id.clone(),
            }),
        }
    }

    NetworkGroup {
        id: item.id.clone(),
        description: item.description.clone(),
        overridable: item.overridable,
        network_groups,
        objects,
        literals: item
            .literals
            .iter()
            .map(|l| Literal {
                value: l.value.clone(),
            })
            .collect(),
    }
}

/// Convert every owned group of a listing; groups owned by nobody here are
/// left out.
pub fn synthesize_network_groups(
    listing: &[NetworkGroupObject],
    owned: &OwnedGroups,
) -> GroupSet {
    listing
        .iter()
        .filter(|item| owned.contains_name(&item.name))
        .map(|item| (item.name.clone(), synthesize_network_groups_item(item, owned)))
        .collect()
}
