//! `fmc_network_groups` resource and data source
//!
//! One resource instance owns a whole collection of network groups, keyed
//! by name under `items`.

use super::{ApplyOutcome, DataSource, PlannedChange, Resource, ResourceResult, ResourceState};
use crate::client::{FmcClient, NetworkGroupsApi};
use crate::network_groups::graph::topological_seq;
use crate::network_groups::synthesis::{synthesize_network_groups, OwnedGroups};
use crate::network_groups::{
    GroupSet, NetworkGroup, NetworkGroupsSync, SyncError, SyncOutcome, ROOT_ID,
};
use crate::schema::{
    AttributeType, Diagnostic, NestedBlock, ResourceSchema, SchemaAttribute, SchemaBlock,
};
use async_trait::async_trait;
use serde_json::Value;

fn item_block(computed: bool) -> SchemaBlock {
    let settable = |attr: SchemaAttribute| {
        if computed {
            attr.computed()
        } else {
            attr.optional()
        }
    };

    let object_block = SchemaBlock::new().with_attribute(
        "id",
        settable(SchemaAttribute::string()).with_description("Id of a network object"),
    );
    let literal_block = SchemaBlock::new().with_attribute(
        "value",
        settable(SchemaAttribute::string()).with_description("Host address or CIDR network"),
    );

    let overridable = if computed {
        SchemaAttribute::bool().computed()
    } else {
        SchemaAttribute::bool()
            .optional()
            .with_default(serde_json::json!(false))
    };

    SchemaBlock::new()
        .with_attribute(
            "id",
            SchemaAttribute::string()
                .with_description("Id of the network group")
                .computed(),
        )
        .with_attribute(
            "description",
            settable(SchemaAttribute::string()).with_description("Description"),
        )
        .with_attribute(
            "overridable",
            overridable.with_description("Whether the object values can be overridden"),
        )
        .with_attribute(
            "network_groups",
            settable(SchemaAttribute::set(AttributeType::String))
                .with_description("Names of other items of this resource to include as members"),
        )
        .with_block("objects", NestedBlock::set(object_block))
        .with_block("literals", NestedBlock::set(literal_block))
}

fn domain_attribute() -> SchemaAttribute {
    SchemaAttribute::string()
        .with_description("Name of the FMC domain. Defaults to the provider domain")
        .optional()
}

/// Parse `items` out of a state or config
fn groups_from_state(state: &ResourceState) -> ResourceResult<GroupSet> {
    match state.get("items") {
        None | Some(Value::Null) => Ok(GroupSet::new()),
        Some(items) => serde_json::from_value(items.clone()).map_err(|e| {
            vec![Diagnostic::error("Invalid items")
                .with_detail(&e.to_string())
                .with_attribute(vec!["items".to_string()])]
        }),
    }
}

fn state_from_groups(
    domain: Option<&Value>,
    groups: &GroupSet,
) -> ResourceResult<ResourceState> {
    let items = serde_json::to_value(groups).map_err(|e| {
        vec![Diagnostic::error("Failed to encode items").with_detail(&e.to_string())]
    })?;

    let mut state = ResourceState::new();
    state.set("id", Value::String(ROOT_ID.to_string()));
    state.set("domain", domain.cloned().unwrap_or(Value::Null));
    state.set("items", items);
    Ok(state)
}

fn domain_name(state: &ResourceState) -> Option<&str> {
    state.get("domain").and_then(Value::as_str)
}

fn domain_uuid(client: &FmcClient, state: &ResourceState) -> ResourceResult<String> {
    let name = state.get_string("domain");
    client.domain_uuid(name.as_deref()).map_err(|e| {
        vec![Diagnostic::error("Invalid domain")
            .with_detail(&e.to_string())
            .with_attribute(vec!["domain".to_string()])]
    })
}

/// Turn a sync outcome into what Terraform persists
fn apply_outcome(domain: Option<&Value>, outcome: SyncOutcome) -> ApplyOutcome {
    let mut diagnostics: Vec<Diagnostic> =
        outcome.error.iter().map(SyncError::to_diagnostic).collect();
    let new_state = match state_from_groups(domain, &outcome.state) {
        Ok(state) => Some(state),
        Err(mut encode) => {
            diagnostics.append(&mut encode);
            None
        }
    };
    ApplyOutcome {
        new_state,
        diagnostics,
    }
}

/// Reconcile `prior` against the plan in the planned domain
async fn sync(client: &FmcClient, prior: &GroupSet, planned: &ResourceState) -> ApplyOutcome {
    let desired = match groups_from_state(planned) {
        Ok(groups) => groups,
        Err(diagnostics) => return ApplyOutcome::failed(diagnostics, None),
    };
    let domain = match domain_uuid(client, planned) {
        Ok(domain) => domain,
        Err(diagnostics) => return ApplyOutcome::failed(diagnostics, None),
    };

    let outcome = NetworkGroupsSync::new(client, &domain)
        .reconcile(prior, &desired)
        .await;
    apply_outcome(planned.get("domain"), outcome)
}

/// Manages a collection of FMC network groups that may contain each other
pub struct NetworkGroupsResource;

impl NetworkGroupsResource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NetworkGroupsResource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resource for NetworkGroupsResource {
    fn type_name(&self) -> &str {
        "fmc_network_groups"
    }

    fn schema(&self) -> ResourceSchema {
        let block = SchemaBlock::new()
            .with_attribute(
                "id",
                SchemaAttribute::string()
                    .with_description("Fixed id of the collection")
                    .computed(),
            )
            .with_attribute("domain", domain_attribute())
            .with_block("items", NestedBlock::map(item_block(false)))
            .with_description(
                "Manages a set of Network Groups in bulk. Items may reference each other \
                 through network_groups; they are created in dependency order.",
            );

        ResourceSchema::new(1, block)
    }

    fn validate(&self, config: &ResourceState) -> Vec<Diagnostic> {
        let groups = match groups_from_state(config) {
            Ok(groups) => groups,
            Err(diagnostics) => return diagnostics,
        };

        let mut diagnostics = Vec::new();
        if groups.keys().any(|name| name.trim().is_empty()) {
            diagnostics.push(
                Diagnostic::error("Invalid items")
                    .with_detail("network group names must not be empty")
                    .with_attribute(vec!["items".to_string()]),
            );
        }
        if let Err(e) = topological_seq(&groups) {
            diagnostics.push(e.to_diagnostic());
        }
        diagnostics
    }

    async fn create(&self, client: &FmcClient, planned: &ResourceState) -> ApplyOutcome {
        sync(client, &GroupSet::new(), planned).await
    }

    async fn read(
        &self,
        client: &FmcClient,
        current: &ResourceState,
    ) -> ResourceResult<ResourceState> {
        let tracked = groups_from_state(current)?;
        let domain = domain_uuid(client, current)?;

        let groups = NetworkGroupsSync::new(client, &domain)
            .read(&tracked)
            .await
            .map_err(|e| vec![e.to_diagnostic()])?;

        if !tracked.is_empty() && groups.is_empty() {
            // Every group is gone remotely
            return Ok(ResourceState::new());
        }

        state_from_groups(current.get("domain"), &groups)
    }

    async fn update(
        &self,
        client: &FmcClient,
        current: &ResourceState,
        planned: &ResourceState,
    ) -> ApplyOutcome {
        // Tracked ids belong to the prior domain's collection
        if domain_name(current) != domain_name(planned) {
            return ApplyOutcome::failed(
                vec![Diagnostic::error("Domain change requires replacement")
                    .with_detail("network groups cannot move between domains in place")
                    .with_attribute(vec!["domain".to_string()])],
                Some(current.clone()),
            );
        }

        let prior = match groups_from_state(current) {
            Ok(groups) => groups,
            Err(diagnostics) => return ApplyOutcome::failed(diagnostics, None),
        };
        sync(client, &prior, planned).await
    }

    async fn delete(&self, client: &FmcClient, current: &ResourceState) -> ApplyOutcome {
        let prior = match groups_from_state(current) {
            Ok(groups) => groups,
            Err(diagnostics) => return ApplyOutcome::failed(diagnostics, None),
        };
        let domain = match domain_uuid(client, current) {
            Ok(domain) => domain,
            Err(diagnostics) => return ApplyOutcome::failed(diagnostics, None),
        };

        let outcome = NetworkGroupsSync::new(client, &domain)
            .reconcile(&prior, &GroupSet::new())
            .await;
        if outcome.is_ok() {
            return ApplyOutcome::default();
        }
        apply_outcome(current.get("domain"), outcome)
    }

    fn plan_change(
        &self,
        current: Option<&ResourceState>,
        proposed: &ResourceState,
    ) -> ResourceResult<PlannedChange> {
        let replace = current
            .map(|state| domain_name(state) != domain_name(proposed))
            .unwrap_or(false);
        let prior = match current {
            Some(state) if !replace => groups_from_state(state)?,
            _ => GroupSet::new(),
        };
        let proposed_groups = groups_from_state(proposed)?;
        topological_seq(&proposed_groups).map_err(|e| vec![e.to_diagnostic()])?;

        let planned: GroupSet = proposed_groups
            .into_iter()
            .map(|(name, group)| {
                let id = prior.get(&name).and_then(|g| g.id.clone());
                (name, NetworkGroup { id, ..group })
            })
            .collect();

        let change = PlannedChange::new(state_from_groups(proposed.get("domain"), &planned)?);
        if replace {
            return Ok(change.with_replace(&["domain"]));
        }
        Ok(change)
    }

    /// Import id: `[domain:]name1,name2,...`
    fn import_state(&self, id: &str) -> ResourceResult<ResourceState> {
        let (domain, names) = match id.split_once(':') {
            Some((domain, names)) => (Some(domain.trim()), names),
            None => (None, id),
        };

        let groups: GroupSet = names
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| (name.to_string(), NetworkGroup::default()))
            .collect();
        if groups.is_empty() {
            return Err(vec![Diagnostic::error("Invalid import id").with_detail(
                "expected a comma-separated list of network group names, \
                 optionally prefixed with \"<domain>:\"",
            )]);
        }

        let domain = domain.map(|d| Value::String(d.to_string()));
        state_from_groups(domain.as_ref(), &groups)
    }
}

/// Reads named network groups
pub struct NetworkGroupsDataSource;

impl NetworkGroupsDataSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NetworkGroupsDataSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSource for NetworkGroupsDataSource {
    fn type_name(&self) -> &str {
        "fmc_network_groups"
    }

    fn schema(&self) -> ResourceSchema {
        let block = SchemaBlock::new()
            .with_attribute(
                "id",
                SchemaAttribute::string()
                    .with_description("Fixed id of the collection")
                    .computed(),
            )
            .with_attribute("domain", domain_attribute())
            .with_block("items", NestedBlock::map(item_block(true)))
            .with_description("Reads Network Groups by name");

        ResourceSchema::new(1, block)
    }

    async fn read(
        &self,
        client: &FmcClient,
        config: &ResourceState,
    ) -> ResourceResult<ResourceState> {
        let wanted = groups_from_state(config)?;
        let domain = domain_uuid(client, config)?;

        let listing = client.list_network_groups(&domain).await.map_err(|e| {
            vec![Diagnostic::error("Client Error")
                .with_detail(&format!("failed to read network groups: {}", e))]
        })?;

        let owned = OwnedGroups::from_listing(&listing, wanted.keys().map(String::as_str));
        let groups = synthesize_network_groups(&listing, &owned);

        let missing: Vec<&str> = wanted
            .keys()
            .filter(|name| !groups.contains_key(*name))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(vec![Diagnostic::error("Network groups not found")
                .with_detail(&format!("no network group named: {}", missing.join(", ")))
                .with_attribute(vec!["items".to_string()])]);
        }

        state_from_groups(config.get("domain"), &groups)
    }
}
