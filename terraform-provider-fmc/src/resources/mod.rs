//! Terraform Resources for FMC
//!
//! Defines the resources and data sources that can be managed via Terraform.

pub mod network_groups;

use crate::client::FmcClient;
use crate::schema::{Diagnostic, ResourceSchema};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub use network_groups::{NetworkGroupsDataSource, NetworkGroupsResource};

/// Result type for resource operations
pub type ResourceResult<T> = Result<T, Vec<Diagnostic>>;

/// Resource state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub values: HashMap<String, Value>,
}

impl ResourceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State from a JSON object; anything else yields `None`
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object().map(|obj| Self {
            values: obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(|v| v.as_str()).map(String::from)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }
}

/// What an apply leaves behind. `new_state` is persisted even when
/// `diagnostics` carries errors, so a failed apply keeps everything that
/// did succeed.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub new_state: Option<ResourceState>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ApplyOutcome {
    pub fn failed(diagnostics: Vec<Diagnostic>, new_state: Option<ResourceState>) -> Self {
        Self {
            new_state,
            diagnostics,
        }
    }
}

/// Result of planning a change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlannedChange {
    pub planned_state: ResourceState,
    /// Attribute paths whose change forces destroy-then-create
    pub requires_replace: Vec<Vec<String>>,
}

impl PlannedChange {
    pub fn new(planned_state: ResourceState) -> Self {
        Self {
            planned_state,
            requires_replace: Vec::new(),
        }
    }

    pub fn with_replace(mut self, path: &[&str]) -> Self {
        self.requires_replace
            .push(path.iter().map(|p| p.to_string()).collect());
        self
    }
}

/// Resource trait
#[async_trait]
pub trait Resource: Send + Sync {
    /// Resource type name
    fn type_name(&self) -> &str;

    /// Get the schema for this resource
    fn schema(&self) -> ResourceSchema;

    /// Static checks on a configuration, no API access
    fn validate(&self, config: &ResourceState) -> Vec<Diagnostic> {
        let _ = config;
        Vec::new()
    }

    /// Create a new resource
    async fn create(&self, client: &FmcClient, planned: &ResourceState) -> ApplyOutcome;

    /// Read an existing resource
    async fn read(
        &self,
        client: &FmcClient,
        current: &ResourceState,
    ) -> ResourceResult<ResourceState>;

    /// Update an existing resource
    async fn update(
        &self,
        client: &FmcClient,
        current: &ResourceState,
        planned: &ResourceState,
    ) -> ApplyOutcome;

    /// Delete a resource
    async fn delete(&self, client: &FmcClient, current: &ResourceState) -> ApplyOutcome;

    /// Plan changes
    fn plan_change(
        &self,
        current: Option<&ResourceState>,
        proposed: &ResourceState,
    ) -> ResourceResult<PlannedChange> {
        let _ = current;
        Ok(PlannedChange::new(proposed.clone()))
    }

    /// State to read when importing `id`
    fn import_state(&self, id: &str) -> ResourceResult<ResourceState> {
        let mut state = ResourceState::new();
        state.set("id", Value::String(id.to_string()));
        Ok(state)
    }
}

/// Data source trait
#[async_trait]
pub trait DataSource: Send + Sync {
    fn type_name(&self) -> &str;

    fn schema(&self) -> ResourceSchema;

    async fn read(&self, client: &FmcClient, config: &ResourceState)
        -> ResourceResult<ResourceState>;
}

/// Get all available resources
pub fn get_all_resources() -> Vec<Box<dyn Resource>> {
    vec![Box::new(NetworkGroupsResource::new())]
}

/// Get all available data sources
pub fn get_all_data_sources() -> Vec<Box<dyn DataSource>> {
    vec![Box::new(NetworkGroupsDataSource::new())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_state() {
        let mut state = ResourceState::new();
        state.set("domain", serde_json::json!("Global"));
        state.set("items", serde_json::json!({}));

        assert_eq!(state.get_string("domain"), Some("Global".to_string()));
        assert!(state.get("items").unwrap().is_object());
        assert_eq!(state.get_string("items"), None);
    }

    #[test]
    fn test_resource_state_from_value() {
        let state = ResourceState::from_value(&serde_json::json!({"id": "x"})).unwrap();
        assert_eq!(state.get_string("id"), Some("x".to_string()));
        assert!(ResourceState::from_value(&Value::Null).is_none());
    }

    #[test]
    fn test_planned_change_replace_paths() {
        let change = PlannedChange::new(ResourceState::new()).with_replace(&["domain"]);
        assert_eq!(change.requires_replace, vec![vec!["domain".to_string()]]);
    }

    #[test]
    fn test_registries() {
        let resources = get_all_resources();
        let data_sources = get_all_data_sources();
        assert_eq!(resources[0].type_name(), "fmc_network_groups");
        assert_eq!(data_sources[0].type_name(), "fmc_network_groups");
    }
}
