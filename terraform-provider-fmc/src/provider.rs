//! Terraform Provider Implementation
//!
//! Implements the Terraform Plugin Protocol for Cisco FMC.

use crate::client::FmcClient;
use crate::resources::{
    get_all_data_sources, get_all_resources, ApplyOutcome, DataSource, Resource, ResourceState,
};
use crate::schema::{
    Diagnostic, ProviderSchema, RpcRequest, RpcResponse, SchemaAttribute, SchemaBlock,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Runtime;

/// Seconds a single FMC request may take unless configured otherwise
pub const DEFAULT_REQ_TIMEOUT: u64 = 30;

/// Provider configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure: Option<bool>,
    pub req_timeout: Option<u64>,
    pub domain: Option<String>,
}

impl ProviderConfig {
    /// Fill attributes left unset from the `FMC_*` environment variables
    pub fn with_env_defaults(self) -> Self {
        self.with_env_defaults_from(|key| std::env::var(key).ok())
    }

    /// Same as [`with_env_defaults`](Self::with_env_defaults) with an
    /// injectable lookup. Explicit attributes always win.
    pub fn with_env_defaults_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());

        self.url = self.url.or_else(|| lookup("FMC_URL"));
        self.username = self.username.or_else(|| lookup("FMC_USERNAME"));
        self.password = self.password.or_else(|| lookup("FMC_PASSWORD"));
        self.insecure = self
            .insecure
            .or_else(|| lookup("FMC_INSECURE").and_then(|v| v.parse().ok()));
        self.req_timeout = self
            .req_timeout
            .or_else(|| lookup("FMC_REQ_TIMEOUT").and_then(|v| v.parse().ok()));
        self
    }
}

/// FMC Terraform Provider
pub struct FmcProvider {
    client: Arc<RwLock<Option<FmcClient>>>,
    resources: HashMap<String, Box<dyn Resource>>,
    data_sources: HashMap<String, Box<dyn DataSource>>,
    runtime: Runtime,
}

impl FmcProvider {
    /// Create a new provider
    pub fn new() -> std::io::Result<Self> {
        let resources: HashMap<String, Box<dyn Resource>> = get_all_resources()
            .into_iter()
            .map(|r| (r.type_name().to_string(), r))
            .collect();
        let data_sources: HashMap<String, Box<dyn DataSource>> = get_all_data_sources()
            .into_iter()
            .map(|d| (d.type_name().to_string(), d))
            .collect();

        let runtime = Runtime::new()?;

        Ok(Self {
            client: Arc::new(RwLock::new(None)),
            resources,
            data_sources,
            runtime,
        })
    }

    /// Get provider schema
    fn get_schema(&self) -> ProviderSchema {
        let provider_block = SchemaBlock::new()
            .with_attribute(
                "url",
                SchemaAttribute::string()
                    .with_description("URL of the FMC (e.g. https://fmc.example.com). Env: FMC_URL")
                    .optional(),
            )
            .with_attribute(
                "username",
                SchemaAttribute::string()
                    .with_description("Username for the FMC API. Env: FMC_USERNAME")
                    .optional(),
            )
            .with_attribute(
                "password",
                SchemaAttribute::string()
                    .with_description("Password for the FMC API. Env: FMC_PASSWORD")
                    .optional()
                    .sensitive(),
            )
            .with_attribute(
                "insecure",
                SchemaAttribute::bool()
                    .with_description("Skip TLS verification. Env: FMC_INSECURE")
                    .optional()
                    .with_default(serde_json::json!(false)),
            )
            .with_attribute(
                "req_timeout",
                SchemaAttribute::number()
                    .with_description("Timeout of a single request in seconds. Env: FMC_REQ_TIMEOUT")
                    .optional()
                    .with_default(serde_json::json!(DEFAULT_REQ_TIMEOUT)),
            )
            .with_attribute(
                "domain",
                SchemaAttribute::string()
                    .with_description("Default domain for resources that do not name one")
                    .optional(),
            )
            .with_description("Cisco Secure Firewall Management Center provider");

        let mut schema = ProviderSchema::new(provider_block);

        for (name, resource) in &self.resources {
            schema = schema.with_resource(name, resource.schema());
        }
        for (name, data_source) in &self.data_sources {
            schema = schema.with_data_source(name, data_source.schema());
        }

        schema
    }

    /// Configure the provider
    fn configure(&self, config: ProviderConfig) -> Vec<Diagnostic> {
        let config = config.with_env_defaults();

        let missing: Vec<&str> = [
            ("url", config.url.is_none()),
            ("username", config.username.is_none()),
            ("password", config.password.is_none()),
        ]
        .iter()
        .filter(|(_, missing)| *missing)
        .map(|(name, _)| *name)
        .collect();
        if !missing.is_empty() {
            return missing
                .into_iter()
                .map(|name| {
                    Diagnostic::error(&format!("{} is required", name))
                        .with_detail(&format!(
                            "set the provider attribute or FMC_{}",
                            name.to_uppercase()
                        ))
                        .with_attribute(vec![name.to_string()])
                })
                .collect();
        }

        let (url, username, password) = match (&config.url, &config.username, &config.password) {
            (Some(url), Some(username), Some(password)) => (url, username, password),
            _ => return vec![Diagnostic::error("Provider configuration is incomplete")],
        };

        let timeout = Duration::from_secs(config.req_timeout.unwrap_or(DEFAULT_REQ_TIMEOUT));
        let client = match FmcClient::new(url, config.insecure.unwrap_or(false), timeout) {
            Ok(client) => client,
            Err(e) => {
                return vec![Diagnostic::error("Failed to create FMC client")
                    .with_detail(&e.to_string())]
            }
        };
        let mut client = client.with_default_domain(config.domain.clone());

        if let Err(e) = self
            .runtime
            .block_on(client.authenticate(username, password))
        {
            return vec![Diagnostic::error("Authentication failed").with_detail(&e.to_string())];
        }

        if let Some(domain) = &config.domain {
            if let Err(e) = client.domain_uuid(Some(domain)) {
                return vec![Diagnostic::error("Invalid domain")
                    .with_detail(&e.to_string())
                    .with_attribute(vec!["domain".to_string()])];
            }
        }

        tracing::info!(url = %url, "Provider configured");

        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(client);

        Vec::new()
    }

    /// Get the configured client
    fn get_client(&self) -> Result<FmcClient, Diagnostic> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Diagnostic::error("Provider not configured"))
    }

    fn get_resource(&self, params: &Value) -> Result<&dyn Resource, Diagnostic> {
        let type_name = type_name(params);
        self.resources
            .get(type_name)
            .map(|r| r.as_ref())
            .ok_or_else(|| Diagnostic::error(&format!("Unknown resource type: {}", type_name)))
    }

    /// Handle an RPC request
    pub fn handle_request(&self, input: &str) -> String {
        let request: RpcRequest = match serde_json::from_str(input) {
            Ok(r) => r,
            Err(e) => {
                return serde_json::to_string(&RpcResponse::error(
                    0,
                    -32700,
                    &format!("Parse error: {}", e),
                ))
                .unwrap_or_default();
            }
        };

        tracing::debug!(method = %request.method, id = request.id, "RPC request");

        let response = match request.method.as_str() {
            "GetProviderSchema" => self.handle_get_schema(request.id),
            "ConfigureProvider" => self.handle_configure(request.id, &request.params),
            "ValidateResourceConfig" => {
                self.handle_validate_resource(request.id, &request.params)
            }
            "PlanResourceChange" => self.handle_plan_resource(request.id, &request.params),
            "ApplyResourceChange" => self.handle_apply_resource(request.id, &request.params),
            "ReadResource" => self.handle_read_resource(request.id, &request.params),
            "ImportResourceState" => self.handle_import_resource(request.id, &request.params),
            "ReadDataSource" => self.handle_read_data_source(request.id, &request.params),
            "StopProvider" => RpcResponse::success(request.id, serde_json::json!({})),
            _ => RpcResponse::error(
                request.id,
                -32601,
                &format!("Method not found: {}", request.method),
            ),
        };

        serde_json::to_string(&response).unwrap_or_else(|e| {
            serde_json::to_string(&RpcResponse::error(
                request.id,
                -32603,
                &format!("Serialization error: {}", e),
            ))
            .unwrap_or_default()
        })
    }

    /// Handle GetProviderSchema
    fn handle_get_schema(&self, id: i64) -> RpcResponse {
        let schema = self.get_schema();
        RpcResponse::success(id, serde_json::to_value(schema).unwrap_or_default())
    }

    /// Handle ConfigureProvider
    fn handle_configure(&self, id: i64, params: &Value) -> RpcResponse {
        let config: ProviderConfig = match params.get("config") {
            None | Some(Value::Null) => ProviderConfig::default(),
            Some(c) => match serde_json::from_value(c.clone()) {
                Ok(config) => config,
                Err(e) => {
                    return RpcResponse::diagnostics(
                        id,
                        &[Diagnostic::error("Invalid provider configuration")
                            .with_detail(&e.to_string())],
                    )
                }
            },
        };

        let diagnostics = self.configure(config);
        RpcResponse::diagnostics(id, &diagnostics)
    }

    /// Handle ValidateResourceConfig
    fn handle_validate_resource(&self, id: i64, params: &Value) -> RpcResponse {
        let resource = match self.get_resource(params) {
            Ok(r) => r,
            Err(diag) => return RpcResponse::diagnostics(id, &[diag]),
        };

        let config = state_param(params, "config").unwrap_or_default();
        let diagnostics = resource.validate(&config);

        RpcResponse::diagnostics(id, &diagnostics)
    }

    /// Handle PlanResourceChange
    fn handle_plan_resource(&self, id: i64, params: &Value) -> RpcResponse {
        let resource = match self.get_resource(params) {
            Ok(r) => r,
            Err(diag) => return RpcResponse::diagnostics(id, &[diag]),
        };

        // Destroy plans carry no proposed state
        let proposed_state = match state_param(params, "proposed_new_state") {
            Some(state) => state,
            None => {
                return RpcResponse::success(
                    id,
                    serde_json::json!({
                        "planned_state": null,
                        "diagnostics": []
                    }),
                )
            }
        };
        let prior_state = state_param(params, "prior_state");

        match resource.plan_change(prior_state.as_ref(), &proposed_state) {
            Ok(change) => RpcResponse::success(
                id,
                serde_json::json!({
                    "planned_state": change.planned_state.values,
                    "requires_replace": change.requires_replace,
                    "diagnostics": []
                }),
            ),
            Err(diagnostics) => RpcResponse::diagnostics(id, &diagnostics),
        }
    }

    /// Handle ApplyResourceChange. The new state is always returned, so a
    /// partially applied change is persisted alongside its diagnostics.
    fn handle_apply_resource(&self, id: i64, params: &Value) -> RpcResponse {
        let resource = match self.get_resource(params) {
            Ok(r) => r,
            Err(diag) => return RpcResponse::diagnostics(id, &[diag]),
        };

        let client = match self.get_client() {
            Ok(c) => c,
            Err(diag) => return RpcResponse::diagnostics(id, &[diag]),
        };

        let planned_state = state_param(params, "planned_state");
        let prior_state = state_param(params, "prior_state");

        let outcome = self.runtime.block_on(async {
            match (prior_state, planned_state) {
                (Some(prior), None) => resource.delete(&client, &prior).await,
                (None, None) => ApplyOutcome::default(),
                (None, Some(planned)) => resource.create(&client, &planned).await,
                (Some(prior), Some(planned)) => {
                    resource.update(&client, &prior, &planned).await
                }
            }
        });

        RpcResponse::success(
            id,
            serde_json::json!({
                "new_state": outcome.new_state.map(|s| s.values),
                "diagnostics": outcome.diagnostics
            }),
        )
    }

    /// Handle ReadResource
    fn handle_read_resource(&self, id: i64, params: &Value) -> RpcResponse {
        let resource = match self.get_resource(params) {
            Ok(r) => r,
            Err(diag) => return RpcResponse::diagnostics(id, &[diag]),
        };

        let client = match self.get_client() {
            Ok(c) => c,
            Err(diag) => return RpcResponse::diagnostics(id, &[diag]),
        };

        let current_state = state_param(params, "current_state").unwrap_or_default();

        let result = self
            .runtime
            .block_on(resource.read(&client, &current_state));

        match result {
            Ok(state) if state.values.is_empty() => {
                // Resource no longer exists
                RpcResponse::success(
                    id,
                    serde_json::json!({
                        "new_state": null,
                        "diagnostics": []
                    }),
                )
            }
            Ok(state) => RpcResponse::success(
                id,
                serde_json::json!({
                    "new_state": state.values,
                    "diagnostics": []
                }),
            ),
            Err(diagnostics) => RpcResponse::diagnostics(id, &diagnostics),
        }
    }

    /// Handle ImportResourceState
    fn handle_import_resource(&self, id: i64, params: &Value) -> RpcResponse {
        let resource = match self.get_resource(params) {
            Ok(r) => r,
            Err(diag) => return RpcResponse::diagnostics(id, &[diag]),
        };
        let resource_id = params.get("id").and_then(|v| v.as_str()).unwrap_or("");

        let client = match self.get_client() {
            Ok(c) => c,
            Err(diag) => return RpcResponse::diagnostics(id, &[diag]),
        };

        let import_state = match resource.import_state(resource_id) {
            Ok(state) => state,
            Err(diagnostics) => return RpcResponse::diagnostics(id, &diagnostics),
        };

        let result = self
            .runtime
            .block_on(resource.read(&client, &import_state));

        match result {
            Ok(state) if state.values.is_empty() => RpcResponse::diagnostics(
                id,
                &[Diagnostic::error(&format!("Resource {} not found", resource_id))],
            ),
            Ok(state) => RpcResponse::success(
                id,
                serde_json::json!({
                    "imported_resources": [{
                        "type_name": type_name(params),
                        "state": state.values
                    }],
                    "diagnostics": []
                }),
            ),
            Err(diagnostics) => RpcResponse::diagnostics(id, &diagnostics),
        }
    }

    /// Handle ReadDataSource
    fn handle_read_data_source(&self, id: i64, params: &Value) -> RpcResponse {
        let type_name = type_name(params);
        let data_source = match self.data_sources.get(type_name) {
            Some(d) => d,
            None => {
                return RpcResponse::diagnostics(
                    id,
                    &[Diagnostic::error(&format!("Unknown data source: {}", type_name))],
                )
            }
        };

        let client = match self.get_client() {
            Ok(c) => c,
            Err(diag) => return RpcResponse::diagnostics(id, &[diag]),
        };

        let config = state_param(params, "config").unwrap_or_default();

        match self.runtime.block_on(data_source.read(&client, &config)) {
            Ok(state) => RpcResponse::success(
                id,
                serde_json::json!({
                    "state": state.values,
                    "diagnostics": []
                }),
            ),
            Err(diagnostics) => RpcResponse::diagnostics(id, &diagnostics),
        }
    }
}

fn type_name(params: &Value) -> &str {
    params
        .get("type_name")
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

/// Object-valued request parameter; null or absent yields `None`
fn state_param(params: &Value, key: &str) -> Option<ResourceState> {
    params.get(key).and_then(ResourceState::from_value)
}
