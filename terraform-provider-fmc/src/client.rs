//! FMC REST API Client for the Terraform Provider

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

const TOKEN_PATH: &str = "/api/fmc_platform/v1/auth/generatetoken";
const ACCESS_TOKEN_HEADER: &str = "x-auth-access-token";
const DOMAIN_UUID_HEADER: &str = "domain_uuid";
const DOMAINS_HEADER: &str = "domains";

/// Page size used when walking paged listings.
pub const PAGE_LIMIT: usize = 1000;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Authentication failed")]
    AuthFailed,
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Unknown domain: {0}")]
    UnknownDomain(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// FMC API Client
#[derive(Clone)]
pub struct FmcClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    global_domain: Option<String>,
    default_domain: Option<String>,
    domains: HashMap<String, String>,
}

impl FmcClient {
    /// Create a new client
    pub fn new(base_url: &str, insecure: bool, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            global_domain: None,
            default_domain: None,
            domains: HashMap::new(),
        })
    }

    /// Set authentication token
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Register a domain name and its UUID. The first one registered
    /// becomes the global domain unless the token response named one.
    pub fn with_domain(mut self, name: &str, uuid: &str) -> Self {
        if self.global_domain.is_none() {
            self.global_domain = Some(uuid.to_string());
        }
        self.domains.insert(name.to_string(), uuid.to_string());
        self
    }

    /// Domain name used when a resource does not name one
    pub fn with_default_domain(mut self, name: Option<String>) -> Self {
        self.default_domain = name;
        self
    }

    /// Generate an access token with basic credentials.
    ///
    /// FMC answers with an empty body; the token and the domain list travel
    /// in response headers.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        #[derive(Deserialize)]
        struct DomainEntry {
            name: String,
            uuid: String,
        }

        let url = format!("{}{}", self.base_url, TOKEN_PATH);
        tracing::debug!(url = %url, "Requesting FMC access token");

        let response = self
            .client
            .post(&url)
            .basic_auth(username, Some(password))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::AuthFailed);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let headers = response.headers();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };

        let token = header(ACCESS_TOKEN_HEADER).ok_or_else(|| {
            ClientError::InvalidResponse("token response carries no access token".to_string())
        })?;

        if let Some(raw) = header(DOMAINS_HEADER) {
            let entries: Vec<DomainEntry> = serde_json::from_str(&raw)?;
            self.domains = entries.into_iter().map(|d| (d.name, d.uuid)).collect();
        }
        self.global_domain = header(DOMAIN_UUID_HEADER);
        self.token = Some(token);

        tracing::info!(domains = self.domains.len(), "Authenticated to FMC");
        Ok(())
    }

    /// Resolve a domain name to its UUID. `None` falls back to the provider
    /// default domain, then to the global domain from the token response.
    pub fn domain_uuid(&self, name: Option<&str>) -> Result<String> {
        match name.or(self.default_domain.as_deref()) {
            Some(name) => self
                .domains
                .get(name)
                .cloned()
                .ok_or_else(|| ClientError::UnknownDomain(name.to_string())),
            None => self
                .global_domain
                .clone()
                .ok_or_else(|| ClientError::UnknownDomain("<global>".to_string())),
        }
    }

    /// Build headers for requests
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(token) {
                headers.insert(HeaderName::from_static(ACCESS_TOKEN_HEADER), value);
            }
        }

        headers
    }

    /// GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(method = "GET", path = %path, "FMC request");
        let response = self
            .client
            .get(&url)
            .headers(self.headers())
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// POST request
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(method = "POST", path = %path, "FMC request");
        let response = self
            .client
            .post(&url)
            .headers(self.headers())
            .json(body)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// PUT request
    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(method = "PUT", path = %path, "FMC request");
        let response = self
            .client
            .put(&url)
            .headers(self.headers())
            .json(body)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// DELETE request
    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(method = "DELETE", path = %path, "FMC request");
        let response = self
            .client
            .delete(&url)
            .headers(self.headers())
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(path.to_string())),
            StatusCode::UNAUTHORIZED => Err(ClientError::AuthFailed),
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(ClientError::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    /// Handle API response
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            Ok(serde_json::from_str(&body)?)
        } else if status == StatusCode::UNAUTHORIZED {
            Err(ClientError::AuthFailed)
        } else if status == StatusCode::NOT_FOUND {
            let message = response.text().await.unwrap_or_default();
            Err(ClientError::NotFound(message))
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(ClientError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

// ============================================================================
// API Data Types
// ============================================================================

/// Reference to another object inside a group's membership list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReference {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Literal IP address or network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteralValue {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// Network group as sent to and returned by FMC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkGroupObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type", default = "default_group_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub overridable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<ObjectReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub literals: Vec<LiteralValue>,
}

fn default_group_kind() -> String {
    "NetworkGroup".to_string()
}

/// One page of an expanded listing
#[derive(Debug, Deserialize)]
struct ListPage<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default)]
    paging: Paging,
}

#[derive(Debug, Default, Deserialize)]
struct Paging {
    #[serde(default)]
    next: Vec<String>,
}

/// Bulk POST answers with a wrapped `items` list on most FMC releases and a
/// bare array on a few.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BulkResponse<T> {
    Wrapped { items: Vec<T> },
    Bare(Vec<T>),
}

impl<T> BulkResponse<T> {
    fn into_items(self) -> Vec<T> {
        match self {
            BulkResponse::Wrapped { items } => items,
            BulkResponse::Bare(items) => items,
        }
    }
}

fn network_groups_path(domain: &str) -> String {
    format!("/api/fmc_config/v1/domain/{}/object/networkgroups", domain)
}

// ============================================================================
// API Methods
// ============================================================================

/// The slice of the FMC API the network groups engine talks to.
#[async_trait]
pub trait NetworkGroupsApi: Send + Sync {
    /// Every network group in the domain, all pages concatenated
    async fn list_network_groups(&self, domain: &str) -> Result<Vec<NetworkGroupObject>>;

    /// One bulk POST; the answer lists created groups in request order
    async fn bulk_create_network_groups(
        &self,
        domain: &str,
        groups: &[NetworkGroupObject],
    ) -> Result<Vec<NetworkGroupObject>>;

    async fn update_network_group(
        &self,
        domain: &str,
        id: &str,
        group: &NetworkGroupObject,
    ) -> Result<NetworkGroupObject>;

    /// Fails with `ClientError::NotFound` when the id is already gone
    async fn delete_network_group(&self, domain: &str, id: &str) -> Result<()>;
}

#[async_trait]
impl NetworkGroupsApi for FmcClient {
    async fn list_network_groups(&self, domain: &str) -> Result<Vec<NetworkGroupObject>> {
        let path = network_groups_path(domain);
        let mut items = Vec::new();
        let mut offset = 0;

        loop {
            let page: ListPage<NetworkGroupObject> = self
                .get(&format!(
                    "{}?expanded=true&limit={}&offset={}",
                    path, PAGE_LIMIT, offset
                ))
                .await?;

            let fetched = page.items.len();
            items.extend(page.items);

            if page.paging.next.is_empty() || fetched == 0 {
                break;
            }
            offset += fetched;
        }

        tracing::debug!(count = items.len(), "Listed network groups");
        Ok(items)
    }

    async fn bulk_create_network_groups(
        &self,
        domain: &str,
        groups: &[NetworkGroupObject],
    ) -> Result<Vec<NetworkGroupObject>> {
        let path = format!("{}?bulk=true", network_groups_path(domain));
        let response: BulkResponse<NetworkGroupObject> = self.post(&path, groups).await?;
        Ok(response.into_items())
    }

    async fn update_network_group(
        &self,
        domain: &str,
        id: &str,
        group: &NetworkGroupObject,
    ) -> Result<NetworkGroupObject> {
        self.put(&format!("{}/{}", network_groups_path(domain), id), group)
            .await
    }

    async fn delete_network_group(&self, domain: &str, id: &str) -> Result<()> {
        self.delete(&format!("{}/{}", network_groups_path(domain), id))
            .await
    }
}
