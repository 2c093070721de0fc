//! Terraform Schema Types
//!
//! Schema, RPC and diagnostic types exchanged with Terraform.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Attribute type for schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Number,
    Bool,
    Set(Box<AttributeType>),
}

/// Schema attribute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaAttribute {
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub computed: bool,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl SchemaAttribute {
    fn of(attr_type: AttributeType) -> Self {
        Self {
            attr_type,
            description: None,
            required: false,
            optional: false,
            computed: false,
            sensitive: false,
            default: None,
        }
    }

    pub fn string() -> Self {
        Self::of(AttributeType::String)
    }

    pub fn number() -> Self {
        Self::of(AttributeType::Number)
    }

    pub fn bool() -> Self {
        Self::of(AttributeType::Bool)
    }

    pub fn set(element_type: AttributeType) -> Self {
        Self::of(AttributeType::Set(Box::new(element_type)))
    }

    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = Some(desc.to_string());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self.required = false;
        self
    }

    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Block type for nested blocks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaBlock {
    pub attributes: HashMap<String, SchemaAttribute>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub blocks: HashMap<String, NestedBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SchemaBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, name: &str, attr: SchemaAttribute) -> Self {
        self.attributes.insert(name.to_string(), attr);
        self
    }

    pub fn with_block(mut self, name: &str, block: NestedBlock) -> Self {
        self.blocks.insert(name.to_string(), block);
        self
    }

    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = Some(desc.to_string());
        self
    }
}

/// Nested block type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NestedBlock {
    pub nesting_mode: NestingMode,
    pub block: SchemaBlock,
}

impl NestedBlock {
    fn nested(nesting_mode: NestingMode, block: SchemaBlock) -> Self {
        Self {
            nesting_mode,
            block,
        }
    }

    /// Blocks keyed by a user-chosen label
    pub fn map(block: SchemaBlock) -> Self {
        Self::nested(NestingMode::Map, block)
    }

    pub fn set(block: SchemaBlock) -> Self {
        Self::nested(NestingMode::Set, block)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NestingMode {
    Set,
    Map,
}

/// Resource schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub version: i64,
    pub block: SchemaBlock,
}

impl ResourceSchema {
    pub fn new(version: i64, block: SchemaBlock) -> Self {
        Self { version, block }
    }
}

/// Provider schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSchema {
    pub provider: SchemaBlock,
    pub resource_schemas: HashMap<String, ResourceSchema>,
    pub data_source_schemas: HashMap<String, ResourceSchema>,
}

impl ProviderSchema {
    pub fn new(provider: SchemaBlock) -> Self {
        Self {
            provider,
            resource_schemas: HashMap::new(),
            data_source_schemas: HashMap::new(),
        }
    }

    pub fn with_resource(mut self, name: &str, schema: ResourceSchema) -> Self {
        self.resource_schemas.insert(name.to_string(), schema);
        self
    }

    pub fn with_data_source(mut self, name: &str, schema: ResourceSchema) -> Self {
        self.data_source_schemas.insert(name.to_string(), schema);
        self
    }
}

// ============================================================================
// Terraform Plugin Protocol Messages
// ============================================================================

/// JSON-RPC request
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: i64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// JSON-RPC response
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// JSON-RPC error
#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcResponse {
    pub fn success(id: i64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Successful call that only reports diagnostics
    pub fn diagnostics(id: i64, diagnostics: &[Diagnostic]) -> Self {
        Self::success(id, serde_json::json!({ "diagnostics": diagnostics }))
    }

    pub fn error(id: i64, code: i32, message: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }
}

/// Diagnostic severity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticSeverity {
    Invalid,
    Error,
    Warning,
}

/// Diagnostic message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<Vec<String>>,
}

impl Diagnostic {
    pub fn error(summary: &str) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            summary: summary.to_string(),
            detail: None,
            attribute: None,
        }
    }

    pub fn with_detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    pub fn with_attribute(mut self, path: Vec<String>) -> Self {
        self.attribute = Some(path);
        self
    }
}
