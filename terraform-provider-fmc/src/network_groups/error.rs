//! Errors raised while syncing network groups

use crate::client::ClientError;
use crate::schema::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Children references loop back on themselves; nothing was sent to FMC.
    #[error("network_groups contain a dependency cycle among: {}", .names.join(", "))]
    Cycle { names: Vec<String> },

    #[error("network group {group} references {child}, which is not an item of this resource")]
    UnknownChild { group: String, child: String },

    #[error("failed to {operation} network group {group}: {source}")]
    Client {
        operation: &'static str,
        group: String,
        #[source]
        source: ClientError,
    },

    /// A child id was needed before it was assigned. Points at an ordering bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn client(operation: &'static str, group: &str, source: ClientError) -> Self {
        SyncError::Client {
            operation,
            group: group.to_string(),
            source,
        }
    }

    /// Configuration errors are found before any request is made.
    pub fn is_configuration(&self) -> bool {
        matches!(self, SyncError::Cycle { .. } | SyncError::UnknownChild { .. })
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let (summary, path) = match self {
            SyncError::Cycle { .. } | SyncError::UnknownChild { .. } => {
                ("Invalid network_groups configuration", Some("items"))
            }
            SyncError::Client { .. } => ("Client Error", None),
            SyncError::Internal(_) => ("Provider internal error", None),
        };

        let diagnostic = Diagnostic::error(summary).with_detail(&self.to_string());
        match path {
            Some(attr) => diagnostic.with_attribute(vec![attr.to_string()]),
            None => diagnostic,
        }
    }
}
