use thiserror::Error;

use crate::jsonrpc::JsonRpcError;

/// Backend/router error taxonomy. Every variant that can reach a caller is
/// rendered as a single text block on a `CallToolResult` with `isError: true`;
/// it never propagates as a transport-level failure.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("backend '{backend}' has no route: {reason}")]
    NoRoute { backend: String, reason: String },

    #[error("request to backend '{backend}' timed out after {deadline_ms}ms")]
    Timeout { backend: String, deadline_ms: u64 },

    #[error("tool '{tool_name}' is not accessible for role '{role}'")]
    NotVisible { tool_name: String, role: String },

    #[error("role '{requested}' not found; available roles: {available}")]
    RoleNotFound {
        requested: String,
        available: String,
    },

    #[error("backend '{backend}' returned an error: {source}")]
    Backend {
        backend: String,
        #[source]
        source: JsonRpcErrorWrapper,
    },

    #[error("gateway is shutting down")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// `JsonRpcError` doesn't implement `std::error::Error` on its own (it is a
/// wire type); this wraps it so it can sit behind `#[source]`.
#[derive(Debug)]
pub struct JsonRpcErrorWrapper(pub JsonRpcError);

impl std::fmt::Display for JsonRpcErrorWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for JsonRpcErrorWrapper {}

impl RouteError {
    pub fn backend(backend: impl Into<String>, source: JsonRpcError) -> Self {
        RouteError::Backend {
            backend: backend.into(),
            source: JsonRpcErrorWrapper(source),
        }
    }

    /// Render as the `isError: true` tool-result text spec.md §7 requires.
    pub fn to_tool_error_text(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_visible_message_names_the_role() {
        let err = RouteError::NotVisible {
            tool_name: "beta__ping".to_string(),
            role: "guest".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("beta__ping"));
        assert!(msg.contains("guest"));
    }

    #[test]
    fn role_not_found_lists_available_roles() {
        let err = RouteError::RoleNotFound {
            requested: "ghost".to_string(),
            available: "guest, admin".to_string(),
        };
        assert!(err.to_string().contains("guest, admin"));
    }

    #[test]
    fn backend_error_wraps_json_rpc_error() {
        let err = RouteError::backend(
            "alpha",
            JsonRpcError {
                code: -32000,
                message: "boom".to_string(),
                data: None,
            },
        );
        assert!(err.to_string().contains("boom"));
    }
}
