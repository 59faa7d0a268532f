use rmcp::{ErrorData as McpError, model::*};
use serde::Serialize;

use crate::gateway::GatewayCore;

/// Scheme for gateway-level resources (as opposed to `<backend>://...` URIs,
/// which the Stdio Router resolves by scheme-as-backend-name).
const GATEWAY_SCHEME: &str = "rolegate";

pub fn list_static_resources() -> Vec<Resource> {
    vec![overview_resource(), backends_resource()]
}

fn overview_resource() -> Resource {
    Resource {
        raw: RawResource {
            uri: format!("{GATEWAY_SCHEME}://overview"),
            name: "overview".to_string(),
            title: Some("Gateway Overview".to_string()),
            description: Some(
                "Current role, visible tool count, and connected backends".to_string(),
            ),
            mime_type: Some("text/plain".to_string()),
            size: None,
            icons: None,
            meta: None,
        },
        annotations: None,
    }
}

fn backends_resource() -> Resource {
    Resource {
        raw: RawResource {
            uri: format!("{GATEWAY_SCHEME}://backends"),
            name: "backends".to_string(),
            title: Some("Backend List".to_string()),
            description: Some("JSON list of all configured backends and their state".to_string()),
            mime_type: Some("application/json".to_string()),
            size: None,
            icons: None,
            meta: None,
        },
        annotations: None,
    }
}

/// The two gateway resources plus whatever every connected backend reports
/// from its own `resources/list` (carried through opaquely).
pub async fn list_resources(core: &GatewayCore) -> Vec<Resource> {
    let mut resources = list_static_resources();
    for value in core.router().aggregate_resources().await {
        if let Ok(resource) = serde_json::from_value::<Resource>(value) {
            resources.push(resource);
        }
    }
    resources
}

#[derive(Debug, Serialize)]
struct BackendInfo {
    name: String,
    state: String,
}

pub async fn read_resource(uri: &str, core: &GatewayCore) -> Result<ReadResourceResult, McpError> {
    if let Some(path) = uri.strip_prefix(&format!("{GATEWAY_SCHEME}://")) {
        return match path {
            "overview" => Ok(text_resource(uri, &overview_text(core).await)),
            "backends" => {
                let infos: Vec<BackendInfo> = core
                    .router()
                    .status()
                    .into_iter()
                    .map(|(name, state)| BackendInfo {
                        name,
                        state: format!("{state:?}"),
                    })
                    .collect();
                let json = serde_json::to_string_pretty(&infos)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(text_resource(uri, &json))
            }
            _ => Err(McpError::invalid_params(format!("Unknown resource URI: {uri}"), None)),
        };
    }

    // Anything else is a `<backend>://...` URI: the Stdio Router resolves the
    // scheme to a backend name and forwards `resources/read` unchanged.
    let value = core
        .router()
        .read_resource(uri)
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    serde_json::from_value(value).map_err(|e| McpError::internal_error(e.to_string(), None))
}

async fn overview_text(core: &GatewayCore) -> String {
    let tools = core.list_tools().await;
    let backends = core.router().status();
    let role = core.current_role().unwrap_or_else(|| "<none>".to_string());
    format!(
        "# Gateway Overview\n\n\
         Current role: {role}\n\
         Visible tools: {}\n\
         Backends: {} ({} connected)\n",
        tools.len(),
        backends.len(),
        backends
            .iter()
            .filter(|(_, state)| *state == crate::backend::BackendState::Connected)
            .count(),
    )
}

/// Completion support is intentionally minimal: without a BM25-style search
/// index there's nothing useful to complete beyond the empty default.
pub fn complete(request: &CompleteRequestParams) -> Result<CompleteResult, McpError> {
    let _ = &request.r#ref;
    Ok(CompleteResult::default())
}

fn text_resource(uri: &str, text: &str) -> ReadResourceResult {
    ReadResourceResult {
        contents: vec![ResourceContents::TextResourceContents {
            uri: uri.to_string(),
            mime_type: Some("text/plain".to_string()),
            text: text.to_string(),
            meta: None,
        }],
    }
}
