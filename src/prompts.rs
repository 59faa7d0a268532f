//! Prompt aggregation and delegation. Backend prompts are name-prefixed the
//! same way tools are (`backend__promptname`) so `prompts/get` can recover
//! the owning backend without a separate annotation channel; the gateway's
//! own prompts live unprefixed alongside them.

use rmcp::{ErrorData as McpError, model::*};
use serde_json::Value;

use crate::backend::longest_prefix_match;
use crate::gateway::GatewayCore;

pub fn local_prompts() -> Vec<Prompt> {
    vec![
        Prompt {
            name: "discover".to_string(),
            title: Some("Discover Tools".to_string()),
            description: Some(
                "Guided workflow for discovering the tools visible to the current role"
                    .to_string(),
            ),
            arguments: None,
            icons: None,
            meta: None,
        },
        Prompt {
            name: "backend_status".to_string(),
            title: Some("Backend Status".to_string()),
            description: Some("Connection state of every configured backend".to_string()),
            arguments: None,
            icons: None,
            meta: None,
        },
    ]
}

/// Local prompts plus every backend's own prompts, prefixed `backend__name`.
pub async fn list_prompts(core: &GatewayCore) -> Vec<Prompt> {
    let mut prompts = local_prompts();
    for name in core.router().status().into_iter().map(|(name, _)| name) {
        let Ok(value) = core.router().route_to_backend(&name, "prompts/list", None).await else {
            continue;
        };
        let backend_prompts: Vec<Prompt> = value
            .get("prompts")
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default();
        for mut prompt in backend_prompts {
            prompt.name = format!("{name}__{}", prompt.name);
            prompts.push(prompt);
        }
    }
    prompts
}

pub async fn get_prompt(
    name: &str,
    arguments: Option<JsonObject>,
    core: &GatewayCore,
) -> Result<GetPromptResult, McpError> {
    match name {
        "discover" => Ok(discover_prompt(core).await),
        "backend_status" => Ok(backend_status_prompt(core)),
        _ => {
            let connected: Vec<String> = core.router().status().into_iter().map(|(n, _)| n).collect();
            let (backend, rest) = longest_prefix_match(connected.iter().map(String::as_str), name)
                .ok_or_else(|| McpError::invalid_params(format!("Unknown prompt: {name}"), None))?;

            let params = serde_json::json!({
                "name": rest,
                "arguments": arguments.map(Value::Object).unwrap_or(Value::Null),
            });
            let value = core
                .router()
                .route_to_backend(backend, "prompts/get", Some(params))
                .await
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
            serde_json::from_value(value).map_err(|e| McpError::internal_error(e.to_string(), None))
        }
    }
}

async fn discover_prompt(core: &GatewayCore) -> GetPromptResult {
    let tools = core.list_tools().await;
    let role = core.current_role().unwrap_or_else(|| "<none>".to_string());

    let text = format!(
        "# Tool Discovery\n\n\
         Current role: **{role}**. You can currently see **{}** tools.\n\n\
         ## Step 1\n\
         Call `tools/list` to see the names and schemas of everything visible to this role.\n\n\
         ## Step 2\n\
         Call a tool by its prefixed name (`backend__tool`). A call to a tool outside the \
         visible set is rejected before it reaches any backend.\n\n\
         ## Switching roles\n\
         Use `router__list_roles` to see what other roles are available, then \
         `router__set_role` with `{{\"role\": \"<role id>\"}}` to switch to one. A host \
         watching for `notifications/tools/list_changed` will see the visible set update.\n",
        tools.len(),
    );

    GetPromptResult {
        description: Some("Guided workflow for discovering visible tools".to_string()),
        messages: vec![PromptMessage::new_text(PromptMessageRole::Assistant, text)],
    }
}

fn backend_status_prompt(core: &GatewayCore) -> GetPromptResult {
    let statuses = core.router().status();
    let mut text = format!(
        "# Backend Status\n\n\
         **Total:** {} backends\n\n\
         | Backend | State |\n\
         |---------|-------|\n",
        statuses.len(),
    );
    for (name, state) in &statuses {
        text.push_str(&format!("| {name} | {state:?} |\n"));
    }

    GetPromptResult {
        description: Some("Connection state of every configured backend".to_string()),
        messages: vec![PromptMessage::new_text(PromptMessageRole::Assistant, text)],
    }
}
