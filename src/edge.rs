//! Protocol Edge (C6): the `rmcp::ServerHandler` implementation exposed to
//! clients over stdio. Every tool this gateway advertises is discovered at
//! runtime (backend tools, memory tools, gateway-level tools), so `tools/list`
//! and `tools/call` are implemented by hand rather than through
//! `#[tool_router]`/`#[tool]` — there is no fixed, compile-time tool set to
//! route against.

use std::sync::{Arc, RwLock};

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    model::*,
    service::{Peer, RequestContext},
};
use serde_json::Value;
use tracing::warn;

use crate::backend::RouteError;
use crate::gateway::GatewayCore;
use crate::visibility::ToolEntry;

/// `GatewayCore::set_notify_callback` is synchronous (fire-and-forget), but
/// the `rmcp` notification send is async, so the callback installed here
/// just spawns it. The peer itself is only known once a client has
/// connected, hence the `RwLock<Option<_>>` populated in `initialize`.
#[derive(Clone)]
pub struct RoleGateServer {
    core: Arc<GatewayCore>,
    peer: Arc<RwLock<Option<Peer<RoleServer>>>>,
}

impl RoleGateServer {
    pub fn new(core: Arc<GatewayCore>) -> Self {
        let peer: Arc<RwLock<Option<Peer<RoleServer>>>> = Arc::new(RwLock::new(None));
        let notify_peer = peer.clone();
        core.set_notify_callback(Arc::new(move || {
            let current = notify_peer.read().expect("peer lock poisoned").clone();
            let Some(peer) = current else { return };
            tokio::spawn(async move {
                if let Err(e) = peer.notify_tool_list_changed().await {
                    warn!(error = %e, "failed to send tools/list_changed notification");
                }
            });
        }));
        Self { core, peer }
    }
}

fn entry_to_tool(entry: ToolEntry) -> Tool {
    let schema = match entry.tool.input_schema {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Tool {
        name: entry.prefixed_name.into(),
        title: None,
        description: entry.tool.description.map(Into::into),
        input_schema: Arc::new(schema),
        output_schema: None,
        icons: None,
        annotations: None,
    }
}

/// Backend-forwarded results carry their own `content` array already; local
/// (gateway/memory) results are wrapped the same way by `GatewayCore`, so
/// every success value here has the same `{"content": [...]}` shape.
fn value_to_call_result(value: Value) -> CallToolResult {
    let content = value
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .map(Content::text)
                .collect::<Vec<_>>()
        })
        .filter(|blocks| !blocks.is_empty())
        .unwrap_or_else(|| {
            vec![Content::text(
                serde_json::to_string(&value).unwrap_or_default(),
            )]
        });
    CallToolResult::success(content)
}

fn error_to_call_result(err: RouteError) -> CallToolResult {
    CallToolResult::error(vec![Content::text(err.to_string())])
}

impl ServerHandler for RoleGateServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .enable_prompts()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "rolegate is a role-based MCP gateway. It aggregates tools from several \
                 backend MCP servers behind a single session, and exposes only the subset \
                 the active role is permitted to see.\n\n\
                 - router__list_roles: list the roles available and which one is active\n\
                 - router__get_context: current role, session id, and visible-tool manifest\n\
                 - router__save_memory / router__recall_memory / router__list_memories: \
                   per-role memory, namespaced by the role's memory grant\n\n\
                 Tool names are prefixed with their source backend (backend__tool). A denied \
                 tool call never reaches its backend."
                    .into(),
            ),
        }
    }

    /// Captures the peer handle so `set_role`/`set_active_skills` can emit a
    /// real `tools/list_changed` notification later; otherwise identical to
    /// the default handshake driven by `get_info`.
    fn initialize(
        &self,
        _request: InitializeRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<InitializeResult, McpError>> + Send + '_ {
        async move {
            *self.peer.write().expect("peer lock poisoned") = Some(context.peer.clone());
            Ok(self.get_info())
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        async move {
            let tools = self
                .core
                .list_tools()
                .await
                .into_iter()
                .map(entry_to_tool)
                .collect();
            Ok(ListToolsResult {
                tools,
                next_cursor: None,
            })
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            let arguments = request.arguments.map(Value::Object);
            match self.core.call_tool(request.name.as_ref(), arguments).await {
                Ok(value) => Ok(value_to_call_result(value)),
                Err(err) => Ok(error_to_call_result(err)),
            }
        }
    }

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        async move {
            Ok(ListResourcesResult {
                meta: None,
                next_cursor: None,
                resources: crate::resources::list_resources(&self.core).await,
            })
        }
    }

    fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourceTemplatesResult, McpError>> + Send + '_
    {
        std::future::ready(Ok(ListResourceTemplatesResult {
            meta: None,
            next_cursor: None,
            resource_templates: Vec::new(),
        }))
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        async move { crate::resources::read_resource(&request.uri, &self.core).await }
    }

    fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListPromptsResult, McpError>> + Send + '_ {
        async move {
            Ok(ListPromptsResult {
                meta: None,
                next_cursor: None,
                prompts: crate::prompts::list_prompts(&self.core).await,
            })
        }
    }

    fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<GetPromptResult, McpError>> + Send + '_ {
        async move {
            crate::prompts::get_prompt(&request.name, request.arguments, &self.core).await
        }
    }

    fn complete(
        &self,
        request: CompleteRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CompleteResult, McpError>> + Send + '_ {
        std::future::ready(crate::resources::complete(&request))
    }
}
