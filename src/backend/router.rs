use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::RouteError;
use super::transport::ChildTransport;
use super::BackendState;
use crate::config::{BackendConfig, RestartConfig};
use crate::jsonrpc::{JsonRpcMessage, Kind, RequestId};

/// `{ name, description?, inputSchema }` exactly as the backend advertised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// One tool surfaced by aggregation, before visibility filtering.
#[derive(Debug, Clone)]
pub struct DiscoveredTool {
    pub tool: ToolDescriptor,
    pub source_backend: String,
    pub prefixed_name: String,
}

type PendingKey = (String, RequestId);
type PendingSlot = oneshot::Sender<Result<Value, RouteError>>;

/// Registers named child transports, performs the `initialize` handshake,
/// correlates requests to responses by id, aggregates list responses, and
/// dispatches calls by backend-name prefix.
pub struct StdioRouter {
    transports: DashMap<String, Arc<ChildTransport>>,
    pending: DashMap<PendingKey, PendingSlot>,
    next_id: AtomicI64,
    restart: RestartConfig,
    inbound_tx: mpsc::UnboundedSender<(String, JsonRpcMessage)>,
    spawned_tx: mpsc::UnboundedSender<String>,
}

impl StdioRouter {
    pub fn new(restart: RestartConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (spawned_tx, spawned_rx) = mpsc::unbounded_channel();

        let router = Arc::new(Self {
            transports: DashMap::new(),
            pending: DashMap::new(),
            next_id: AtomicI64::new(1),
            restart,
            inbound_tx,
            spawned_tx,
        });

        tokio::spawn(router.clone().dispatch_loop(inbound_rx));
        tokio::spawn(router.clone().handshake_loop(spawned_rx));
        router
    }

    pub fn register(&self, name: &str, config: BackendConfig) {
        let transport = ChildTransport::new(
            name.to_string(),
            config,
            self.restart.clone(),
            self.inbound_tx.clone(),
            self.spawned_tx.clone(),
        );
        self.transports.insert(name.to_string(), transport.clone());
        tokio::spawn(transport.run());
    }

    pub fn deregister(&self, name: &str) {
        if let Some((_, transport)) = self.transports.remove(name) {
            transport.stop();
            tokio::spawn(async move { transport.kill().await });
        }
    }

    pub fn configured_names(&self) -> Vec<String> {
        self.transports.iter().map(|e| e.key().clone()).collect()
    }

    pub fn backend_state(&self, name: &str) -> Option<BackendState> {
        self.transports.get(name).map(|t| t.state())
    }

    fn connected_names(&self) -> Vec<String> {
        self.transports
            .iter()
            .filter(|e| e.value().is_connected())
            .map(|e| e.key().clone())
            .collect()
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<(String, JsonRpcMessage)>,
    ) {
        while let Some((backend, msg)) = rx.recv().await {
            let response_id = match msg.kind() {
                Kind::Response { id } => Some(id.clone()),
                Kind::Notification { method } => {
                    debug!(backend = %backend, method, "notification from backend");
                    None
                }
                Kind::Request { method, .. } => {
                    debug!(backend = %backend, method, "ignoring inbound request from a backend");
                    None
                }
                Kind::Malformed => {
                    warn!(backend = %backend, "malformed message from backend, discarding");
                    None
                }
            };

            let Some(id) = response_id else { continue };
            let key = (backend.clone(), id.clone());
            if let Some((_, tx)) = self.pending.remove(&key) {
                let result = match msg.into_result() {
                    Ok(value) => Ok(value),
                    Err(err) => Err(RouteError::backend(backend, err)),
                };
                let _ = tx.send(result);
            } else {
                debug!(
                    backend = %backend,
                    id = %id,
                    "dropping response for unknown or already-resolved request"
                );
            }
        }
    }

    async fn handshake_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(name) = rx.recv().await {
            let Some(transport) = self.transports.get(&name).map(|t| t.clone()) else {
                continue;
            };
            let router = self.clone();
            tokio::spawn(async move { router.handshake(&transport).await });
        }
    }

    /// Sends one `initialize` request with id `0`. A response marks the
    /// transport connected and triggers `initialized`; an error fails the
    /// handshake; a timeout while the process is still alive optimistically
    /// marks it connected (surfaced as a warning per the open question in
    /// spec.md §9, rather than silently proceeding).
    async fn handshake(&self, transport: &Arc<ChildTransport>) {
        transport.set_state(BackendState::Handshaking);

        let id = RequestId::Number(0);
        let params = json!({
            "protocolVersion": "2025-06-18",
            "clientInfo": {"name": "rolegate", "version": env!("CARGO_PKG_VERSION")},
            "capabilities": {},
        });
        let msg = JsonRpcMessage::request(id.clone(), "initialize", Some(params));

        let (tx, rx) = oneshot::channel();
        let key = (transport.name().to_string(), id.clone());
        self.pending.insert(key.clone(), tx);

        if let Err(e) = transport.send(&msg).await {
            self.pending.remove(&key);
            warn!(backend = %transport.name(), error = %e, "failed to send initialize request");
            transport.set_state(BackendState::Disconnected);
            return;
        }

        match tokio::time::timeout(self.restart.handshake_deadline, rx).await {
            Ok(Ok(Ok(_result))) => {
                transport.set_state(BackendState::Connected);
                let _ = transport
                    .send(&JsonRpcMessage::notification("notifications/initialized", None))
                    .await;
                info!(backend = %transport.name(), "handshake complete");
            }
            Ok(Ok(Err(e))) => {
                warn!(backend = %transport.name(), error = %e, "handshake failed");
                transport.set_state(BackendState::Disconnected);
            }
            Ok(Err(_)) => {
                transport.set_state(BackendState::Disconnected);
            }
            Err(_) => {
                self.pending.remove(&key);
                if transport.is_process_alive().await {
                    warn!(
                        backend = %transport.name(),
                        "initialize handshake timed out but process is alive; \
                         optimistically marking connected"
                    );
                    transport.set_state(BackendState::Connected);
                } else {
                    transport.set_state(BackendState::Disconnected);
                }
            }
        }
    }

    /// Core request/response correlation: install a pending waiter, send,
    /// and resolve on response, timeout, or shutdown.
    async fn call(
        &self,
        backend: &str,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, RouteError> {
        let transport = self
            .transports
            .get(backend)
            .map(|t| t.clone())
            .ok_or_else(|| RouteError::NoRoute {
                backend: backend.to_string(),
                reason: "not registered".to_string(),
            })?;

        if !transport.is_connected() {
            return Err(RouteError::NoRoute {
                backend: backend.to_string(),
                reason: format!("not connected (state: {:?})", transport.state()),
            });
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let msg = JsonRpcMessage::request(id.clone(), method, params);
        let key = (backend.to_string(), id.clone());

        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);

        if let Err(e) = transport.send(&msg).await {
            self.pending.remove(&key);
            return Err(RouteError::NoRoute {
                backend: backend.to_string(),
                reason: e.to_string(),
            });
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RouteError::Shutdown),
            Err(_) => {
                self.pending.remove(&key);
                Err(RouteError::Timeout {
                    backend: backend.to_string(),
                    deadline_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    /// Aggregates `tools/list` from every connected backend in parallel,
    /// rewriting each tool's name to `backend__tool`. Failed children
    /// contribute nothing and are not fatal.
    pub async fn aggregate_tools(&self) -> Vec<DiscoveredTool> {
        let deadline = self.restart.request_deadline;
        let names = self.connected_names();

        let batches = futures::future::join_all(names.into_iter().map(|name| async move {
            match self.call(&name, "tools/list", None, deadline).await {
                Ok(value) => {
                    let tools: Vec<ToolDescriptor> = value
                        .get("tools")
                        .and_then(|t| serde_json::from_value(t.clone()).ok())
                        .unwrap_or_default();
                    tools
                        .into_iter()
                        .map(|tool| DiscoveredTool {
                            prefixed_name: format!("{name}__{}", tool.name),
                            source_backend: name.clone(),
                            tool,
                        })
                        .collect::<Vec<_>>()
                }
                Err(e) => {
                    warn!(backend = %name, error = %e, "tools/list failed, contributing nothing");
                    Vec::new()
                }
            }
        }))
        .await;

        batches.into_iter().flatten().collect()
    }

    /// Aggregates `resources/list` by concatenation; resources carry their
    /// own backend-scheme URI so no name rewriting happens here.
    pub async fn aggregate_resources(&self) -> Vec<Value> {
        let deadline = self.restart.request_deadline;
        let names = self.connected_names();

        let batches = futures::future::join_all(names.into_iter().map(|name| async move {
            match self.call(&name, "resources/list", None, deadline).await {
                Ok(value) => value
                    .get("resources")
                    .and_then(|r| r.as_array().cloned())
                    .unwrap_or_default(),
                Err(e) => {
                    warn!(backend = %name, error = %e, "resources/list failed, contributing nothing");
                    Vec::new()
                }
            }
        }))
        .await;

        batches.into_iter().flatten().collect()
    }

    /// Dispatches a `tools/call` by prefixed name: finds the longest
    /// registered, connected backend name that prefixes `prefixed_name`,
    /// strips it, and forwards.
    pub async fn call_tool(
        &self,
        prefixed_name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, RouteError> {
        let connected = self.connected_names();
        let (backend, rest) = longest_prefix_match(connected.iter().map(String::as_str), prefixed_name)
            .ok_or_else(|| RouteError::NoRoute {
                backend: prefixed_name.to_string(),
                reason: "no connected backend matches this prefix".to_string(),
            })?;

        let params = json!({ "name": rest, "arguments": arguments.unwrap_or(Value::Object(Default::default())) });
        self.call(backend, "tools/call", Some(params), self.restart.request_deadline)
            .await
    }

    /// `resources/read`: the URI scheme names the backend.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, RouteError> {
        let backend = uri.split("://").next().filter(|s| !s.is_empty()).ok_or_else(|| {
            RouteError::NoRoute {
                backend: uri.to_string(),
                reason: "URI has no scheme".to_string(),
            }
        })?;
        self.call(
            backend,
            "resources/read",
            Some(json!({ "uri": uri })),
            self.restart.request_deadline,
        )
        .await
    }

    /// Addresses a specific child directly, bypassing name-prefix
    /// resolution. Used by the prompts mechanism's `_target_backend`.
    pub async fn route_to_backend(
        &self,
        backend: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RouteError> {
        self.call(backend, method, params, self.restart.request_deadline).await
    }

    pub fn status(&self) -> Vec<(String, BackendState)> {
        self.transports
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect()
    }

    /// Drains pending requests with `Shutdown`, then SIGTERMs every child
    /// (escalating to SIGKILL), and empties the registry.
    pub async fn stop_all(&self) {
        let keys: Vec<PendingKey> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(RouteError::Shutdown));
            }
        }

        let names: Vec<String> = self.transports.iter().map(|e| e.key().clone()).collect();
        let kills = names.into_iter().filter_map(|name| {
            self.transports.remove(&name).map(|(_, transport)| async move {
                transport.stop();
                transport.kill().await;
            })
        });
        futures::future::join_all(kills).await;
    }
}

/// Finds the longest backend name `B` in `backend_names` such that
/// `prefixed_name == B + "__" + rest`, returning `(B, rest)`.
pub(crate) fn longest_prefix_match<'a>(
    backend_names: impl Iterator<Item = &'a str>,
    prefixed_name: &str,
) -> Option<(&'a str, String)> {
    backend_names
        .filter_map(|name| {
            prefixed_name
                .strip_prefix(name)
                .and_then(|rest| rest.strip_prefix("__"))
                .map(|rest| (name, rest.to_string()))
        })
        .max_by_key(|(name, _)| name.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_match_picks_longest_backend_name() {
        let names = vec!["alpha", "alpha_beta"];
        let (backend, rest) =
            longest_prefix_match(names.into_iter(), "alpha_beta__ping").unwrap();
        assert_eq!(backend, "alpha_beta");
        assert_eq!(rest, "ping");
    }

    #[test]
    fn longest_prefix_match_handles_rest_starting_with_underscores() {
        let names = vec!["beta"];
        let (backend, rest) = longest_prefix_match(names.into_iter(), "beta____internal").unwrap();
        assert_eq!(backend, "beta");
        assert_eq!(rest, "__internal");
    }

    #[test]
    fn longest_prefix_match_returns_none_for_unknown_backend() {
        let names = vec!["alpha"];
        assert!(longest_prefix_match(names.into_iter(), "gamma__ping").is_none());
    }

    #[test]
    fn tool_descriptor_deserializes_camel_case_input_schema() {
        let value = json!({"name": "ping", "inputSchema": {"type": "object"}});
        let tool: ToolDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(tool.name, "ping");
        assert_eq!(tool.input_schema["type"], "object");
    }
}
