//! Router Core (C5): the gateway's single owner of mutable state. Wires the
//! Stdio Router, Role Store, Visibility Engine, and role-memory store
//! together, bootstraps roles from the skills backend, and dispatches every
//! inbound `tools/list` / `tools/call`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::backend::{RouteError, StdioRouter, ToolDescriptor};
use crate::config::{BackendConfig, Config};
use crate::memory::RoleMemory;
use crate::roles::{BackendSet, RoleStore, SkillDefinition};
use crate::visibility::{ToolEntry, VisibilityEngine};

/// `{role, systemInstruction, availableTools, availableBackends, metadata}`,
/// returned from `setRole` and re-derived (without switching) for
/// `get_context`.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub role: Option<String>,
    pub system_instruction: String,
    pub available_tools: Vec<String>,
    pub available_backends: Vec<String>,
    pub metadata: Value,
}

struct CoreMeta {
    session_id: String,
    role_switch_count: u64,
    last_role_switch_at: Option<Instant>,
}

type NotifyCallback = dyn Fn() + Send + Sync;

pub struct GatewayCore {
    config: Config,
    router: Arc<StdioRouter>,
    role_store: Arc<RoleStore>,
    visibility: Arc<VisibilityEngine>,
    memory: Arc<RoleMemory>,
    configs: DashMap<String, BackendConfig>,
    meta: RwLock<CoreMeta>,
    notify: RwLock<Option<Arc<NotifyCallback>>>,
}

impl GatewayCore {
    pub fn new(config: Config) -> Arc<Self> {
        let router = StdioRouter::new(config.restart.clone());
        let role_store = Arc::new(RoleStore::new());
        let visibility = Arc::new(VisibilityEngine::with_gateway_prefix(
            role_store.clone(),
            config.gateway_tools.prefix.clone(),
        ));
        let memory = Arc::new(RoleMemory::new(role_store.clone()));

        Arc::new(Self {
            config,
            router,
            role_store,
            visibility,
            memory,
            configs: DashMap::new(),
            meta: RwLock::new(CoreMeta {
                session_id: Uuid::new_v4().to_string(),
                role_switch_count: 0,
                last_role_switch_at: None,
            }),
            notify: RwLock::new(None),
        })
    }

    /// Installed by the Protocol Edge before `start_all`; invoked whenever a
    /// role switch produces a non-empty visibility diff.
    pub fn set_notify_callback(&self, callback: Arc<NotifyCallback>) {
        *self.notify.write().expect("notify lock poisoned") = Some(callback);
    }

    pub fn register_backends_from_config(&self, backends: HashMap<String, BackendConfig>) {
        self.configs.clear();
        for (name, config) in backends {
            self.configs.insert(name, config);
        }
    }

    pub fn start_all(&self) {
        for entry in self.configs.iter() {
            self.router.register(entry.key(), entry.value().clone());
        }
    }

    /// Spawn only the backends the role's effective allowed-backend set
    /// covers. A child whose spawn fails is logged; calls routed to it fail
    /// `NoRoute` rather than blocking role activation.
    pub fn start_for_role(&self, role_id: &str) {
        let effective = self.role_store.effective_backends(role_id);
        for entry in self.configs.iter() {
            if effective.contains(entry.key()) {
                self.router.register(entry.key(), entry.value().clone());
            }
        }
    }

    /// Issues `list_skills` against the configured skills backend, feeds the
    /// result to the Role Store, and activates a default role. Non-fatal:
    /// failure leaves the role set empty and every non-trivial call denied.
    pub async fn bootstrap_roles(&self) {
        let Some(skills_backend) = self.config.skills_backend.clone() else {
            return;
        };

        let result = self
            .router
            .route_to_backend(
                &skills_backend,
                "tools/call",
                Some(json!({"name": "list_skills", "arguments": {}})),
            )
            .await;

        match result {
            Ok(value) => {
                let skills: Vec<SkillDefinition> = value
                    .get("skills")
                    .and_then(|s| serde_json::from_value(s.clone()).ok())
                    .unwrap_or_default();
                self.role_store.load_manifest(&skills);
                self.apply_default_role();
            }
            Err(e) => {
                warn!(backend = %skills_backend, error = %e, "list_skills failed during bootstrap; role set stays empty");
            }
        }
    }

    fn apply_default_role(&self) {
        let mut roles = self.role_store.roles_list(None);
        roles.sort_by(|a, b| a.id.cmp(&b.id));
        let default = self
            .config
            .default_role
            .clone()
            .filter(|id| self.role_store.get(id).is_some())
            .or_else(|| roles.first().map(|r| r.id.clone()));

        if let Some(id) = default {
            let _ = self.set_role(Some(&id));
        }
    }

    /// Validates the role exists, recomputes visibility, emits
    /// `tools/list_changed` via the installed callback if the diff is
    /// non-empty, and returns the new manifest.
    pub fn set_role(&self, role_id: Option<&str>) -> Result<Manifest, RouteError> {
        if let Some(id) = role_id
            && self.role_store.get(id).is_none()
        {
            let available = self
                .role_store
                .roles_list(None)
                .into_iter()
                .map(|r| r.id)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(RouteError::RoleNotFound {
                requested: id.to_string(),
                available,
            });
        }

        let diff = self.visibility.set_current_role(role_id.map(str::to_string));
        if !diff.is_empty()
            && let Some(callback) = self.notify.read().expect("notify lock poisoned").as_ref()
        {
            callback();
        }

        {
            let mut meta = self.meta.write().expect("meta lock poisoned");
            meta.role_switch_count += 1;
            meta.last_role_switch_at = Some(Instant::now());
        }

        Ok(self.build_manifest(role_id))
    }

    /// Narrows visibility to the given skill ids on top of whatever the
    /// active role already grants (`classify_backend_tool`'s skill gate only
    /// applies once this set is non-empty). Fires the same
    /// `tools/list_changed` callback as `set_role` on a non-empty diff.
    pub fn set_active_skills(&self, skills: HashSet<String>) -> Manifest {
        let diff = self.visibility.set_active_skills(skills);
        if !diff.is_empty()
            && let Some(callback) = self.notify.read().expect("notify lock poisoned").as_ref()
        {
            callback();
        }
        self.build_manifest(self.visibility.current_role().as_deref())
    }

    fn build_manifest(&self, role_id: Option<&str>) -> Manifest {
        let role = role_id.and_then(|id| self.role_store.get(id));
        let system_instruction = role.map(|r| r.system_instruction).unwrap_or_default();

        let available_tools = self
            .visibility
            .visible_tools()
            .into_iter()
            .map(|e| e.prefixed_name)
            .collect();

        let available_backends = role_id
            .map(|id| match self.role_store.effective_backends(id) {
                BackendSet::All => vec!["*".to_string()],
                BackendSet::Named(set) => set.into_iter().collect(),
            })
            .unwrap_or_default();

        let meta = self.meta.read().expect("meta lock poisoned");
        let metadata = json!({
            "sessionId": meta.session_id,
            "roleSwitchCount": meta.role_switch_count,
            "backends": self.router.status().into_iter().map(|(name, state)| {
                json!({"name": name, "state": format!("{state:?}")})
            }).collect::<Vec<_>>(),
        });

        Manifest {
            role: role_id.map(str::to_string),
            system_instruction,
            available_tools,
            available_backends,
            metadata,
        }
    }

    /// Refreshes aggregation from every connected backend, recomputes the
    /// visible set, and returns it plus any gateway-level tools the current
    /// role is permitted to see.
    pub async fn list_tools(&self) -> Vec<ToolEntry> {
        let discovered = self.router.aggregate_tools().await;
        self.visibility.set_discovered(discovered);

        let mut entries = self.visibility.visible_tools();
        if let Some(role_id) = self.visibility.current_role() {
            entries.extend(self.gateway_level_tool_entries(&role_id));
        }
        entries
    }

    /// Central `tools/call` dispatch: memory tools and gateway-level tools
    /// are handled locally; everything else forwards through the Stdio
    /// Router. Access is checked before any of these branches run, so a
    /// denied call never reaches a backend.
    pub async fn call_tool(&self, prefixed_name: &str, arguments: Option<Value>) -> Result<Value, RouteError> {
        self.visibility.check_access(prefixed_name)?;

        let gateway_prefix = format!("{}__", self.config.gateway_tools.prefix);
        if let Some(rest) = prefixed_name.strip_prefix(&gateway_prefix) {
            return self.call_gateway_tool(rest, arguments).await;
        }

        self.router.call_tool(prefixed_name, arguments).await
    }

    async fn call_gateway_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value, RouteError> {
        let role_id = self.visibility.current_role();
        match name {
            "save_memory" | "recall_memory" | "list_memories" => {
                let Some(role_id) = role_id else {
                    return Err(RouteError::NotVisible {
                        tool_name: name.to_string(),
                        role: "<none>".to_string(),
                    });
                };
                self.call_memory_tool(&role_id, name, arguments)
            }
            "list_roles" => Ok(text_result(
                serde_json::to_string(&self.role_store.roles_list(role_id.as_deref()))
                    .unwrap_or_default(),
            )),
            "get_context" => Ok(text_result(
                serde_json::to_string(&self.build_manifest(role_id.as_deref())).unwrap_or_default(),
            )),
            "set_role" => {
                let args = arguments.unwrap_or(Value::Object(Default::default()));
                let requested = args.get("role").and_then(Value::as_str).map(str::to_string);
                let manifest = self.set_role(requested.as_deref())?;
                Ok(text_result(serde_json::to_string(&manifest).unwrap_or_default()))
            }
            "set_active_skills" => {
                let args = arguments.unwrap_or(Value::Object(Default::default()));
                let skills: HashSet<String> = args
                    .get("skills")
                    .and_then(Value::as_array)
                    .map(|values| values.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default();
                let manifest = self.set_active_skills(skills);
                Ok(text_result(serde_json::to_string(&manifest).unwrap_or_default()))
            }
            "spawn_sub_agent" => Ok(text_result(
                json!({
                    "spawned": false,
                    "reason": "sub-agent spawning requires a platform-specific collaborator not present in this deployment",
                    "requested": arguments,
                })
                .to_string(),
            )),
            other => Err(RouteError::NoRoute {
                backend: self.config.gateway_tools.prefix.clone(),
                reason: format!("unknown gateway tool '{other}'"),
            }),
        }
    }

    fn call_memory_tool(&self, role_id: &str, name: &str, arguments: Option<Value>) -> Result<Value, RouteError> {
        let args = arguments.unwrap_or(Value::Object(Default::default()));
        match name {
            "save_memory" => {
                let key = args.get("key").and_then(Value::as_str).unwrap_or_default().to_string();
                let value = args.get("value").and_then(Value::as_str).unwrap_or_default().to_string();
                self.memory.save(role_id, key, value)?;
                Ok(text_result(json!({"saved": true}).to_string()))
            }
            "recall_memory" => {
                let key = args.get("key").and_then(Value::as_str).unwrap_or_default();
                let value = self.memory.recall(role_id, key)?;
                Ok(text_result(json!({"key": key, "value": value}).to_string()))
            }
            "list_memories" => {
                let keys = self.memory.list(role_id)?;
                Ok(text_result(json!({"keys": keys}).to_string()))
            }
            _ => unreachable!("caller only dispatches the three memory tool names"),
        }
    }

    fn gateway_level_tool_entries(&self, role_id: &str) -> Vec<ToolEntry> {
        let prefix = &self.config.gateway_tools.prefix;
        let candidates: [(&str, bool, &str); 5] = [
            (
                "list_roles",
                self.config.gateway_tools.enable_list_roles,
                "List the roles available and which one is currently active.",
            ),
            (
                "get_context",
                self.config.gateway_tools.enable_get_context,
                "Return the current role, session, and visible-tool manifest.",
            ),
            (
                "set_role",
                self.config.gateway_tools.enable_set_role,
                "Switch the active role. Takes {\"role\": \"<role id>\"} (omit to clear the role).",
            ),
            (
                "set_active_skills",
                self.config.gateway_tools.enable_set_active_skills,
                "Narrow visibility to the given skill ids. Takes {\"skills\": [\"<skill id>\", ...]}.",
            ),
            (
                "spawn_sub_agent",
                self.config.gateway_tools.enable_spawn_sub_agent,
                "Request a new interactive sub-agent session from a platform collaborator.",
            ),
        ];

        candidates
            .into_iter()
            .filter(|(_, enabled, _)| *enabled)
            .filter_map(|(name, _, description)| {
                let prefixed_name = format!("{prefix}__{name}");
                if !self.role_store.is_tool_defined_in_any_skill(&prefixed_name) {
                    return None;
                }
                if !self.role_store.is_tool_allowed(role_id, &prefixed_name, prefix) {
                    return None;
                }
                Some(ToolEntry {
                    tool: ToolDescriptor {
                        name: name.to_string(),
                        description: Some(description.to_string()),
                        input_schema: json!({"type": "object", "properties": {}}),
                    },
                    source_backend: prefix.clone(),
                    prefixed_name,
                    visible: true,
                    reason: "gateway_tool_permitted".to_string(),
                })
            })
            .collect()
    }

    pub fn router(&self) -> Arc<StdioRouter> {
        self.router.clone()
    }

    pub fn role_store(&self) -> Arc<RoleStore> {
        self.role_store.clone()
    }

    pub fn current_role(&self) -> Option<String> {
        self.visibility.current_role()
    }

    pub async fn shutdown(&self) {
        self.router.stop_all().await;
    }
}

fn text_result(text: String) -> Value {
    json!({"content": [{"type": "text", "text": text}]})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartConfig;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            log_level: "info".to_string(),
            backends: HashMap::new(),
            skills_backend: None,
            default_role: None,
            gateway_tools: Default::default(),
            restart: RestartConfig {
                retry_delay: Duration::from_millis(1),
                handshake_deadline: Duration::from_millis(20),
                request_deadline: Duration::from_millis(20),
                kill_grace: Duration::from_millis(20),
            },
        }
    }

    #[tokio::test]
    async fn set_role_rejects_unknown_role() {
        let core = GatewayCore::new(test_config());
        let err = core.set_role(Some("ghost")).unwrap_err();
        assert!(matches!(err, RouteError::RoleNotFound { .. }));
    }

    #[tokio::test]
    async fn set_role_none_succeeds_with_unrestricted_manifest() {
        let core = GatewayCore::new(test_config());
        let manifest = core.set_role(None).unwrap();
        assert_eq!(manifest.role, None);
    }

    #[tokio::test]
    async fn call_tool_denies_unknown_tool_without_reaching_router() {
        let core = GatewayCore::new(test_config());
        core.role_store().load_manifest(&[SkillDefinition {
            id: "s1".to_string(),
            display_name: "s1".to_string(),
            description: String::new(),
            allowed_roles: vec!["guest".to_string()],
            allowed_tools: vec!["alpha__ping".to_string()],
            grants: None,
        }]);
        core.set_role(Some("guest")).unwrap();

        let err = core.call_tool("beta__ping", None).await.unwrap_err();
        assert!(matches!(err, RouteError::NotVisible { .. }));
    }

    #[tokio::test]
    async fn memory_tool_denied_without_grant() {
        let core = GatewayCore::new(test_config());
        core.role_store().load_manifest(&[SkillDefinition {
            id: "s1".to_string(),
            display_name: "s1".to_string(),
            description: String::new(),
            allowed_roles: vec!["guest".to_string()],
            allowed_tools: vec![],
            grants: None,
        }]);
        core.set_role(Some("guest")).unwrap();

        let err = core.call_tool("router__save_memory", None).await.unwrap_err();
        assert!(matches!(err, RouteError::NotVisible { .. }));
    }
}
