//! Tool Visibility Engine (C4): combines the discovered tool set with the
//! current role and active skills into the subset a caller may actually see
//! or invoke. Ordered gates: backend -> role tool permissions -> skill (when
//! skill filtering is active) -> memory-tool rule.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::backend::{DiscoveredTool, RouteError};
use crate::roles::{MemoryPolicy, RoleStore, glob_match};

/// One tool as seen after filtering, whether or not it ended up visible —
/// `allTools` and `visibleTools` are both collections of this type, per
/// `ToolDescriptor`'s source-of-truth in the Stdio Router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    pub tool: crate::backend::ToolDescriptor,
    pub source_backend: String,
    pub prefixed_name: String,
    pub visible: bool,
    pub reason: String,
}

/// `{ added, removed }` prefixed-name sets, returned by every mutator so
/// callers can decide whether a `tools/list_changed` notification is due.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibilityDiff {
    pub added: HashSet<String>,
    pub removed: HashSet<String>,
}

impl VisibilityDiff {
    fn between(before: &HashMap<String, ToolEntry>, after: &HashMap<String, ToolEntry>) -> Self {
        let before_keys: HashSet<&String> = before.keys().collect();
        let after_keys: HashSet<&String> = after.keys().collect();
        VisibilityDiff {
            added: after_keys.difference(&before_keys).map(|s| s.to_string()).collect(),
            removed: before_keys.difference(&after_keys).map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

const MEMORY_TOOL_NAMES: [&str; 3] = ["save_memory", "recall_memory", "list_memories"];

struct State {
    all_tools: HashMap<String, ToolEntry>,
    visible_tools: HashMap<String, ToolEntry>,
    current_role: Option<String>,
    active_skills: HashSet<String>,
}

/// Mutations (`set_discovered`, `set_current_role`, `set_active_skills`) are
/// serialized by a single write lock; reads never block behind another read.
pub struct VisibilityEngine {
    role_store: Arc<RoleStore>,
    gateway_prefix: String,
    state: RwLock<State>,
}

impl VisibilityEngine {
    pub fn new(role_store: Arc<RoleStore>) -> Self {
        Self::with_gateway_prefix(role_store, "router".to_string())
    }

    pub fn with_gateway_prefix(role_store: Arc<RoleStore>, gateway_prefix: String) -> Self {
        Self {
            role_store,
            gateway_prefix,
            state: RwLock::new(State {
                all_tools: HashMap::new(),
                visible_tools: HashMap::new(),
                current_role: None,
                active_skills: HashSet::new(),
            }),
        }
    }

    pub fn set_discovered(&self, discovered: Vec<DiscoveredTool>) -> VisibilityDiff {
        let mut state = self.state.write().expect("visibility state lock poisoned");
        state.all_tools = discovered
            .into_iter()
            .map(|d| {
                (
                    d.prefixed_name.clone(),
                    ToolEntry {
                        tool: d.tool,
                        source_backend: d.source_backend,
                        prefixed_name: d.prefixed_name,
                        visible: false,
                        reason: String::new(),
                    },
                )
            })
            .collect();
        self.recompute(&mut state)
    }

    pub fn set_current_role(&self, role_id: Option<String>) -> VisibilityDiff {
        let mut state = self.state.write().expect("visibility state lock poisoned");
        state.current_role = role_id;
        self.recompute(&mut state)
    }

    pub fn set_active_skills(&self, skills: HashSet<String>) -> VisibilityDiff {
        let mut state = self.state.write().expect("visibility state lock poisoned");
        state.active_skills = skills;
        self.recompute(&mut state)
    }

    pub fn current_role(&self) -> Option<String> {
        self.state.read().expect("visibility state lock poisoned").current_role.clone()
    }

    pub fn active_skills(&self) -> HashSet<String> {
        self.state
            .read()
            .expect("visibility state lock poisoned")
            .active_skills
            .clone()
    }

    pub fn visible_tools(&self) -> Vec<ToolEntry> {
        self.state
            .read()
            .expect("visibility state lock poisoned")
            .visible_tools
            .values()
            .cloned()
            .collect()
    }

    pub fn all_tools(&self) -> Vec<ToolEntry> {
        let state = self.state.read().expect("visibility state lock poisoned");
        let visible = &state.visible_tools;
        state
            .all_tools
            .values()
            .map(|entry| {
                visible
                    .get(&entry.prefixed_name)
                    .cloned()
                    .unwrap_or_else(|| entry.clone())
            })
            .collect()
    }

    /// Raises `RouteError::NotVisible` for anything not currently in the
    /// visible set, including gateway-level or memory tools filtered out by
    /// the role/skill gates above.
    pub fn check_access(&self, prefixed_name: &str) -> Result<(), RouteError> {
        let state = self.state.read().expect("visibility state lock poisoned");
        if state.visible_tools.contains_key(prefixed_name) {
            return Ok(());
        }
        Err(RouteError::NotVisible {
            tool_name: prefixed_name.to_string(),
            role: state.current_role.clone().unwrap_or_else(|| "<none>".to_string()),
        })
    }

    fn recompute(&self, state: &mut State) -> VisibilityDiff {
        let before = state.visible_tools.clone();

        let mut visible = HashMap::new();
        for entry in state.all_tools.values() {
            let mut entry = entry.clone();
            let (is_visible, reason) = self.classify_backend_tool(
                state.current_role.as_deref(),
                &state.active_skills,
                &entry,
            );
            entry.visible = is_visible;
            entry.reason = reason;
            if is_visible {
                visible.insert(entry.prefixed_name.clone(), entry);
            }
        }

        for entry in self.memory_tool_entries(state.current_role.as_deref()) {
            if entry.visible {
                visible.insert(entry.prefixed_name.clone(), entry);
            }
        }

        state.visible_tools = visible;
        VisibilityDiff::between(&before, &state.visible_tools)
    }

    fn classify_backend_tool(
        &self,
        role_id: Option<&str>,
        active_skills: &HashSet<String>,
        entry: &ToolEntry,
    ) -> (bool, String) {
        let Some(role_id) = role_id else {
            return (true, "no_role_set_unrestricted".to_string());
        };

        if !self.role_store.is_backend_allowed(role_id, &entry.source_backend) {
            return (false, "backend_not_allowed_for_role".to_string());
        }

        if !self
            .role_store
            .is_tool_allowed(role_id, &entry.prefixed_name, &entry.source_backend)
        {
            return (false, "role_tool_denied".to_string());
        }

        if !active_skills.is_empty() {
            let patterns = self.role_store.active_skill_patterns(active_skills);
            let allowed = patterns.iter().any(|p| glob_match(p, &entry.prefixed_name));
            if !allowed {
                return (false, "skill_denied".to_string());
            }
            return (true, "role_and_skill_permitted".to_string());
        }

        (true, "role_permitted".to_string())
    }

    /// The three memory tools are gateway-level (`sourceBackend: "router"`)
    /// and gated purely on the role's effective memory grant — a role with
    /// `MemoryPolicy::None` never sees them, regardless of skills.
    fn memory_tool_entries(&self, role_id: Option<&str>) -> Vec<ToolEntry> {
        let Some(role_id) = role_id else {
            return Vec::new();
        };
        let grant = self.role_store.effective_memory_grant(role_id);
        if grant.policy == MemoryPolicy::None {
            return Vec::new();
        }

        let prefix = &self.gateway_prefix;
        MEMORY_TOOL_NAMES
            .iter()
            .map(|name| {
                let prefixed_name = format!("{prefix}__{name}");
                ToolEntry {
                    tool: crate::backend::ToolDescriptor {
                        name: name.to_string(),
                        description: Some(memory_tool_description(name, grant.policy)),
                        input_schema: memory_tool_schema(name),
                    },
                    source_backend: prefix.clone(),
                    prefixed_name,
                    visible: true,
                    reason: format!("memory_granted:{:?}", grant.policy).to_lowercase(),
                }
            })
            .collect()
    }
}

fn memory_tool_description(name: &str, policy: MemoryPolicy) -> String {
    let scope = match policy {
        MemoryPolicy::None => "no",
        MemoryPolicy::Isolated => "role-isolated",
        MemoryPolicy::Team => "team-shared",
        MemoryPolicy::All => "cross-role",
    };
    match name {
        "save_memory" => format!("Save a memory entry under the current role's {scope} store."),
        "recall_memory" => format!("Recall memory entries from the current role's {scope} store."),
        "list_memories" => format!("List memory entry keys in the current role's {scope} store."),
        _ => unreachable!("memory tool names are a fixed set"),
    }
}

fn memory_tool_schema(name: &str) -> serde_json::Value {
    match name {
        "save_memory" => serde_json::json!({
            "type": "object",
            "properties": {
                "key": {"type": "string"},
                "value": {"type": "string"},
            },
            "required": ["key", "value"],
        }),
        "recall_memory" => serde_json::json!({
            "type": "object",
            "properties": {"key": {"type": "string"}},
            "required": ["key"],
        }),
        "list_memories" => serde_json::json!({"type": "object", "properties": {}}),
        _ => unreachable!("memory tool names are a fixed set"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::SkillDefinition;

    fn tool(backend: &str, name: &str) -> DiscoveredTool {
        DiscoveredTool {
            tool: crate::backend::ToolDescriptor {
                name: name.to_string(),
                description: None,
                input_schema: serde_json::json!({}),
            },
            source_backend: backend.to_string(),
            prefixed_name: format!("{backend}__{name}"),
        }
    }

    fn skill(id: &str, roles: &[&str], tools: &[&str]) -> SkillDefinition {
        SkillDefinition {
            id: id.to_string(),
            display_name: id.to_string(),
            description: String::new(),
            allowed_roles: roles.iter().map(|s| s.to_string()).collect(),
            allowed_tools: tools.iter().map(|s| s.to_string()).collect(),
            grants: None,
        }
    }

    #[test]
    fn no_role_set_is_unrestricted() {
        let role_store = Arc::new(RoleStore::new());
        let engine = VisibilityEngine::new(role_store);
        engine.set_discovered(vec![tool("alpha", "ping")]);
        let visible = engine.visible_tools();
        assert_eq!(visible.len(), 1);
        assert!(visible[0].visible);
    }

    #[test]
    fn role_without_backend_access_hides_its_tools() {
        let role_store = Arc::new(RoleStore::new());
        role_store.load_manifest(&[skill("s1", &["guest"], &["alpha__ping"])]);
        let engine = VisibilityEngine::new(role_store);
        engine.set_discovered(vec![tool("alpha", "ping"), tool("beta", "poke")]);
        engine.set_current_role(Some("guest".to_string()));

        let visible: HashSet<String> = engine
            .visible_tools()
            .into_iter()
            .map(|e| e.prefixed_name)
            .collect();
        assert!(visible.contains("alpha__ping"));
        assert!(!visible.contains("beta__poke"));
    }

    #[test]
    fn skill_gate_only_applies_when_skills_are_active() {
        let role_store = Arc::new(RoleStore::new());
        role_store.load_manifest(&[skill("s1", &["guest"], &["alpha__*"])]);
        let engine = VisibilityEngine::new(role_store);
        engine.set_discovered(vec![tool("alpha", "ping"), tool("alpha", "stat")]);
        engine.set_current_role(Some("guest".to_string()));

        // No active skills yet: both tools visible under the role gate alone.
        let visible: HashSet<String> = engine
            .visible_tools()
            .into_iter()
            .map(|e| e.prefixed_name)
            .collect();
        assert!(visible.contains("alpha__ping"));
        assert!(visible.contains("alpha__stat"));

        engine.set_active_skills(HashSet::from(["s1".to_string()]));
        let visible: HashSet<String> = engine
            .visible_tools()
            .into_iter()
            .map(|e| e.prefixed_name)
            .collect();
        assert!(visible.contains("alpha__ping"));
        assert!(visible.contains("alpha__stat"));
    }

    #[test]
    fn memory_tools_absent_without_grant() {
        let role_store = Arc::new(RoleStore::new());
        role_store.load_manifest(&[skill("s1", &["guest"], &["alpha__ping"])]);
        let engine = VisibilityEngine::new(role_store);
        engine.set_current_role(Some("guest".to_string()));

        let visible: HashSet<String> = engine
            .visible_tools()
            .into_iter()
            .map(|e| e.prefixed_name)
            .collect();
        assert!(!visible.contains("router__save_memory"));
    }

    #[test]
    fn memory_tools_present_with_grant() {
        let role_store = Arc::new(RoleStore::new());
        let mut s1 = skill("s1", &["guest"], &[]);
        s1.grants = Some(crate::roles::SkillGrants {
            memory: crate::roles::MemoryPolicy::Team,
            team_roles: vec!["guest".to_string()],
        });
        role_store.load_manifest(&[s1]);
        let engine = VisibilityEngine::new(role_store);
        engine.set_current_role(Some("guest".to_string()));

        let visible: HashSet<String> = engine
            .visible_tools()
            .into_iter()
            .map(|e| e.prefixed_name)
            .collect();
        assert!(visible.contains("router__save_memory"));
        assert!(visible.contains("router__recall_memory"));
        assert!(visible.contains("router__list_memories"));
    }

    #[test]
    fn check_access_rejects_hidden_tool() {
        let role_store = Arc::new(RoleStore::new());
        role_store.load_manifest(&[skill("s1", &["guest"], &["alpha__ping"])]);
        let engine = VisibilityEngine::new(role_store);
        engine.set_discovered(vec![tool("alpha", "ping"), tool("beta", "poke")]);
        engine.set_current_role(Some("guest".to_string()));

        assert!(engine.check_access("alpha__ping").is_ok());
        assert!(matches!(
            engine.check_access("beta__poke"),
            Err(RouteError::NotVisible { .. })
        ));
    }

    #[test]
    fn diff_reports_added_and_removed() {
        let role_store = Arc::new(RoleStore::new());
        let engine = VisibilityEngine::new(role_store);
        let diff = engine.set_discovered(vec![tool("alpha", "ping")]);
        assert!(diff.added.contains("alpha__ping"));

        let diff = engine.set_discovered(vec![tool("beta", "poke")]);
        assert!(diff.added.contains("beta__poke"));
        assert!(diff.removed.contains("alpha__ping"));
    }
}
