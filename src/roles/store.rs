use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A role's allowed-backend set: either universal or an explicit name list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackendSet {
    All,
    Named(HashSet<String>),
}

impl BackendSet {
    fn empty() -> Self {
        BackendSet::Named(HashSet::new())
    }

    fn union(&self, other: &BackendSet) -> BackendSet {
        match (self, other) {
            (BackendSet::All, _) | (_, BackendSet::All) => BackendSet::All,
            (BackendSet::Named(a), BackendSet::Named(b)) => {
                BackendSet::Named(a.union(b).cloned().collect())
            }
        }
    }

    fn insert(&mut self, name: &str) {
        match self {
            BackendSet::All => {}
            BackendSet::Named(set) => {
                set.insert(name.to_string());
            }
        }
    }

    pub fn contains(&self, backend: &str) -> bool {
        match self {
            BackendSet::All => true,
            BackendSet::Named(set) => set.contains(backend),
        }
    }
}

impl Default for BackendSet {
    fn default() -> Self {
        BackendSet::empty()
    }
}

/// Memory-grant privilege level. Ordered so callers can take the highest
/// across several contributing skills: `none < isolated < team < all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPolicy {
    None,
    Isolated,
    Team,
    All,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        MemoryPolicy::None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryGrant {
    pub policy: MemoryPolicy,
    #[serde(default)]
    pub team_roles: Vec<String>,
}

impl MemoryGrant {
    fn merge_highest(self, other: MemoryGrant) -> MemoryGrant {
        if other.policy > self.policy {
            return other;
        }
        if other.policy < self.policy {
            return self;
        }
        // Equal privilege: union team-role lists when both sides are `team`.
        let mut team_roles = self.team_roles;
        if self.policy == MemoryPolicy::Team {
            for r in other.team_roles {
                if !team_roles.contains(&r) {
                    team_roles.push(r);
                }
            }
        }
        MemoryGrant {
            policy: self.policy,
            team_roles,
        }
    }
}

/// Ordered tool-permission set. Evaluation order per query:
/// explicit deny > deny-pattern > explicit allow > allow-pattern > default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPermissions {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub allow_patterns: Vec<String>,
    #[serde(default)]
    pub deny_patterns: Vec<String>,
}

impl ToolPermissions {
    /// Append `child` after `self`, as required by root-to-child merge order.
    fn appended(mut self, mut child: ToolPermissions) -> ToolPermissions {
        self.allow.append(&mut child.allow);
        self.deny.append(&mut child.deny);
        self.allow_patterns.append(&mut child.allow_patterns);
        self.deny_patterns.append(&mut child.deny_patterns);
        self
    }

    fn decide(&self, tool_name: &str) -> Option<bool> {
        if self.deny.iter().any(|n| n == tool_name) {
            return Some(false);
        }
        if self.deny_patterns.iter().any(|p| glob_match(p, tool_name)) {
            return Some(false);
        }
        if self.allow.iter().any(|n| n == tool_name) {
            return Some(true);
        }
        if self.allow_patterns.iter().any(|p| glob_match(p, tool_name)) {
            return Some(true);
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inherits: Option<String>,
    #[serde(default)]
    pub allowed_backends: BackendSet,
    #[serde(default)]
    pub tool_permissions: ToolPermissions,
    #[serde(default)]
    pub system_instruction: String,
    #[serde(default)]
    pub memory_grant: Option<MemoryGrant>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub active: bool,
}

/// A skill as carried in a skill manifest returned by `list_skills`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDefinition {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub grants: Option<SkillGrants>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillGrants {
    #[serde(default)]
    pub memory: MemoryPolicy,
    #[serde(default)]
    pub team_roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub current: bool,
}

/// Compiles a spec glob (only `*` is a wildcard, everything else is a literal,
/// the match is anchored at both ends) into a regex and tests it.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let mut anchored = String::with_capacity(pattern.len() * 2 + 2);
    anchored.push('^');
    let mut parts = pattern.split('*').peekable();
    while let Some(part) = parts.next() {
        anchored.push_str(&regex::escape(part));
        if parts.peek().is_some() {
            anchored.push_str(".*");
        }
    }
    anchored.push('$');
    match Regex::new(&anchored) {
        Ok(re) => re.is_match(candidate),
        Err(_) => false,
    }
}

/// Holds role definitions derived from the most recently loaded skill
/// manifest, plus the manifest itself (needed for `is_tool_defined_in_any_skill`).
pub struct RoleStore {
    roles: DashMap<String, Role>,
    skills: DashMap<String, SkillDefinition>,
}

impl RoleStore {
    pub fn new() -> Self {
        Self {
            roles: DashMap::new(),
            skills: DashMap::new(),
        }
    }

    /// Replace the role set wholesale from a freshly loaded skill manifest.
    /// Loading the same manifest twice yields identical role definitions
    /// because derivation is a pure function of the manifest content.
    pub fn load_manifest(&self, manifest: &[SkillDefinition]) {
        let mut derived: HashMap<String, Role> = HashMap::new();

        for skill in manifest {
            for role_id in &skill.allowed_roles {
                if role_id == "*" {
                    warn!(skill = %skill.id, "wildcard role id in allowedRoles is unsupported, skipping");
                    continue;
                }

                let entry = derived.entry(role_id.clone()).or_insert_with(|| Role {
                    id: role_id.clone(),
                    name: role_id.clone(),
                    description: String::new(),
                    inherits: None,
                    allowed_backends: BackendSet::empty(),
                    tool_permissions: ToolPermissions::default(),
                    system_instruction: String::new(),
                    memory_grant: None,
                    skills: Vec::new(),
                    active: true,
                });

                entry
                    .tool_permissions
                    .allow_patterns
                    .extend(skill.allowed_tools.iter().cloned());

                for pattern in &skill.allowed_tools {
                    if let Some(backend) = pattern.split("__").next()
                        && backend != "*"
                        && !backend.is_empty()
                    {
                        entry.allowed_backends.insert(backend);
                    }
                }

                if !entry.skills.contains(&skill.id) {
                    entry.skills.push(skill.id.clone());
                }

                if let Some(grants) = &skill.grants {
                    let incoming = MemoryGrant {
                        policy: grants.memory,
                        team_roles: grants.team_roles.clone(),
                    };
                    entry.memory_grant = Some(match entry.memory_grant.take() {
                        Some(existing) => existing.merge_highest(incoming),
                        None => incoming,
                    });
                }
            }
        }

        self.roles.clear();
        for (id, role) in derived {
            self.roles.insert(id, role);
        }

        self.skills.clear();
        for skill in manifest {
            self.skills.insert(skill.id.clone(), skill.clone());
        }
    }

    pub fn get(&self, id: &str) -> Option<Role> {
        self.roles.get(id).map(|r| r.clone())
    }

    pub fn roles_list(&self, current_id: Option<&str>) -> Vec<RoleSummary> {
        self.roles
            .iter()
            .map(|entry| RoleSummary {
                id: entry.id.clone(),
                name: entry.name.clone(),
                description: entry.description.clone(),
                current: Some(entry.id.as_str()) == current_id,
            })
            .collect()
    }

    /// Walks the inheritance chain child -> root, detecting cycles with a
    /// visited set. A cycle yields an empty chain (deny-by-default).
    fn chain(&self, role_id: &str) -> Vec<Role> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(role_id.to_string());

        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                warn!(role = %role_id, "role inheritance cycle detected, effective set is empty");
                return Vec::new();
            }
            let Some(role) = self.roles.get(&id) else {
                break;
            };
            current = role.inherits.clone();
            chain.push(role.clone());
        }

        chain.reverse(); // root first, requested role last
        chain
    }

    pub fn effective_backends(&self, role_id: &str) -> BackendSet {
        self.chain(role_id)
            .into_iter()
            .fold(BackendSet::empty(), |acc, role| {
                acc.union(&role.allowed_backends)
            })
    }

    pub fn effective_tool_permissions(&self, role_id: &str) -> ToolPermissions {
        self.chain(role_id)
            .into_iter()
            .fold(ToolPermissions::default(), |acc, role| {
                acc.appended(role.tool_permissions)
            })
    }

    pub fn is_backend_allowed(&self, role_id: &str, backend: &str) -> bool {
        self.effective_backends(role_id).contains(backend)
    }

    /// `isToolAllowed`: evaluates the merged permission chain; a role with no
    /// entries at any level defaults to allow within its allowed backends.
    pub fn is_tool_allowed(&self, role_id: &str, prefixed_name: &str, backend: &str) -> bool {
        if !self.is_backend_allowed(role_id, backend) {
            return false;
        }
        match self.effective_tool_permissions(role_id).decide(prefixed_name) {
            Some(verdict) => verdict,
            None => true,
        }
    }

    pub fn effective_memory_grant(&self, role_id: &str) -> MemoryGrant {
        self.chain(role_id)
            .into_iter()
            .filter_map(|r| r.memory_grant)
            .fold(MemoryGrant::default(), |acc, grant| acc.merge_highest(grant))
    }

    /// Checks literal membership or glob match across all loaded skills'
    /// `allowedTools`, excluding the bare universal pattern `"*"` — a skill
    /// must explicitly mention the gateway-level tool (or a non-universal
    /// pattern matching it) to unlock its advertisement.
    /// Union of `allowedTools` patterns across the given set of active skill
    /// ids, used by the visibility engine's skill gate.
    pub fn active_skill_patterns(&self, active_skills: &HashSet<String>) -> Vec<String> {
        let mut patterns = Vec::new();
        for skill_id in active_skills {
            if let Some(skill) = self.skills.get(skill_id) {
                patterns.extend(skill.allowed_tools.iter().cloned());
            }
        }
        patterns
    }

    pub fn is_tool_defined_in_any_skill(&self, tool_name: &str) -> bool {
        self.skills.iter().any(|skill| {
            skill.allowed_tools.iter().any(|pattern| {
                pattern != "*" && (pattern == tool_name || glob_match(pattern, tool_name))
            })
        })
    }
}

impl Default for RoleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn glob_match_only_star_is_wildcard() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("alpha__*", "alpha__ping"));
        assert!(!glob_match("alpha__*", "beta__ping"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("a.b*", "a.bc"));
        assert!(!glob_match("a.b*", "aXbc"));
    }

    #[test]
    fn load_manifest_derives_backend_set_from_tool_prefixes() {
        let store = RoleStore::new();
        store.load_manifest(&[skill("s1", &["guest"], &["alpha__ping"])]);
        assert!(store.is_backend_allowed("guest", "alpha"));
        assert!(!store.is_backend_allowed("guest", "beta"));
    }

    #[test]
    fn load_manifest_is_idempotent() {
        let store = RoleStore::new();
        let manifest = vec![skill("s1", &["guest"], &["alpha__ping"])];
        store.load_manifest(&manifest);
        let first = store.get("guest").unwrap();
        store.load_manifest(&manifest);
        let second = store.get("guest").unwrap();
        assert_eq!(first.allowed_backends, second.allowed_backends);
    }

    #[test]
    fn wildcard_role_id_is_skipped() {
        let store = RoleStore::new();
        store.load_manifest(&[skill("s1", &["*"], &["alpha__ping"])]);
        assert!(store.get("*").is_none());
        assert!(store.roles_list(None).is_empty());
    }

    #[test]
    fn inheritance_merges_root_to_child_and_unions_backends() {
        let store = RoleStore::new();
        store.load_manifest(&[
            skill("base-skill", &["base"], &["alpha__ping"]),
            skill("admin-skill", &["admin"], &["beta__*"]),
        ]);
        store
            .roles
            .entry("admin".to_string())
            .and_modify(|role| role.inherits = Some("base".to_string()));

        assert!(store.is_backend_allowed("admin", "alpha"));
        assert!(store.is_backend_allowed("admin", "beta"));
    }

    #[test]
    fn inheritance_cycle_yields_empty_effective_set() {
        let store = RoleStore::new();
        store.load_manifest(&[skill("s1", &["a", "b"], &["alpha__ping"])]);
        store
            .roles
            .entry("a".to_string())
            .and_modify(|r| r.inherits = Some("b".to_string()));
        store
            .roles
            .entry("b".to_string())
            .and_modify(|r| r.inherits = Some("a".to_string()));

        assert!(!store.is_backend_allowed("a", "alpha"));
    }

    #[test]
    fn explicit_deny_beats_allow_pattern() {
        let store = RoleStore::new();
        store.load_manifest(&[skill("s1", &["guest"], &["alpha__*"])]);
        store
            .roles
            .entry("guest".to_string())
            .and_modify(|r| r.tool_permissions.deny.push("alpha__ping".to_string()));
        assert!(!store.is_tool_allowed("guest", "alpha__ping", "alpha"));
        assert!(store.is_tool_allowed("guest", "alpha__stat", "alpha"));
    }

    #[test]
    fn memory_grant_takes_highest_and_unions_team_roles_when_equal() {
        let store = RoleStore::new();
        let mut s1 = skill("s1", &["guest"], &[]);
        s1.grants = Some(SkillGrants {
            memory: MemoryPolicy::Team,
            team_roles: vec!["guest".to_string()],
        });
        let mut s2 = skill("s2", &["guest"], &[]);
        s2.grants = Some(SkillGrants {
            memory: MemoryPolicy::Team,
            team_roles: vec!["admin".to_string()],
        });
        store.load_manifest(&[s1, s2]);

        let grant = store.effective_memory_grant("guest");
        assert_eq!(grant.policy, MemoryPolicy::Team);
        assert!(grant.team_roles.contains(&"guest".to_string()));
        assert!(grant.team_roles.contains(&"admin".to_string()));
    }

    #[test]
    fn is_tool_defined_in_any_skill_requires_explicit_mention() {
        let store = RoleStore::new();
        store.load_manifest(&[skill("s1", &["guest"], &["*"])]);
        assert!(!store.is_tool_defined_in_any_skill("list_roles"));

        store.load_manifest(&[skill("s1", &["guest"], &["router__list_roles"])]);
        assert!(store.is_tool_defined_in_any_skill("router__list_roles"));
    }
}
