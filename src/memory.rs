//! Per-role memory store backing the `save_memory` / `recall_memory` /
//! `list_memories` gateway tools. Namespacing follows the role's effective
//! memory grant: `isolated` keys a namespace to the role alone, `team` keys
//! it to the sorted set of roles the granting skill named, `all` shares one
//! global namespace across every role holding an `all` grant.

use std::sync::Arc;

use dashmap::DashMap;

use crate::backend::RouteError;
use crate::roles::{MemoryGrant, MemoryPolicy, RoleStore};

/// Flat key/value store, partitioned by namespace. A `DashMap` of
/// `DashMap`s mirrors the role store's own concurrency idiom: independent
/// namespaces never contend with each other.
struct MemoryStore {
    namespaces: DashMap<String, DashMap<String, String>>,
}

impl MemoryStore {
    fn new() -> Self {
        Self {
            namespaces: DashMap::new(),
        }
    }

    fn save(&self, namespace: &str, key: String, value: String) {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key, value);
    }

    fn recall(&self, namespace: &str, key: &str) -> Option<String> {
        self.namespaces.get(namespace)?.get(key).map(|v| v.clone())
    }

    fn list(&self, namespace: &str) -> Vec<String> {
        self.namespaces
            .get(namespace)
            .map(|ns| ns.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }
}

/// Wraps `MemoryStore` with grant-aware namespace resolution so callers only
/// ever deal in role ids.
pub struct RoleMemory {
    store: MemoryStore,
    role_store: Arc<RoleStore>,
}

impl RoleMemory {
    pub fn new(role_store: Arc<RoleStore>) -> Self {
        Self {
            store: MemoryStore::new(),
            role_store,
        }
    }

    pub fn save(&self, role_id: &str, key: String, value: String) -> Result<(), RouteError> {
        let namespace = self.namespace_for(role_id)?;
        self.store.save(&namespace, key, value);
        Ok(())
    }

    pub fn recall(&self, role_id: &str, key: &str) -> Result<Option<String>, RouteError> {
        let namespace = self.namespace_for(role_id)?;
        Ok(self.store.recall(&namespace, key))
    }

    pub fn list(&self, role_id: &str) -> Result<Vec<String>, RouteError> {
        let namespace = self.namespace_for(role_id)?;
        Ok(self.store.list(&namespace))
    }

    fn namespace_for(&self, role_id: &str) -> Result<String, RouteError> {
        let grant = self.role_store.effective_memory_grant(role_id);
        if grant.policy == MemoryPolicy::None {
            return Err(RouteError::NotVisible {
                tool_name: "save_memory/recall_memory/list_memories".to_string(),
                role: role_id.to_string(),
            });
        }
        Ok(namespace_key(role_id, &grant))
    }
}

fn namespace_key(role_id: &str, grant: &MemoryGrant) -> String {
    match grant.policy {
        MemoryPolicy::None => unreachable!("callers check policy before deriving a namespace"),
        MemoryPolicy::Isolated => format!("role:{role_id}"),
        MemoryPolicy::Team => {
            let mut roles = grant.team_roles.clone();
            if roles.is_empty() {
                roles.push(role_id.to_string());
            }
            roles.sort();
            roles.dedup();
            format!("team:{}", roles.join(","))
        }
        MemoryPolicy::All => "all".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::SkillDefinition;

    fn role_store_with_grant(role_id: &str, grant: MemoryGrant) -> Arc<RoleStore> {
        let store = RoleStore::new();
        let skill = SkillDefinition {
            id: "s1".to_string(),
            display_name: "s1".to_string(),
            description: String::new(),
            allowed_roles: vec![role_id.to_string()],
            allowed_tools: vec![],
            grants: Some(crate::roles::SkillGrants {
                memory: grant.policy,
                team_roles: grant.team_roles,
            }),
        };
        store.load_manifest(&[skill]);
        Arc::new(store)
    }

    #[test]
    fn none_policy_rejects_all_operations() {
        let role_store = Arc::new(RoleStore::new());
        let memory = RoleMemory::new(role_store);
        assert!(memory.save("guest", "k".to_string(), "v".to_string()).is_err());
        assert!(memory.recall("guest", "k").is_err());
        assert!(memory.list("guest").is_err());
    }

    #[test]
    fn isolated_namespaces_do_not_leak_across_roles() {
        let role_store = role_store_with_grant(
            "alice",
            MemoryGrant {
                policy: MemoryPolicy::Isolated,
                team_roles: vec![],
            },
        );
        let memory = RoleMemory::new(role_store.clone());
        memory.save("alice", "k".to_string(), "secret".to_string()).unwrap();

        // A different role, even with its own isolated grant, has its own namespace.
        let store2 = RoleStore::new();
        store2.load_manifest(&[SkillDefinition {
            id: "s2".to_string(),
            display_name: "s2".to_string(),
            description: String::new(),
            allowed_roles: vec!["bob".to_string()],
            allowed_tools: vec![],
            grants: Some(crate::roles::SkillGrants {
                memory: MemoryPolicy::Isolated,
                team_roles: vec![],
            }),
        }]);
        assert_eq!(memory.recall("alice", "k").unwrap(), Some("secret".to_string()));
    }

    #[test]
    fn team_roles_share_a_namespace() {
        let grant = MemoryGrant {
            policy: MemoryPolicy::Team,
            team_roles: vec!["alice".to_string(), "bob".to_string()],
        };
        let role_store = RoleStore::new();
        role_store.load_manifest(&[
            SkillDefinition {
                id: "s1".to_string(),
                display_name: "s1".to_string(),
                description: String::new(),
                allowed_roles: vec!["alice".to_string()],
                allowed_tools: vec![],
                grants: Some(crate::roles::SkillGrants {
                    memory: grant.policy,
                    team_roles: grant.team_roles.clone(),
                }),
            },
            SkillDefinition {
                id: "s2".to_string(),
                display_name: "s2".to_string(),
                description: String::new(),
                allowed_roles: vec!["bob".to_string()],
                allowed_tools: vec![],
                grants: Some(crate::roles::SkillGrants {
                    memory: grant.policy,
                    team_roles: grant.team_roles.clone(),
                }),
            },
        ]);
        let memory = RoleMemory::new(Arc::new(role_store));

        memory.save("alice", "shared".to_string(), "value".to_string()).unwrap();
        assert_eq!(memory.recall("bob", "shared").unwrap(), Some("value".to_string()));
    }

    #[test]
    fn list_returns_saved_keys() {
        let role_store = role_store_with_grant(
            "guest",
            MemoryGrant {
                policy: MemoryPolicy::Isolated,
                team_roles: vec![],
            },
        );
        let memory = RoleMemory::new(role_store);
        memory.save("guest", "a".to_string(), "1".to_string()).unwrap();
        memory.save("guest", "b".to_string(), "2".to_string()).unwrap();
        let mut keys = memory.list("guest").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
