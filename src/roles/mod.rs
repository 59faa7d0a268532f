//! Role Store (C3): derives role definitions from skill manifests and answers
//! server/tool permission queries, including inheritance chain resolution.

mod store;

pub use store::{
    BackendSet, MemoryGrant, MemoryPolicy, Role, RoleStore, RoleSummary, SkillDefinition,
    SkillGrants, ToolPermissions, glob_match,
};
