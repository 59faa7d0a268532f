use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

static DOTENV_ONCE: Once = Once::new();

/// The gateway's own identifier, used to filter self-nesting backend entries
/// out of a loaded config (see `Config::validate`).
pub const GATEWAY_NAME: &str = "rolegate";

/// Load `~/.env` into the process environment exactly once.
///
/// Must be called early in `main()` before spawning concurrent tasks.
pub fn load_dotenv() {
    DOTENV_ONCE.call_once(|| {
        let env_path = dirs::home_dir()
            .map(|h| h.join(".env"))
            .filter(|p| p.is_file());
        if let Some(env_file) = env_path
            && let Ok(contents) = std::fs::read_to_string(&env_file)
        {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    // SAFETY: called at most once, before any concurrent env reads.
                    unsafe { std::env::set_var(key.trim(), value.trim()) };
                }
            }
        }
    });
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Backend invocation recipes, keyed by backend name. The name is the
    /// `sourceBackend` used for tool-name prefixing.
    #[serde(default, alias = "mcpServers")]
    pub backends: HashMap<String, BackendConfig>,

    /// Name of the backend (a key in `backends`) whose `list_skills` tool is
    /// called at startup to bootstrap the role store. If absent, the gateway
    /// runs with an empty role set until a role reload succeeds some other way.
    #[serde(default)]
    pub skills_backend: Option<String>,

    /// Optional default role id, used when no `current role` hint is supplied
    /// via environment at startup.
    #[serde(default)]
    pub default_role: Option<String>,

    #[serde(default)]
    pub gateway_tools: GatewayToolsConfig,

    #[serde(default)]
    pub restart: RestartConfig,
}

/// Controls which gateway-level tools this instance is willing to expose,
/// independent of whether a skill actually mentions them (RBAC still decides
/// visibility; this is an operator-level kill switch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayToolsConfig {
    #[serde(default = "default_true")]
    pub enable_list_roles: bool,
    #[serde(default = "default_true")]
    pub enable_get_context: bool,
    #[serde(default = "default_true")]
    pub enable_set_role: bool,
    #[serde(default = "default_true")]
    pub enable_set_active_skills: bool,
    /// `spawn_sub_agent` opens a new interactive session via a platform
    /// collaborator; off by default since the core treats it as optional.
    #[serde(default)]
    pub enable_spawn_sub_agent: bool,
    /// Fixed prefix gateway-level tools are exposed under on the wire.
    #[serde(default = "default_gateway_tool_prefix")]
    pub prefix: String,
}

impl Default for GatewayToolsConfig {
    fn default() -> Self {
        Self {
            enable_list_roles: true,
            enable_get_context: true,
            enable_set_role: true,
            enable_set_active_skills: true,
            enable_spawn_sub_agent: false,
            prefix: default_gateway_tool_prefix(),
        }
    }
}

/// Per-backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Command to spawn.
    pub command: String,

    /// Arguments for the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables passed to the child process. Values matching
    /// `^\$\{[A-Z_][A-Z0-9_]*\}$` exactly are substituted from the ambient
    /// environment (empty string if unset); all other values pass through.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Restart policy shared by all backends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartConfig {
    #[serde(default = "default_retry_delay", with = "humantime_duration")]
    pub retry_delay: Duration,
    #[serde(default = "default_handshake_deadline", with = "humantime_duration")]
    pub handshake_deadline: Duration,
    #[serde(default = "default_request_deadline", with = "humantime_duration")]
    pub request_deadline: Duration,
    #[serde(default = "default_kill_grace", with = "humantime_duration")]
    pub kill_grace: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            retry_delay: default_retry_delay(),
            handshake_deadline: default_handshake_deadline(),
            request_deadline: default_request_deadline(),
            kill_grace: default_kill_grace(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_gateway_tool_prefix() -> String {
    "router".to_string()
}
fn default_retry_delay() -> Duration {
    Duration::from_millis(800)
}
fn default_handshake_deadline() -> Duration {
    Duration::from_secs(10)
}
fn default_request_deadline() -> Duration {
    Duration::from_secs(30)
}
fn default_kill_grace() -> Duration {
    Duration::from_secs(5)
}

mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix("ms") {
            n.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('s') {
            n.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| format!("invalid duration '{s}': expected e.g. '500ms', '30s', '5m'"))
        }
    }
}

/// Expand `${NAME}` in a single env value. Only a value that is *exactly*
/// `${NAME}` with `NAME` matching `[A-Z_][A-Z0-9_]*` is substituted; anything
/// else (including a value merely containing such a pattern) passes through
/// unchanged, per the wire config's narrow expansion rule.
fn expand_env_value(value: &str) -> String {
    let bytes = value.as_bytes();
    if value.len() >= 3 && bytes[0] == b'$' && bytes[1] == b'{' && value.ends_with('}') {
        let name = &value[2..value.len() - 1];
        let mut chars = name.chars();
        let first_ok = chars
            .next()
            .map(|c| c == '_' || c.is_ascii_uppercase())
            .unwrap_or(false);
        let rest_ok = chars.all(|c| c == '_' || c.is_ascii_uppercase() || c.is_ascii_digit());
        if first_ok && rest_ok {
            return std::env::var(name).unwrap_or_default();
        }
    }
    value.to_string()
}

impl Config {
    /// Load config from a YAML file, expanding `${VAR}` in backend env maps
    /// and dropping any backend entry that would self-nest the gateway.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let mut config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.backends.retain(|name, _| {
            let self_nesting = name.contains(GATEWAY_NAME);
            if self_nesting {
                tracing::warn!(backend = %name, "ignoring backend that self-nests the gateway");
            }
            !self_nesting
        });

        for backend in config.backends.values_mut() {
            for value in backend.env.values_mut() {
                *value = expand_env_value(value);
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(skills) = &self.skills_backend
            && !self.backends.contains_key(skills)
        {
            anyhow::bail!(
                "skills_backend '{skills}' does not name a configured backend"
            );
        }
        Ok(())
    }
}

/// Directory used for gateway-owned on-disk state (currently none is
/// persisted across restarts per the core's non-goals, but the directory is
/// still resolved so future collaborators have a stable place to write to).
pub fn rolegate_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rolegate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_value_substitutes_exact_match() {
        unsafe { std::env::set_var("ROLEGATE_TEST_VAR", "secret") };
        assert_eq!(expand_env_value("${ROLEGATE_TEST_VAR}"), "secret");
        unsafe { std::env::remove_var("ROLEGATE_TEST_VAR") };
    }

    #[test]
    fn expand_env_value_leaves_partial_matches_alone() {
        assert_eq!(expand_env_value("prefix-${X}-suffix"), "prefix-${X}-suffix");
        assert_eq!(expand_env_value("plain"), "plain");
        assert_eq!(expand_env_value("${not valid}"), "${not valid}");
    }

    #[test]
    fn expand_env_value_unset_var_becomes_empty() {
        unsafe { std::env::remove_var("ROLEGATE_DEFINITELY_UNSET") };
        assert_eq!(expand_env_value("${ROLEGATE_DEFINITELY_UNSET}"), "");
    }

    #[test]
    fn load_drops_self_nesting_backend_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "backends:\n  good:\n    command: echo\n  rolegate-nested:\n    command: echo\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert!(config.backends.contains_key("good"));
        assert!(!config.backends.contains_key("rolegate-nested"));
    }

    #[test]
    fn load_rejects_unknown_skills_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "backends:\n  alpha:\n    command: echo\nskills_backend: missing\n",
        )
        .unwrap();
        assert!(Config::load(&path).is_err());
    }
}
