use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rolegate", version, about = "Role-based RBAC routing gateway")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "ROLEGATE_CONFIG", default_value = "config/rolegate.yaml")]
    pub config: PathBuf,

    /// Current-role hint used at startup, overriding `default_role` in config.
    #[arg(long, env = "ROLEGATE_ROLE")]
    pub role: Option<String>,

    /// Overrides the configured skills backend's executable path.
    #[arg(long, env = "ROLEGATE_SKILLS_BACKEND")]
    pub skills_backend_command: Option<PathBuf>,
}
