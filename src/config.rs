//! Global process state, read once at startup (see the "Global process state"
//! design note): `NODE_NAME` and `DOCKER_API_VERSION` are captured here rather
//! than queried at arbitrary call sites.

use crate::errors::agent::ErrorKind;

/// Configuration shared by the Discovery Reconciler, Configurer and Pod Cache.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_name: String,
    pub docker_api_version: String,
    /// `--path.base`: host root mounted into the agent's own filesystem.
    pub base_dir: String,
    pub template_path: String,
    pub filebeat_home: String,
    pub log_prefixes: Vec<String>,
    pub namespace_whitelist: Vec<String>,
    pub namespace_blacklist: Vec<String>,
}

impl AgentConfig {
    pub fn from_env_and_opts(opts: &crate::cli::WatcherArgs) -> Result<Self, ErrorKind> {
        let node_name = std::env::var("NODE_NAME")
            .map_err(|_| ErrorKind::ConfigError("NODE_NAME env not defined".into()))?;

        let docker_api_version =
            std::env::var("DOCKER_API_VERSION").unwrap_or_else(|_| "1.23".to_string());

        let base_dir = std::fs::canonicalize(&opts.base)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| opts.base.clone());

        Ok(Self {
            node_name,
            docker_api_version,
            base_dir,
            template_path: opts.template.clone(),
            filebeat_home: opts.filebeat_home.clone(),
            log_prefixes: effective_log_prefixes(&opts.log_prefix),
            namespace_whitelist: split_and_trim(&opts.namespace_whitelist),
            namespace_blacklist: split_and_trim(&opts.namespace_blacklist),
        })
    }
}

/// `--logPrefix` default is `"log_"`; a comma-separated value `p1,p2` expands to
/// `p1_log_, p2_log_` (section 4.2).
fn effective_log_prefixes(log_prefix: &str) -> Vec<String> {
    if log_prefix.is_empty() {
        return vec!["log_".to_string()];
    }
    log_prefix
        .split(',')
        .map(|p| format!("{}_log_", p))
        .collect()
}

fn split_and_trim(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Config consumed by the sibling supervisor process (C7).
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub filebeat_exe_path: String,
    pub src_config_path: String,
    pub dst_config_path: String,
    pub template_path: String,
}

impl KeeperConfig {
    pub fn from_env(template_path: String) -> Self {
        Self {
            filebeat_exe_path: getenv("FB_EXE_PATH", "filebeat"),
            src_config_path: getenv("SRC_CONFIG_PATH", "/config/filebeat-output.yml"),
            dst_config_path: getenv("DST_CONFIG_PATH", "/etc/filebeat/filebeat.yml"),
            template_path,
        }
    }
}

fn getenv(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
