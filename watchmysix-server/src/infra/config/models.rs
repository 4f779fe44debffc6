use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use watchmysix_core::{EngineSettings, ToolCatalog};

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub tools: ToolOverrides,
    pub credentials: CredentialsConfig,
    pub cors: CorsConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip: IpAddr = self.host.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub max_concurrency: usize,
    pub step_concurrency: usize,
    pub step_timeout: Duration,
    pub kill_grace: Duration,
    pub log_buffer_lines: usize,
    pub subscriber_queue: usize,
    pub wordlist_dir: PathBuf,
    pub resolver_dir: PathBuf,
    pub crtsh_endpoint: String,
    pub persist: bool,
}

/// Executable overrides, keyed by [`tool_key`].
#[derive(Debug, Clone, Default)]
pub struct ToolOverrides(pub BTreeMap<String, String>);

/// Normalised override key for a tool id: `github-subdomains` becomes
/// `GITHUB_SUBDOMAINS`, matching the `WATCHMYSIX_TOOL_<ID>` variables.
pub fn tool_key(id: &str) -> String {
    id.trim().to_ascii_uppercase().replace('-', "_")
}

impl ToolOverrides {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Point catalog entries at their configured executables. Returns the
    /// override keys that matched no tool.
    pub fn apply(&self, catalog: &mut ToolCatalog) -> Vec<String> {
        let ids: Vec<String> = catalog.ids().map(str::to_string).collect();
        let mut unmatched = Vec::new();
        for (key, executable) in &self.0 {
            let mut matched = false;
            for id in ids.iter().filter(|id| tool_key(id) == *key) {
                matched |= catalog.set_program(id, executable.clone());
            }
            if !matched {
                unmatched.push(key.clone());
            }
        }
        unmatched
    }
}

/// Provider credentials handed to every step.
#[derive(Clone, Default)]
pub struct CredentialsConfig {
    pub chaos_api_key: Option<String>,
    pub github_token: Option<String>,
    pub gitlab_token: Option<String>,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = |value: &Option<String>| if value.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("CredentialsConfig")
            .field("chaos_api_key", &set(&self.chaos_api_key))
            .field("github_token", &set(&self.github_token))
            .field("gitlab_token", &set(&self.gitlab_token))
            .finish()
    }
}

impl CredentialsConfig {
    /// Step environment under the variable names the tools read.
    pub fn step_environment(&self) -> BTreeMap<String, String> {
        [
            ("CHAOS_KEY", &self.chaos_api_key),
            ("GITHUB_TOKEN", &self.github_token),
            ("GITLAB_TOKEN", &self.gitlab_token),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.clone().map(|value| (name.to_string(), value)))
        .collect()
    }
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl CorsConfig {
    pub fn is_wildcard(&self) -> bool {
        self.allowed_origins.iter().any(|origin| origin == "*")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

impl Config {
    pub fn engine_settings(&self) -> EngineSettings {
        let engine = &self.engine;
        EngineSettings {
            data_root: engine.data_dir.clone(),
            max_concurrency: engine.max_concurrency,
            step_concurrency: engine.step_concurrency,
            step_timeout: engine.step_timeout,
            kill_grace: engine.kill_grace,
            log_retention: engine.log_buffer_lines,
            subscriber_queue: engine.subscriber_queue,
            wordlist_dir: engine.wordlist_dir.clone(),
            resolver_dir: engine.resolver_dir.clone(),
            step_environment: self.credentials.step_environment(),
            crtsh_endpoint: engine.crtsh_endpoint.clone(),
            persist: engine.persist,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_match_ids_with_dashes_and_underscores() {
        let mut catalog = ToolCatalog::builtin();
        let overrides = ToolOverrides(BTreeMap::from([
            ("GITHUB_SUBDOMAINS".to_string(), "/opt/gh".to_string()),
            ("SOURCE_SCAN".to_string(), "/opt/source_scan".to_string()),
            ("NOT_A_TOOL".to_string(), "/opt/nothing".to_string()),
        ]));

        let unmatched = overrides.apply(&mut catalog);

        assert_eq!(unmatched, vec!["NOT_A_TOOL".to_string()]);
        assert_eq!(catalog.get("github-subdomains").and_then(|t| t.program()), Some("/opt/gh"));
        assert_eq!(
            catalog.get("source_scan").and_then(|t| t.program()),
            Some("/opt/source_scan")
        );
    }

    #[test]
    fn credentials_map_to_tool_variable_names() {
        let credentials = CredentialsConfig {
            chaos_api_key: Some("chaos-secret".into()),
            github_token: None,
            gitlab_token: Some("gitlab-secret".into()),
        };
        let env = credentials.step_environment();
        assert_eq!(env.len(), 2);
        assert_eq!(env["CHAOS_KEY"], "chaos-secret");
        assert_eq!(env["GITLAB_TOKEN"], "gitlab-secret");
        assert!(!format!("{credentials:?}").contains("secret"));
    }
}
