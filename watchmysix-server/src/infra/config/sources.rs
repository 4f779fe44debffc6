use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub engine: FileEngineConfig,
    /// Executable overrides keyed by tool id.
    #[serde(default)]
    pub tools: BTreeMap<String, String>,
    #[serde(default)]
    pub credentials: FileCredentialsConfig,
    #[serde(default)]
    pub cors: FileCorsConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileEngineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_concurrency: Option<usize>,
    /// Humantime duration, e.g. `"30m"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_grace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_buffer_lines: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriber_queue: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wordlist_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crtsh_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCredentialsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chaos_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gitlab_token: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCorsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<Vec<String>>,
}

const TOOL_OVERRIDE_PREFIX: &str = "WATCHMYSIX_TOOL_";

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub max_concurrency: Option<usize>,
    pub step_concurrency: Option<usize>,
    pub step_timeout: Option<String>,
    pub kill_grace: Option<String>,
    pub log_buffer_lines: Option<usize>,
    pub subscriber_queue: Option<usize>,
    pub wordlist_dir: Option<PathBuf>,
    pub resolver_dir: Option<PathBuf>,
    pub crtsh_endpoint: Option<String>,
    pub persist: Option<bool>,
    /// Keyed by the upper-cased variable suffix, e.g. `GITHUB_SUBDOMAINS`.
    pub tool_overrides: BTreeMap<String, String>,
    pub chaos_api_key: Option<String>,
    pub github_token: Option<String>,
    pub gitlab_token: Option<String>,
    pub cors_allowed_origins: Option<Vec<String>>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        let text = |name: &str| {
            vars.get(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |name: &str| text(name).and_then(|raw| raw.parse().ok());

        let tool_overrides = vars
            .iter()
            .filter_map(|(name, value)| {
                let key = name.strip_prefix(TOOL_OVERRIDE_PREFIX)?;
                let value = value.trim();
                (!key.is_empty() && !value.is_empty())
                    .then(|| (key.to_ascii_uppercase(), value.to_string()))
            })
            .collect();

        Self {
            config_path: text("WATCHMYSIX_CONFIG").map(PathBuf::from),
            server_host: text("SERVER_HOST"),
            server_port: number("SERVER_PORT").and_then(|port: usize| u16::try_from(port).ok()),
            data_dir: text("WATCHMYSIX_DATA_DIR").map(PathBuf::from),
            max_concurrency: number("WATCHMYSIX_MAX_CONCURRENCY"),
            step_concurrency: number("WATCHMYSIX_STEP_CONCURRENCY"),
            step_timeout: text("WATCHMYSIX_STEP_TIMEOUT"),
            kill_grace: text("WATCHMYSIX_KILL_GRACE"),
            log_buffer_lines: number("WATCHMYSIX_LOG_BUFFER_LINES"),
            subscriber_queue: number("WATCHMYSIX_SUBSCRIBER_QUEUE"),
            wordlist_dir: text("WATCHMYSIX_WORDLIST_DIR").map(PathBuf::from),
            resolver_dir: text("WATCHMYSIX_RESOLVER_DIR").map(PathBuf::from),
            crtsh_endpoint: text("WATCHMYSIX_CRTSH_ENDPOINT"),
            persist: text("WATCHMYSIX_PERSIST").and_then(|raw| parse_bool(&raw)),
            tool_overrides,
            chaos_api_key: text("CHAOS_API_KEY"),
            github_token: text("GITHUB_TOKEN"),
            gitlab_token: text("GITLAB_TOKEN"),
            cors_allowed_origins: text("CORS_ALLOWED_ORIGINS").map(|raw| parse_csv(&raw)),
        }
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
