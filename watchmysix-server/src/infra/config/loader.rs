use once_cell::sync::Lazy;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use watchmysix_core::settings::{
    DEFAULT_CRTSH_ENDPOINT, DEFAULT_KILL_GRACE, DEFAULT_LOG_RETENTION, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_STEP_CONCURRENCY, DEFAULT_STEP_TIMEOUT, DEFAULT_SUBSCRIBER_QUEUE,
};

use super::{
    models::{
        Config, ConfigMetadata, CorsConfig, CredentialsConfig, EngineConfig, ServerConfig,
        ToolOverrides, tool_key,
    },
    sources::{EnvConfig, FileConfig},
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("watchmysix.toml"),
        PathBuf::from("config/watchmysix.toml"),
    ]
});

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_DATA_DIR: &str = "/data";
const DEFAULT_WORDLIST_DIR: &str = "/opt/watchmysix/wordlists";
const DEFAULT_RESOLVER_DIR: &str = "/opt/watchmysix/resolvers";

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Load `.env`, then compose process environment, TOML file and defaults.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let mut load = self.load_from(EnvConfig::gather())?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Compose configuration from an already gathered environment.
    pub fn load_from(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let (config, warnings) = compose_config(file_config, env, config_path)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        // Explicit and environment-named files must exist; defaults are optional.
        let (path, explicit) = if let Some(path) = &self.options.config_path {
            (path.clone(), true)
        } else if let Some(path) = &env.config_path {
            (path.clone(), true)
        } else {
            match DEFAULT_CONFIG_LOCATIONS.iter().find(|candidate| candidate.exists()) {
                Some(path) => (path.clone(), false),
                None => return Ok((None, None)),
            }
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
                path: path.clone(),
                source,
            })?;

        Ok((Some(file_config), Some(path)))
    }
}

fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    config_path: Option<PathBuf>,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if config_path.is_none() {
        warnings.push_with_hint(
            "No watchmysix.toml detected; using environment variables and defaults",
            "Pass --config or set WATCHMYSIX_CONFIG to load a configuration file",
        );
    }

    let FileConfig {
        server: file_server,
        engine: file_engine,
        tools: file_tools,
        credentials: file_credentials,
        cors: file_cors,
    } = file_config.unwrap_or_default();

    let server = ServerConfig {
        host: env
            .server_host
            .or(file_server.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: env.server_port.or(file_server.port).unwrap_or(DEFAULT_PORT),
    };

    let step_timeout = resolve_duration(
        "step_timeout",
        env.step_timeout.or(file_engine.step_timeout),
        DEFAULT_STEP_TIMEOUT,
    )?;
    let kill_grace = resolve_duration(
        "kill_grace",
        env.kill_grace.or(file_engine.kill_grace),
        DEFAULT_KILL_GRACE,
    )?;

    let engine = EngineConfig {
        data_dir: env
            .data_dir
            .or(file_engine.data_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
        max_concurrency: env
            .max_concurrency
            .or(file_engine.max_concurrency)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY),
        step_concurrency: env
            .step_concurrency
            .or(file_engine.step_concurrency)
            .unwrap_or(DEFAULT_STEP_CONCURRENCY),
        step_timeout,
        kill_grace,
        log_buffer_lines: env
            .log_buffer_lines
            .or(file_engine.log_buffer_lines)
            .unwrap_or(DEFAULT_LOG_RETENTION),
        subscriber_queue: env
            .subscriber_queue
            .or(file_engine.subscriber_queue)
            .unwrap_or(DEFAULT_SUBSCRIBER_QUEUE),
        wordlist_dir: env
            .wordlist_dir
            .or(file_engine.wordlist_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORDLIST_DIR)),
        resolver_dir: env
            .resolver_dir
            .or(file_engine.resolver_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOLVER_DIR)),
        crtsh_endpoint: env
            .crtsh_endpoint
            .or(file_engine.crtsh_endpoint)
            .unwrap_or_else(|| DEFAULT_CRTSH_ENDPOINT.to_string()),
        persist: env.persist.or(file_engine.persist).unwrap_or(true),
    };

    // Environment overrides win over file entries for the same tool.
    let mut tools: BTreeMap<String, String> = file_tools
        .into_iter()
        .map(|(id, executable)| (tool_key(&id), executable))
        .collect();
    tools.extend(env.tool_overrides);

    let credentials = CredentialsConfig {
        chaos_api_key: env.chaos_api_key.or(file_credentials.chaos_api_key),
        github_token: env.github_token.or(file_credentials.github_token),
        gitlab_token: env.gitlab_token.or(file_credentials.gitlab_token),
    };

    let cors = CorsConfig {
        allowed_origins: env
            .cors_allowed_origins
            .or(file_cors.allowed_origins)
            .unwrap_or_else(default_cors_origins),
    };

    let config = Config {
        server,
        engine,
        tools: ToolOverrides(tools),
        credentials,
        cors,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded: false,
        },
    };

    warnings.extend(validation::apply_guard_rails(&config)?);
    Ok((config, warnings))
}

fn resolve_duration(
    field: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    match raw {
        None => Ok(default),
        Some(raw) => humantime::parse_duration(&raw).map_err(|source| {
            ConfigLoadError::InvalidDuration {
                field,
                value: raw.clone(),
                source,
            }
        }),
    }
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
    ]
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid duration '{value}' for {field}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoad {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.metadata.config_path.as_deref()
    }
}
