use std::time::Duration;

use thiserror::Error;

use super::models::Config;

const MIN_SENSIBLE_STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("{field} must be at least 1")]
    ZeroLimit { field: &'static str },
    #[error("step timeout must be non-zero")]
    ZeroStepTimeout,
    #[error("server host '{host}' is not an IP address")]
    InvalidHost { host: String },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let engine = &config.engine;

    for (field, value) in [
        ("max_concurrency", engine.max_concurrency),
        ("step_concurrency", engine.step_concurrency),
        ("log_buffer_lines", engine.log_buffer_lines),
        ("subscriber_queue", engine.subscriber_queue),
    ] {
        if value == 0 {
            return Err(ConfigGuardRailError::ZeroLimit { field });
        }
    }
    if engine.step_timeout.is_zero() {
        return Err(ConfigGuardRailError::ZeroStepTimeout);
    }
    if config.server.socket_addr().is_err() {
        return Err(ConfigGuardRailError::InvalidHost {
            host: config.server.host.clone(),
        });
    }

    if engine.step_timeout < MIN_SENSIBLE_STEP_TIMEOUT {
        warnings.push_with_hint(
            format!(
                "step timeout of {} will cut most recon tools short",
                humantime::format_duration(engine.step_timeout)
            ),
            "Raise WATCHMYSIX_STEP_TIMEOUT; passive enumeration commonly takes minutes",
        );
    }
    if engine.kill_grace.is_zero() {
        warnings.push(
            "kill grace is zero; interrupted tools are killed without a chance to flush output",
        );
    }
    if !engine.persist {
        warnings.push("job persistence is disabled; finished jobs are lost on restart");
    }
    if !engine.wordlist_dir.exists() {
        warnings.push_with_hint(
            format!(
                "wordlist directory {} does not exist",
                engine.wordlist_dir.display()
            ),
            "Bruteforce steps need WATCHMYSIX_WORDLIST_DIR or explicit wordlists per request",
        );
    }
    if config.credentials.chaos_api_key.is_none() {
        warnings.push_with_hint(
            "CHAOS_API_KEY not configured; the chaos tool will fail unless a request supplies CHAOS_KEY",
            "Set CHAOS_API_KEY to enable the ProjectDiscovery Chaos dataset",
        );
    }
    if config.cors.is_wildcard() {
        warnings.push("CORS allows any origin");
    }

    Ok(warnings)
}
