pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    Config, ConfigMetadata, CorsConfig, CredentialsConfig, EngineConfig, ServerConfig,
    ToolOverrides,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
