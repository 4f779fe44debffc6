//! HTTP surface of the WatchMySix recon engine.

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
