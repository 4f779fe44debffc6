use std::{fmt, sync::Arc};

use tokio_util::sync::CancellationToken;
use watchmysix_core::ReconEngine;

use crate::infra::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconEngine>,
    pub config: Arc<Config>,
    /// Cancelled when the server begins shutting down; ends open log streams.
    pub shutdown: CancellationToken,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(engine: Arc<ReconEngine>, config: Arc<Config>) -> Self {
        Self {
            engine,
            config,
            shutdown: CancellationToken::new(),
        }
    }
}
