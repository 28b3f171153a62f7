use std::{fmt, sync::Arc};

use vigil_config::Config;
use vigil_core::Daemon;

#[derive(Clone)]
pub struct AppState {
    pub daemon: Arc<Daemon>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(daemon: Arc<Daemon>, config: Arc<Config>) -> Self {
        Self { daemon, config }
    }

    pub fn daemon(&self) -> &Daemon {
        &self.daemon
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
