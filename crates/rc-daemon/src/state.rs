use std::sync::Arc;

use rc_action::ActionGateway;
use rc_config::AppConfig;
use rc_probe::ProbeRunner;
use rc_store::Store;

/// Shared application state, constructed once in `main` and handed to every
/// route handler via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<Store>,
    pub runner: Arc<ProbeRunner>,
    pub gateway: ActionGateway,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<Store>,
        runner: Arc<ProbeRunner>,
        gateway: ActionGateway,
    ) -> Self {
        AppState {
            config,
            store,
            runner,
            gateway,
        }
    }
}
