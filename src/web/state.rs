use std::sync::Arc;

use crate::provider::SandboxProvider;
use crate::session::SessionService;

/// Shared application state for web handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SessionService>,
    pub provider: Arc<dyn SandboxProvider>,
}

impl AppState {
    pub fn new(service: Arc<SessionService>, provider: Arc<dyn SandboxProvider>) -> Self {
        Self { service, provider }
    }
}
