//! Shared application state.

use std::sync::Arc;

use deepread_core::DeepReadConfig;
use deepread_runtime::Orchestrator;

use crate::hub::{Hub, DEFAULT_CLIENT_BUFFER};

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: DeepReadConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub hub: Arc<Hub>,
}

impl AppState {
    /// Build the state and start forwarding bus events to WebSocket clients.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let hub = Arc::new(Hub::new(DEFAULT_CLIENT_BUFFER));
        hub.spawn_bridge(orchestrator.bus());

        Self {
            config: orchestrator.config().clone(),
            orchestrator,
            hub,
        }
    }

    /// Upper bound for request bodies: the upload limit plus multipart framing.
    pub fn body_limit(&self) -> usize {
        self.config.max_upload_bytes as usize + 1024 * 1024
    }
}
