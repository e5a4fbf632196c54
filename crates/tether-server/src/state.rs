//! Shared state handed to every HTTP and WebSocket handler.

use tether_pty::SessionRegistry;

use crate::handler::HandlerSettings;

#[derive(Clone)]
pub struct AppState {
    /// All live sessions. Cloning shares the same registry.
    pub registry: SessionRegistry,
    /// Input rules applied to every attached connection.
    pub handler: HandlerSettings,
}

impl AppState {
    pub fn new(registry: SessionRegistry, handler: HandlerSettings) -> Self {
        Self { registry, handler }
    }
}
