pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;
pub mod services;

use std::sync::Arc;

use gateway::Gateway;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    /// Shared secret for `/internal/*`; `None` leaves them open.
    pub internal_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, internal_token: Option<String>) -> Self {
        Self {
            gateway,
            internal_token: internal_token.map(Arc::from),
        }
    }
}
