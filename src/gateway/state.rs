use std::sync::Arc;

use crate::{
    client::InternalClient, config::Config, format::Format, gateway::metadata::HeaderForwarding,
    registry::Registry,
};

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub client: InternalClient,
    pub format: Format,
    pub forwarding: Arc<HeaderForwarding>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, client: InternalClient) -> Self {
        let config = Config::default();
        Self {
            forwarding: Arc::new(HeaderForwarding::new(&config.forward_header_prefixes)),
            config: Arc::new(config),
            registry,
            client,
            format: Format::default(),
        }
    }

    /// Replaces the configuration and the header allow-list derived from it.
    pub fn with_config(mut self, config: Config) -> Self {
        self.forwarding = Arc::new(HeaderForwarding::new(&config.forward_header_prefixes));
        self.config = Arc::new(config);
        self
    }
}
