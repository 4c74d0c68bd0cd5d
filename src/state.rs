use std::sync::Arc;

use crate::{
    backend::ChatTransport, config::RelayConfig, metrics::AppMetrics, store::ConfigStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub transport: Arc<dyn ChatTransport>,
    pub relay: RelayConfig,
    pub metrics: Arc<AppMetrics>,
}

impl AppState {
    pub fn new<T>(config: Arc<ConfigStore>, transport: Arc<T>, relay: RelayConfig) -> Self
    where
        T: ChatTransport + 'static,
    {
        let transport: Arc<dyn ChatTransport> = transport;
        Self {
            config,
            transport,
            relay,
            metrics: Arc::new(AppMetrics::new()),
        }
    }
}
