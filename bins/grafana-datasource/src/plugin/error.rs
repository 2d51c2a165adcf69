use grafana_plugin_sdk::backend;
use stream_bridge::{ConfigError, ConnectError};

// ═══════════════════════════════════════════════════════════════
//  Error types
// ═══════════════════════════════════════════════════════════════

/// Grafana plugin error for individual queries.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct QueryError {
    pub ref_id: String,
    pub message: String,
}

impl backend::DataQueryError for QueryError {
    fn ref_id(self) -> String {
        self.ref_id
    }
}

/// A datasource instance could not be built from its settings.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("request carries no datasource settings")]
    MissingSettings,
    #[error("invalid datasource settings: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Connect(#[from] ConnectError),
}

/// Error type for streaming operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("instance: {0}")]
    Instance(#[from] InstanceError),
    #[error("frame: {0}")]
    Frame(String),
}
