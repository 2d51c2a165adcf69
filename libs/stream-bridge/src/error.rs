// ═══════════════════════════════════════════════════════════════
//  Error types
// ═══════════════════════════════════════════════════════════════

/// Invalid datasource settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{field}: {detail}")]
    Invalid { field: &'static str, detail: String },
}

/// Failure reported by a broker adapter.
///
/// `context` names the step that failed ("open stream environment",
/// "declare exchange ex", ...), `message` carries the client's own text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{context}: {message}")]
pub struct BrokerError {
    pub context: String,
    pub message: String,
}

impl BrokerError {
    pub fn new(context: impl Into<String>, message: impl ToString) -> Self {
        Self {
            context: context.into(),
            message: message.to_string(),
        }
    }
}

/// `Connect` failure. Fatal to that call; retries belong to `reconnect`.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("open session: {0}")]
    Open(#[source] BrokerError),

    #[error("provision {object}: {source}")]
    Provision {
        object: String,
        #[source]
        source: BrokerError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// A subscription is already live for this stream. Expected outcome,
    /// not a fault.
    #[error("consumer for stream '{stream}' is already running")]
    AlreadyConsuming { stream: String },

    #[error("no open broker session")]
    NotConnected,

    #[error("subscribe: {0}")]
    Subscribe(#[source] BrokerError),
}

/// Row could not be handed to the downstream sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("sink closed")]
    Closed,

    #[error("sink full, row dropped")]
    Full,

    #[error("cancelled")]
    Cancelled,
}
