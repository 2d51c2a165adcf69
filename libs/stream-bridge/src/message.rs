use chrono::{DateTime, Utc};

/// Сообщение из stream'а с временем получения.
///
/// Создаётся в момент доставки payload'а, дальше не изменяется и
/// потребляется framer'ом ровно один раз.
#[derive(Clone, Debug)]
pub struct IngestedMessage {
    pub received_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl IngestedMessage {
    /// Stamp a payload with the current wall-clock time.
    pub fn now(payload: Vec<u8>) -> Self {
        Self {
            received_at: Utc::now(),
            payload,
        }
    }

    pub fn at(received_at: DateTime<Utc>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            received_at,
            payload: payload.into(),
        }
    }
}
