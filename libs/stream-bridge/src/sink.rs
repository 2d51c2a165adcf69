use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::PushError;
use crate::framer::Table;

// ════════════════════════════════════════════════════════════════
//  Overflow Policy
// ════════════════════════════════════════════════════════════════

/// Стратегия поведения при переполнении bounded канала.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// try_send(): если канал полон, отдать `PushError::Full`.
    Drop,
    /// .send().await: ждать пока появится место (back-pressure).
    #[serde(alias = "backpressure")]
    BackPressure,
}

// ════════════════════════════════════════════════════════════════
//  RowSink
// ════════════════════════════════════════════════════════════════

/// Downstream consumer of framed rows, one table per message.
pub trait RowSink: Send + Sync {
    fn push(&self, table: Table) -> BoxFuture<'_, Result<(), PushError>>;
}

/// Bounded-channel sink. The receiving half belongs to whoever renders
/// the rows (the Grafana stream in the plugin).
pub struct ChannelSink {
    tx: mpsc::Sender<Table>,
    overflow: OverflowPolicy,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Table>, overflow: OverflowPolicy) -> Self {
        Self { tx, overflow }
    }

    pub fn channel(buffer: usize, overflow: OverflowPolicy) -> (Self, mpsc::Receiver<Table>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx, overflow), rx)
    }
}

impl RowSink for ChannelSink {
    fn push(&self, table: Table) -> BoxFuture<'_, Result<(), PushError>> {
        Box::pin(async move {
            match self.overflow {
                OverflowPolicy::Drop => match self.tx.try_send(table) {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => Err(PushError::Full),
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
                },
                OverflowPolicy::BackPressure => {
                    self.tx.send(table).await.map_err(|_| PushError::Closed)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::FRAME_NAME;

    fn table() -> Table {
        Table { name: FRAME_NAME.into(), columns: Vec::new() }
    }

    #[tokio::test]
    async fn test_drop_policy_reports_full() {
        let (sink, mut rx) = ChannelSink::channel(1, OverflowPolicy::Drop);
        sink.push(table()).await.unwrap();
        assert_eq!(sink.push(table()).await, Err(PushError::Full));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_closed_receiver() {
        let (sink, rx) = ChannelSink::channel(4, OverflowPolicy::BackPressure);
        drop(rx);
        assert_eq!(sink.push(table()).await, Err(PushError::Closed));
    }

    #[test]
    fn test_overflow_policy_names() {
        let p: OverflowPolicy = serde_json::from_str("\"backpressure\"").unwrap();
        assert_eq!(p, OverflowPolicy::BackPressure);
        let p: OverflowPolicy = serde_json::from_str("\"drop\"").unwrap();
        assert_eq!(p, OverflowPolicy::Drop);
    }
}
