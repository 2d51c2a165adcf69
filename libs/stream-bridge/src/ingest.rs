use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::consumer::{CloseEvent, CloseNotify};
use crate::error::{ConnectError, ConsumeError, PushError};
use crate::framer::Framer;
use crate::message::IngestedMessage;
use crate::sink::RowSink;
use crate::supervisor::{ConnectionSupervisor, ReconnectOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Disconnected,
    Connected,
    Consuming,
    Reconnecting,
    Terminated,
}

/// Why [`IngestionLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestExit {
    /// The cancellation token fired; the supervisor was disposed.
    Cancelled,
    /// Another loop already consumes this stream.
    AlreadyConsuming,
    /// The consumer was closed locally.
    ConsumerClosed,
}

/// Fires at most once, however many callers race on it.
#[derive(Debug, Default)]
pub struct DisposeLatch(AtomicBool);

impl DisposeLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` for the first caller only.
    pub fn try_fire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_fired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

enum ConsumeEnd {
    Cancelled,
    BrokerClosed(CloseEvent),
    LocalClose,
}

// ═══════════════════════════════════════════════════════════════
//  IngestionLoop
// ═══════════════════════════════════════════════════════════════

/// Долгоживущий цикл: сообщения stream'а → кадры → sink.
///
/// State machine: `Disconnected → Connected → Consuming`, with
/// `Consuming → Reconnecting → Connected` on broker-side close and
/// `Terminated` on cancellation or local close.
pub struct IngestionLoop {
    supervisor: Arc<ConnectionSupervisor>,
    framer: Framer,
    sink: Arc<dyn RowSink>,
    token: CancellationToken,
    latch: DisposeLatch,
    state: IngestState,
}

impl IngestionLoop {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        framer: Framer,
        sink: Arc<dyn RowSink>,
        token: CancellationToken,
    ) -> Self {
        let state = if supervisor.is_connected() {
            IngestState::Connected
        } else {
            IngestState::Disconnected
        };
        Self {
            supervisor,
            framer,
            sink,
            token,
            latch: DisposeLatch::new(),
            state,
        }
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    /// Run until cancelled, until another loop owns the stream, or until the
    /// consumer is closed locally.
    ///
    /// Only a failed initial connect is returned as an error; later
    /// connection losses are retried by the supervisor.
    pub async fn run(mut self) -> Result<IngestExit, ConnectError> {
        let span = self.supervisor.span().clone();
        self.drive().instrument(span).await
    }

    async fn drive(&mut self) -> Result<IngestExit, ConnectError> {
        let supervisor = self.supervisor.clone();
        let token = self.token.clone();

        loop {
            if self.state != IngestState::Terminated && token.is_cancelled() {
                return Ok(self.terminate().await);
            }

            match self.state {
                IngestState::Disconnected => {
                    tokio::select! {
                        _ = token.cancelled() => return Ok(self.terminate().await),
                        r = supervisor.connect() => r?,
                    }
                    self.transition(IngestState::Connected);
                }
                IngestState::Connected => {
                    let (tx, mut rx) = mpsc::channel(supervisor.config().delivery_buffer);
                    let consumed = tokio::select! {
                        _ = token.cancelled() => return Ok(self.terminate().await),
                        r = supervisor.consume(tx) => r,
                    };
                    let mut close = match consumed {
                        Ok(close) => close,
                        Err(ConsumeError::AlreadyConsuming { stream }) => {
                            tracing::info!(%stream, "stream is already being consumed");
                            self.transition(IngestState::Terminated);
                            return Ok(IngestExit::AlreadyConsuming);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "consume failed, reconnecting");
                            self.transition(IngestState::Reconnecting);
                            continue;
                        }
                    };
                    self.transition(IngestState::Consuming);

                    match self.consume(&token, &mut rx, &mut close).await {
                        ConsumeEnd::Cancelled => return Ok(self.terminate().await),
                        ConsumeEnd::BrokerClosed(event) => {
                            tracing::warn!(
                                consumer = %event.consumer,
                                reason = %event.reason,
                                "consumer closed by broker, reconnecting",
                            );
                            self.transition(IngestState::Reconnecting);
                        }
                        ConsumeEnd::LocalClose => {
                            tracing::info!("consumer closed");
                            self.transition(IngestState::Terminated);
                            return Ok(IngestExit::ConsumerClosed);
                        }
                    }
                }
                IngestState::Consuming => {
                    // Consuming is only entered inside the Connected arm.
                    self.transition(IngestState::Connected);
                }
                IngestState::Reconnecting => match supervisor.reconnect(&token).await {
                    ReconnectOutcome::Connected => self.transition(IngestState::Connected),
                    ReconnectOutcome::Cancelled => return Ok(self.terminate().await),
                },
                IngestState::Terminated => return Ok(IngestExit::Cancelled),
            }
        }
    }

    async fn consume(
        &mut self,
        token: &CancellationToken,
        rx: &mut mpsc::Receiver<IngestedMessage>,
        close: &mut CloseNotify,
    ) -> ConsumeEnd {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return ConsumeEnd::Cancelled,
                Some(message) = rx.recv() => {
                    if self.deliver(token, message).await.is_break() {
                        return ConsumeEnd::Cancelled;
                    }
                }
                event = close.recv() => {
                    return match event {
                        Some(event) => ConsumeEnd::BrokerClosed(event),
                        None => ConsumeEnd::LocalClose,
                    };
                }
            }
        }
    }

    /// Frame one message and push it. Breaks when the push was cut short by
    /// cancellation; the supervisor is disposed by then.
    async fn deliver(&mut self, token: &CancellationToken, message: IngestedMessage) -> ControlFlow<()> {
        let table = self.framer.to_frame(&message);

        if token.is_cancelled() {
            tracing::info!("stopped streaming: cancelled before push");
            self.dispose_once().await;
            return ControlFlow::Break(());
        }

        let sink = self.sink.clone();
        let pushed = tokio::select! {
            r = sink.push(table) => r,
            _ = token.cancelled() => Err(PushError::Cancelled),
        };

        if let Err(e) = pushed {
            if token.is_cancelled() {
                tracing::info!(error = %e, "stopped streaming: cancelled while sending frame");
                self.dispose_once().await;
                return ControlFlow::Break(());
            }
            tracing::warn!(error = %e, "error sending frame");
        }
        ControlFlow::Continue(())
    }

    async fn terminate(&mut self) -> IngestExit {
        tracing::info!("stopped streaming: cancelled");
        self.dispose_once().await;
        self.transition(IngestState::Terminated);
        IngestExit::Cancelled
    }

    async fn dispose_once(&self) {
        if self.latch.try_fire() {
            self.supervisor.dispose().await;
        } else {
            tracing::debug!("already disposed");
        }
    }

    fn transition(&mut self, next: IngestState) {
        tracing::debug!(from = ?self.state, to = ?next, "ingest state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::broker::BoxFuture;
    use crate::framer::{FlattenOptions, Table};
    use crate::sink::{ChannelSink, OverflowPolicy};
    use crate::testing::{MemoryBroker, bridge_config, wait_until};

    fn supervisor(broker: &MemoryBroker) -> Arc<ConnectionSupervisor> {
        Arc::new(ConnectionSupervisor::new(Arc::new(broker.clone()), bridge_config()))
    }

    fn ingestion(
        sv: &Arc<ConnectionSupervisor>,
        sink: Arc<dyn RowSink>,
        token: &CancellationToken,
    ) -> IngestionLoop {
        IngestionLoop::new(sv.clone(), Framer::new(FlattenOptions::default()), sink, token.clone())
    }

    fn value(table: &Table, column: &str) -> Option<f64> {
        match table.column(column)?.values() {
            crate::framer::ColumnValues::Float64(v) => v[0],
            _ => None,
        }
    }

    /// Rejects every row; optionally cancels the token first.
    struct RejectingSink {
        pushes: AtomicUsize,
        cancel: Option<CancellationToken>,
    }

    impl RowSink for RejectingSink {
        fn push(&self, _table: Table) -> BoxFuture<'_, Result<(), PushError>> {
            Box::pin(async move {
                self.pushes.fetch_add(1, Ordering::SeqCst);
                if let Some(token) = &self.cancel {
                    token.cancel();
                }
                Err(PushError::Closed)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rows_flow_in_delivery_order() {
        let broker = MemoryBroker::new();
        let sv = supervisor(&broker);
        let token = CancellationToken::new();
        let (sink, mut rows) = ChannelSink::channel(8, OverflowPolicy::BackPressure);
        let task = tokio::spawn(ingestion(&sv, Arc::new(sink), &token).run());

        wait_until(|| broker.has_subscriber()).await;
        for n in 1..=3 {
            assert!(broker.deliver(&format!(r#"{{"n": {n}}}"#)));
        }
        for n in 1..=3 {
            let table = rows.recv().await.unwrap();
            assert_eq!(value(&table, "n"), Some(n as f64));
        }

        token.cancel();
        assert_eq!(task.await.unwrap().unwrap(), IngestExit::Cancelled);
        assert_eq!(broker.count("close"), 1);
        assert_eq!(broker.count("delete_stream"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_loop_sees_already_consuming() {
        let broker = MemoryBroker::new();
        let sv = supervisor(&broker);
        let token = CancellationToken::new();
        let (sink, _rows) = ChannelSink::channel(8, OverflowPolicy::BackPressure);
        let sink: Arc<dyn RowSink> = Arc::new(sink);
        let first = tokio::spawn(ingestion(&sv, sink.clone(), &token).run());
        wait_until(|| broker.has_subscriber()).await;

        let second = ingestion(&sv, sink, &token);
        assert_eq!(second.state(), IngestState::Connected);
        assert_eq!(second.run().await.unwrap(), IngestExit::AlreadyConsuming);
        assert_eq!(broker.subscriptions(), 1);

        token.cancel();
        assert_eq!(first.await.unwrap().unwrap(), IngestExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_close_triggers_reconnect() {
        let broker = MemoryBroker::new();
        let sv = supervisor(&broker);
        let token = CancellationToken::new();
        let (sink, mut rows) = ChannelSink::channel(8, OverflowPolicy::BackPressure);
        let task = tokio::spawn(ingestion(&sv, Arc::new(sink), &token).run());

        wait_until(|| broker.has_subscriber()).await;
        broker.deliver(r#"{"n": 1}"#);
        assert_eq!(value(&rows.recv().await.unwrap(), "n"), Some(1.0));

        broker.fail_next_opens(2);
        broker.drop_connection();
        wait_until(|| broker.subscriptions() == 2).await;

        broker.deliver(r#"{"n": 2}"#);
        assert_eq!(value(&rows.recv().await.unwrap(), "n"), Some(2.0));
        assert_eq!(broker.opens(), 4);
        // reconnect keeps the topology
        assert_eq!(broker.count("delete_"), 0);

        token.cancel();
        assert_eq!(task.await.unwrap().unwrap(), IngestExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_reconnect() {
        let broker = MemoryBroker::new();
        let sv = supervisor(&broker);
        let token = CancellationToken::new();
        let (sink, _rows) = ChannelSink::channel(8, OverflowPolicy::BackPressure);
        let task = tokio::spawn(ingestion(&sv, Arc::new(sink), &token).run());

        wait_until(|| broker.has_subscriber()).await;
        broker.fail_next_opens(usize::MAX);
        broker.drop_connection();
        tokio::time::sleep(Duration::from_secs(5)).await;

        token.cancel();
        assert_eq!(task.await.unwrap().unwrap(), IngestExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_subscribe_pending() {
        let broker = MemoryBroker::new();
        broker.stall_subscribe(true);
        let sv = supervisor(&broker);
        let token = CancellationToken::new();
        let (sink, _rows) = ChannelSink::channel(8, OverflowPolicy::BackPressure);
        let task = tokio::spawn(ingestion(&sv, Arc::new(sink), &token).run());

        wait_until(|| broker.count("subscribe pending") == 1).await;
        token.cancel();

        let exit = tokio::time::timeout(Duration::from_secs(60), task).await;
        assert_eq!(exit.unwrap().unwrap().unwrap(), IngestExit::Cancelled);
        assert!(!sv.is_connected());
        assert_eq!(broker.count("close"), 1);

        // the consumer slot was released by dispose
        broker.stall_subscribe(false);
        sv.connect().await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        sv.consume(tx).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_error_without_cancellation_is_skipped() {
        let broker = MemoryBroker::new();
        let sv = supervisor(&broker);
        let token = CancellationToken::new();
        let sink = Arc::new(RejectingSink {
            pushes: AtomicUsize::new(0),
            cancel: None,
        });
        let task = tokio::spawn(ingestion(&sv, sink.clone(), &token).run());

        wait_until(|| broker.has_subscriber()).await;
        broker.deliver(r#"{"n": 1}"#);
        broker.deliver(r#"{"n": 2}"#);
        wait_until(|| sink.pushes.load(Ordering::SeqCst) == 2).await;

        assert!(!task.is_finished());
        assert_eq!(broker.count("close"), 0);

        token.cancel();
        assert_eq!(task.await.unwrap().unwrap(), IngestExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_push_disposes_once() {
        let broker = MemoryBroker::new();
        let sv = supervisor(&broker);
        let token = CancellationToken::new();
        let sink = Arc::new(RejectingSink {
            pushes: AtomicUsize::new(0),
            cancel: Some(token.clone()),
        });
        let task = tokio::spawn(ingestion(&sv, sink.clone(), &token).run());

        wait_until(|| broker.has_subscriber()).await;
        broker.deliver(r#"{"n": 1}"#);

        assert_eq!(task.await.unwrap().unwrap(), IngestExit::Cancelled);
        assert_eq!(sink.pushes.load(Ordering::SeqCst), 1);
        assert_eq!(broker.count("close"), 1);
        assert_eq!(broker.count("delete_stream"), 1);
    }

    #[tokio::test]
    async fn test_initial_connect_failure_is_returned() {
        let broker = MemoryBroker::new();
        broker.fail_next_opens(1);
        let sv = supervisor(&broker);
        let (sink, _rows) = ChannelSink::channel(8, OverflowPolicy::BackPressure);

        let result = ingestion(&sv, Arc::new(sink), &CancellationToken::new()).run().await;

        assert!(matches!(result, Err(ConnectError::Open(_))));
        assert_eq!(broker.opens(), 1);
    }

    #[tokio::test]
    async fn test_dispose_latch_fires_once_under_race() {
        let latch = Arc::new(DisposeLatch::new());
        let winners = Arc::new(Mutex::new(0));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let latch = latch.clone();
            let winners = winners.clone();
            tasks.push(tokio::spawn(async move {
                if latch.try_fire() {
                    *winners.lock().unwrap() += 1;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*winners.lock().unwrap(), 1);
        assert!(latch.is_fired());
    }
}
