use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::broker::{Broker, BrokerSession};
use crate::config::BridgeConfig;
use crate::consumer::{CloseNotify, ConsumerSession};
use crate::error::{ConnectError, ConsumeError};
use crate::message::IngestedMessage;

/// Result of [`ConnectionSupervisor::reconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Connected,
    Cancelled,
}

// ═══════════════════════════════════════════════════════════════
//  ConnectionSupervisor
// ═══════════════════════════════════════════════════════════════

/// Владеет сессией брокера и consumer'ом одного datasource.
///
/// Shared between every ingestion loop of the datasource; all methods take
/// `&self`.
pub struct ConnectionSupervisor {
    broker: Arc<dyn Broker>,
    config: BridgeConfig,
    session: RwLock<Option<Arc<dyn BrokerSession>>>,
    /// Opened but not yet provisioned; closed by `dispose` if the connect
    /// future is dropped midway.
    provisioning: Mutex<Vec<Arc<dyn BrokerSession>>>,
    consumer: ConsumerSession,
    span: tracing::Span,
}

impl ConnectionSupervisor {
    pub fn new(broker: Arc<dyn Broker>, config: BridgeConfig) -> Self {
        let span = tracing::info_span!(
            "rabbitmq",
            host = %config.connection.host,
            vhost = %config.connection.vhost,
            stream = %config.stream.name,
        );
        Self {
            broker,
            consumer: ConsumerSession::new(config.stream.clone()),
            config,
            session: RwLock::new(None),
            provisioning: Mutex::new(Vec::new()),
            span,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Span carrying the connection identity; loops log under it.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Open a session and provision exchanges, the stream and bindings,
    /// in that order.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.open_and_provision().instrument(self.span.clone()).await
    }

    /// Synchronous check: is there a session and does it report open.
    pub fn is_connected(&self) -> bool {
        self.current_session().is_some_and(|s| s.is_open())
    }

    /// Start the single consumer of this datasource's stream.
    pub async fn consume(
        &self,
        deliveries: mpsc::Sender<IngestedMessage>,
    ) -> Result<CloseNotify, ConsumeError> {
        let session = self.current_session().ok_or(ConsumeError::NotConnected)?;
        self.consumer
            .consume(session.as_ref(), deliveries)
            .instrument(self.span.clone())
            .await
    }

    /// Retry `connect` with a fixed delay until it succeeds or `token` is
    /// cancelled. Failed attempts are logged, never returned.
    pub async fn reconnect(&self, token: &CancellationToken) -> ReconnectOutcome {
        let delay = self.config.reconnect_delay;
        async {
            let mut attempt: u32 = 0;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return ReconnectOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
                tracing::debug!(attempt, "trying to reconnect");

                self.teardown_stale().await;

                let result = tokio::select! {
                    _ = token.cancelled() => return ReconnectOutcome::Cancelled,
                    r = self.open_and_provision() => r,
                };
                match result {
                    Ok(()) => {
                        tracing::info!(attempt, "reconnected");
                        return ReconnectOutcome::Connected;
                    }
                    Err(e) => tracing::warn!(attempt, error = %e, "reconnect attempt failed"),
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Stop the consumer, delete objects flagged for disposal, close the
    /// session. Every step is best-effort; a second call is a no-op.
    pub async fn dispose(&self) {
        async {
            if let Err(e) = self.consumer.close().await {
                tracing::warn!(error = %e, "error closing consumer");
            }

            let abandoned = std::mem::take(&mut *self.provisioning());
            for session in abandoned {
                tracing::debug!("closing session abandoned during provisioning");
                if let Err(e) = session.close().await {
                    tracing::debug!(error = %e, "error closing abandoned session");
                }
            }

            let Some(session) = self.take_session() else {
                tracing::debug!("nothing to dispose");
                return;
            };
            tracing::info!("disposing connection");

            let stream = &self.config.stream;
            if stream.dispose_on_close {
                match session.delete_stream(&stream.name).await {
                    Ok(()) => tracing::debug!("stream deleted"),
                    Err(e) => tracing::warn!(error = %e, "error deleting stream"),
                }
            }

            for binding in self.config.topology.bindings.iter().filter(|b| b.should_dispose_binding) {
                if let Err(e) = session.unbind(binding).await {
                    tracing::warn!(
                        sender = %binding.sender_name,
                        receiver = %binding.receiver_name,
                        error = %e,
                        "error removing binding",
                    );
                }
            }

            for exchange in self.config.topology.exchanges.iter().filter(|e| e.should_dispose_exchange) {
                if let Err(e) = session.delete_exchange(exchange).await {
                    tracing::warn!(exchange = %exchange.name, error = %e, "error deleting exchange");
                }
            }

            if let Err(e) = session.close().await {
                tracing::warn!(error = %e, "error closing session");
            }
        }
        .instrument(self.span.clone())
        .await
    }

    async fn open_and_provision(&self) -> Result<(), ConnectError> {
        tracing::debug!("opening broker session");
        let session = self
            .broker
            .open(&self.config.connection)
            .await
            .map_err(ConnectError::Open)?;

        self.provisioning().push(session.clone());
        let provisioned = self.provision(session.as_ref()).await;
        self.provisioning().retain(|s| !Arc::ptr_eq(s, &session));

        if let Err(e) = provisioned {
            if let Err(close) = session.close().await {
                tracing::debug!(error = %close, "error closing half-provisioned session");
            }
            return Err(e);
        }

        let previous = self.write_session().replace(session);
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                tracing::debug!(error = %e, "error closing replaced session");
            }
        }
        tracing::info!("connected");
        Ok(())
    }

    async fn provision(&self, session: &dyn BrokerSession) -> Result<(), ConnectError> {
        for exchange in &self.config.topology.exchanges {
            session
                .declare_exchange(exchange)
                .await
                .map_err(|source| ConnectError::Provision {
                    object: format!("exchange {}", exchange.name),
                    source,
                })?;
        }

        session
            .declare_stream(&self.config.stream)
            .await
            .map_err(|source| ConnectError::Provision {
                object: format!("stream {}", self.config.stream.name),
                source,
            })?;

        for binding in &self.config.topology.bindings {
            session.bind(binding).await.map_err(|source| ConnectError::Provision {
                object: format!(
                    "binding {} -> {} {}",
                    binding.sender_name,
                    binding.receiver_kind(),
                    binding.receiver_name,
                ),
                source,
            })?;
        }
        Ok(())
    }

    /// Drop the consumer and session left from a lost connection. Topology
    /// is kept.
    async fn teardown_stale(&self) {
        if let Err(e) = self.consumer.close().await {
            tracing::debug!(error = %e, "error closing stale consumer");
        }
        if let Some(session) = self.take_session() {
            if let Err(e) = session.close().await {
                tracing::debug!(error = %e, "error closing stale session");
            }
        }
    }

    fn current_session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.write_session().take()
    }

    fn provisioning(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn BrokerSession>>> {
        self.provisioning.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_session(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn BrokerSession>>> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ Host: {}, VHost: {}, StreamName: {} }}",
            self.config.connection.host, self.config.connection.vhost, self.config.stream.name,
        )
    }
}
