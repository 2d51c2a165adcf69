use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::broker::{BrokerSession, DeliveryStream, Subscription, SubscriptionHandle};
use crate::config::StreamDescriptor;
use crate::error::{BrokerError, ConsumeError};
use crate::message::IngestedMessage;

/// Why the broker ended a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub consumer: String,
    pub stream: String,
    pub reason: String,
}

/// One-shot notification fired when the subscription ends.
///
/// [`recv`](Self::recv) yields `Some` when the broker closed the
/// subscription and `None` when it was closed locally.
#[derive(Debug)]
pub struct CloseNotify {
    rx: oneshot::Receiver<CloseEvent>,
}

impl CloseNotify {
    /// Cancel safe: may be polled again after being dropped in a `select!`.
    pub async fn recv(&mut self) -> Option<CloseEvent> {
        (&mut self.rx).await.ok()
    }
}

enum ConsumerState {
    NoSession,
    /// `subscribe` is in flight; blocks a second `consume`.
    Starting,
    Active {
        handle: Box<dyn SubscriptionHandle>,
        pump: JoinHandle<()>,
    },
}

/// At most one live subscription per stream.
pub struct ConsumerSession {
    stream: StreamDescriptor,
    state: Mutex<ConsumerState>,
}

impl ConsumerSession {
    pub fn new(stream: StreamDescriptor) -> Self {
        Self {
            stream,
            state: Mutex::new(ConsumerState::NoSession),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(*self.lock(), ConsumerState::NoSession)
    }

    /// Subscribe to the stream and forward every delivery into `deliveries`,
    /// stamped at arrival.
    ///
    /// Fails with [`ConsumeError::AlreadyConsuming`] while another
    /// subscription is live or starting.
    pub async fn consume(
        &self,
        session: &dyn BrokerSession,
        deliveries: mpsc::Sender<IngestedMessage>,
    ) -> Result<CloseNotify, ConsumeError> {
        {
            let mut state = self.lock();
            if !matches!(*state, ConsumerState::NoSession) {
                return Err(ConsumeError::AlreadyConsuming {
                    stream: self.stream.name.clone(),
                });
            }
            *state = ConsumerState::Starting;
        }

        let subscription = match session.subscribe(&self.stream).await {
            Ok(s) => s,
            Err(e) => {
                *self.lock() = ConsumerState::NoSession;
                return Err(ConsumeError::Subscribe(e));
            }
        };

        let Subscription { deliveries: stream, handle } = subscription;
        let (close_tx, close_rx) = oneshot::channel();
        let abandoned = {
            let mut state = self.lock();
            if matches!(*state, ConsumerState::Starting) {
                let pump = tokio::spawn(
                    pump(
                        stream,
                        deliveries,
                        close_tx,
                        self.stream.consumer_name.clone(),
                        self.stream.name.clone(),
                    )
                    .in_current_span(),
                );
                *state = ConsumerState::Active { handle, pump };
                None
            } else {
                // closed while subscribing
                Some(handle)
            }
        };

        if let Some(handle) = abandoned {
            if let Err(e) = handle.close().await {
                tracing::warn!(error = %e, "error closing abandoned subscription");
            }
            return Err(ConsumeError::Subscribe(BrokerError::new(
                "subscribe",
                "consumer closed while starting",
            )));
        }
        tracing::info!(consumer = %self.stream.consumer_name, "consumer started");

        Ok(CloseNotify { rx: close_rx })
    }

    /// Stop the subscription. No-op when nothing is running.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let previous = std::mem::replace(&mut *self.lock(), ConsumerState::NoSession);
        match previous {
            ConsumerState::Active { handle, pump } => {
                pump.abort();
                handle.close().await
            }
            ConsumerState::Starting | ConsumerState::NoSession => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConsumerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn pump(
    mut deliveries: DeliveryStream,
    tx: mpsc::Sender<IngestedMessage>,
    close_tx: oneshot::Sender<CloseEvent>,
    consumer: String,
    stream: String,
) {
    let mut last_error = None;
    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(payload) => {
                if tx.send(IngestedMessage::now(payload)).await.is_err() {
                    tracing::debug!("delivery receiver dropped, stopping");
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "delivery error");
                last_error = Some(e);
            }
        }
    }

    let reason = match last_error {
        Some(e) => format!("subscription closed by broker after delivery error: {e}"),
        None => "subscription closed by broker".to_string(),
    };
    tracing::info!(%consumer, %stream, %reason, "consumer closed");
    let _ = close_tx.send(CloseEvent { consumer, stream, reason });
}
