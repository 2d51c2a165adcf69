use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
pub use futures::future::BoxFuture;

use crate::config::{BindingOptions, ConnectionConfig, ExchangeOptions, StreamDescriptor};
use crate::error::BrokerError;

// ═══════════════════════════════════════════════════════════════
//  Broker seam
// ═══════════════════════════════════════════════════════════════
//
// Всё общение с брокером идёт через эти трейты: супервизор и consumer
// не знают про конкретный клиент. Продовая реализация живёт в
// `rabbitmq`, in-memory для тестов в `testing`.

/// Raw payloads in broker delivery order. Ends when the broker closes
/// the subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, BrokerError>> + Send>>;

/// Opens sessions against one broker deployment.
pub trait Broker: Send + Sync {
    fn open<'a>(
        &'a self,
        config: &'a ConnectionConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn BrokerSession>, BrokerError>>;
}

/// An open session: stream plane plus topology control plane.
pub trait BrokerSession: Send + Sync {
    /// Cheap liveness check, no I/O.
    fn is_open(&self) -> bool;

    /// Idempotent: an already existing stream is not an error.
    fn declare_stream<'a>(&'a self, stream: &'a StreamDescriptor) -> BoxFuture<'a, Result<(), BrokerError>>;

    fn delete_stream<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), BrokerError>>;

    fn declare_exchange<'a>(&'a self, exchange: &'a ExchangeOptions) -> BoxFuture<'a, Result<(), BrokerError>>;

    fn delete_exchange<'a>(&'a self, exchange: &'a ExchangeOptions) -> BoxFuture<'a, Result<(), BrokerError>>;

    fn bind<'a>(&'a self, binding: &'a BindingOptions) -> BoxFuture<'a, Result<(), BrokerError>>;

    fn unbind<'a>(&'a self, binding: &'a BindingOptions) -> BoxFuture<'a, Result<(), BrokerError>>;

    fn subscribe<'a>(&'a self, stream: &'a StreamDescriptor) -> BoxFuture<'a, Result<Subscription, BrokerError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>>;
}

/// A live subscription. Dropping `deliveries` alone does not unsubscribe;
/// call [`SubscriptionHandle::close`].
pub struct Subscription {
    pub deliveries: DeliveryStream,
    pub handle: Box<dyn SubscriptionHandle>,
}

pub trait SubscriptionHandle: Send {
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>>;
}
