//! RabbitMQ stream → tabular frames.
//!
//! [`ConnectionSupervisor`] owns the broker session and provisions the
//! stream topology, [`IngestionLoop`] turns each delivery into a one-row
//! [`Table`] via [`Framer`] and hands it to a [`RowSink`].

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod framer;
pub mod ingest;
pub mod message;
pub mod rabbitmq;
pub mod sink;
pub mod supervisor;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use broker::{Broker, BrokerSession, Subscription, SubscriptionHandle};
pub use config::{
    BindingOptions, BridgeConfig, ConnectionConfig, ExchangeOptions, OffsetPolicy, StreamDescriptor,
    Topology,
};
pub use consumer::{CloseEvent, CloseNotify, ConsumerSession};
pub use error::{BrokerError, ConfigError, ConnectError, ConsumeError, PushError};
pub use framer::{
    Column, ColumnType, ColumnValues, FlattenOptions, Framer, PayloadEncoding, TIME_COLUMN, Table,
};
pub use ingest::{DisposeLatch, IngestExit, IngestState, IngestionLoop};
pub use message::IngestedMessage;
pub use rabbitmq::RabbitMqBroker;
pub use sink::{ChannelSink, OverflowPolicy, RowSink};
pub use supervisor::{ConnectionSupervisor, ReconnectOutcome};
