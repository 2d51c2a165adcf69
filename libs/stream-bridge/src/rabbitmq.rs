use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use lapin::options::{
    ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions,
    QueueBindOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use rabbitmq_stream_client::error::StreamCreateError;
use rabbitmq_stream_client::types::{ByteCapacity, OffsetSpecification, ResponseCode};
use rabbitmq_stream_client::{ConsumerHandle, Environment, TlsConfiguration};

use crate::broker::{BoxFuture, Broker, BrokerSession, Subscription, SubscriptionHandle};
use crate::config::{BindingOptions, ConnectionConfig, ExchangeOptions, OffsetPolicy, StreamDescriptor};
use crate::error::BrokerError;

// ═══════════════════════════════════════════════════════════════
//  RabbitMQ adapter
// ═══════════════════════════════════════════════════════════════
//
// Data plane: stream protocol (rabbitmq-stream-client) for stream
// declaration and consuming. Control plane: AMQP 0.9.1 (lapin) for
// exchanges and bindings, which the stream protocol has no commands for.

const REPLY_SUCCESS: u16 = 200;

/// Production [`Broker`] backed by a RabbitMQ node with the stream plugin.
#[derive(Debug, Default, Clone, Copy)]
pub struct RabbitMqBroker;

impl Broker for RabbitMqBroker {
    fn open<'a>(
        &'a self,
        config: &'a ConnectionConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn BrokerSession>, BrokerError>> {
        Box::pin(async move {
            let session = RabbitMqSession::open(config).await?;
            Ok(Arc::new(session) as Arc<dyn BrokerSession>)
        })
    }
}

pub struct RabbitMqSession {
    environment: Environment,
    amqp: Connection,
    closed: AtomicBool,
}

impl RabbitMqSession {
    async fn open(config: &ConnectionConfig) -> Result<Self, BrokerError> {
        tracing::debug!(port = config.stream_port, "opening stream environment");
        let mut builder = Environment::builder()
            .host(&config.host)
            .port(config.stream_port)
            .virtual_host(&config.vhost)
            .username(&config.username)
            .password(&config.password)
            .heartbeat(u32::try_from(config.heartbeat.as_secs()).unwrap_or(u32::MAX))
            .load_balancer_mode(config.load_balancer_mode);
        if config.tls {
            builder = builder.tls(TlsConfiguration::builder().enable(true).build());
        }
        let environment = builder
            .build()
            .await
            .map_err(|e| BrokerError::new("open stream environment", e))?;

        tracing::debug!(port = config.amqp_port, "opening amqp connection");
        let amqp = Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::new("open amqp connection", e))?;

        Ok(Self {
            environment,
            amqp,
            closed: AtomicBool::new(false),
        })
    }

    async fn channel(&self, context: &str) -> Result<Channel, BrokerError> {
        self.amqp
            .create_channel()
            .await
            .map_err(|e| BrokerError::new(context, e))
    }

    async fn release(channel: Channel) {
        if let Err(e) = channel.close(REPLY_SUCCESS, "OK").await {
            tracing::debug!(error = %e, "error closing amqp channel");
        }
    }
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

impl BrokerSession for RabbitMqSession {
    /// Reflects the AMQP control-plane connection only. The stream
    /// `Environment` keeps no connection of its own between calls and has
    /// no closed state to read; a dead data plane surfaces as a failed
    /// subscribe or as the end of the delivery stream.
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.amqp.status().connected()
    }

    fn declare_stream<'a>(&'a self, stream: &'a StreamDescriptor) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let mut creator = self.environment.stream_creator();
            if let Some(age) = stream.max_age {
                creator = creator.max_age(age);
            }
            if let Some(bytes) = stream.max_length_bytes {
                creator = creator.max_length(ByteCapacity::B(bytes));
            }
            if let Some(bytes) = stream.max_segment_bytes {
                creator = creator.max_segment_size(ByteCapacity::B(bytes));
            }

            match creator.create(&stream.name).await {
                Ok(()) => Ok(()),
                Err(StreamCreateError::Create {
                    status: ResponseCode::StreamAlreadyExists,
                    ..
                }) => {
                    tracing::debug!(stream = %stream.name, "stream already exists");
                    Ok(())
                }
                Err(e) => Err(BrokerError::new(format!("declare stream {}", stream.name), e)),
            }
        })
    }

    fn delete_stream<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            self.environment
                .delete_stream(name)
                .await
                .map_err(|e| BrokerError::new(format!("delete stream {name}"), e))
        })
    }

    fn declare_exchange<'a>(&'a self, exchange: &'a ExchangeOptions) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let context = format!("declare exchange {}", exchange.name);
            let channel = self.channel(&context).await?;
            let options = ExchangeDeclareOptions {
                passive: false,
                durable: exchange.durable,
                auto_delete: exchange.auto_deleted,
                internal: exchange.internal,
                nowait: exchange.no_wait,
            };
            let result = channel
                .exchange_declare(&exchange.name, exchange_kind(&exchange.kind), options, FieldTable::default())
                .await
                .map_err(|e| BrokerError::new(context, e));
            Self::release(channel).await;
            result
        })
    }

    fn delete_exchange<'a>(&'a self, exchange: &'a ExchangeOptions) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let context = format!("delete exchange {}", exchange.name);
            let channel = self.channel(&context).await?;
            let options = ExchangeDeleteOptions {
                if_unused: exchange.dispose_if_unused,
                nowait: exchange.no_wait,
            };
            let result = channel
                .exchange_delete(&exchange.name, options)
                .await
                .map_err(|e| BrokerError::new(context, e));
            Self::release(channel).await;
            result
        })
    }

    fn bind<'a>(&'a self, binding: &'a BindingOptions) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let context = format!(
                "bind {} -> {} {}",
                binding.sender_name,
                binding.receiver_kind(),
                binding.receiver_name,
            );
            let channel = self.channel(&context).await?;
            let result = if binding.is_queue_binding {
                channel
                    .queue_bind(
                        &binding.receiver_name,
                        &binding.sender_name,
                        &binding.routing_key,
                        QueueBindOptions { nowait: binding.no_wait },
                        FieldTable::default(),
                    )
                    .await
            } else {
                channel
                    .exchange_bind(
                        &binding.receiver_name,
                        &binding.sender_name,
                        &binding.routing_key,
                        ExchangeBindOptions { nowait: binding.no_wait },
                        FieldTable::default(),
                    )
                    .await
            };
            Self::release(channel).await;
            result.map_err(|e| BrokerError::new(context, e))
        })
    }

    fn unbind<'a>(&'a self, binding: &'a BindingOptions) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let context = format!(
                "unbind {} -> {} {}",
                binding.sender_name,
                binding.receiver_kind(),
                binding.receiver_name,
            );
            let channel = self.channel(&context).await?;
            let result = if binding.is_queue_binding {
                channel
                    .queue_unbind(
                        &binding.receiver_name,
                        &binding.sender_name,
                        &binding.routing_key,
                        FieldTable::default(),
                    )
                    .await
            } else {
                channel
                    .exchange_unbind(
                        &binding.receiver_name,
                        &binding.sender_name,
                        &binding.routing_key,
                        ExchangeUnbindOptions { nowait: binding.no_wait },
                        FieldTable::default(),
                    )
                    .await
            };
            Self::release(channel).await;
            result.map_err(|e| BrokerError::new(context, e))
        })
    }

    fn subscribe<'a>(&'a self, stream: &'a StreamDescriptor) -> BoxFuture<'a, Result<Subscription, BrokerError>> {
        Box::pin(async move {
            if stream.crc {
                tracing::debug!("chunk crc checks are always performed by the stream client");
            }
            let offset = match stream.offset {
                OffsetPolicy::FromStart => OffsetSpecification::First,
                OffsetPolicy::FromLatest => OffsetSpecification::Last,
            };
            let consumer = self
                .environment
                .consumer()
                .name(&stream.consumer_name)
                .offset(offset)
                .build(&stream.name)
                .await
                .map_err(|e| BrokerError::new(format!("subscribe {}", stream.name), e))?;

            let handle = consumer.handle();
            let deliveries = consumer.map(|delivery| match delivery {
                Ok(delivery) => Ok(delivery.message().data().map(<[u8]>::to_vec).unwrap_or_default()),
                Err(e) => Err(BrokerError::new("delivery", e)),
            });

            Ok(Subscription {
                deliveries: Box::pin(deliveries),
                handle: Box::new(RabbitMqSubscription { handle }),
            })
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.amqp
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(|e| BrokerError::new("close amqp connection", e))
        })
    }
}

struct RabbitMqSubscription {
    handle: ConsumerHandle,
}

impl SubscriptionHandle for RabbitMqSubscription {
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), BrokerError>> {
        Box::pin(async move {
            self.handle
                .close()
                .await
                .map_err(|e| BrokerError::new("close consumer", e))
        })
    }
}
