use std::sync::Arc;

use grafana_plugin_sdk::backend::{self, async_trait};
use stream_bridge::{ChannelSink, Framer, IngestExit, IngestionLoop};
use tokio_util::sync::CancellationToken;

use super::error::StreamError;
use super::frame::table_to_frame;
use super::query::encoding_from_path;
use super::RabbitMqPlugin;

// ═══════════════════════════════════════════════════════════════
//  StreamService — real-time streaming via Grafana Live
// ═══════════════════════════════════════════════════════════════

#[async_trait]
impl backend::StreamService for RabbitMqPlugin {
    type JsonValue = ();
    type Error = StreamError;
    type Stream = backend::BoxRunStream<Self::Error>;

    async fn subscribe_stream(
        &self,
        request: backend::SubscribeStreamRequest<Self>,
    ) -> Result<backend::SubscribeStreamResponse, Self::Error> {
        tracing::info!(path = %request.path.as_str(), "subscribe stream");
        Ok(backend::SubscribeStreamResponse::ok(None))
    }

    /// Spawn an ingestion loop for the channel and forward its rows as
    /// frames. Dropping the returned stream cancels the loop, which then
    /// disposes the connection.
    async fn run_stream(
        &self,
        request: backend::RunStreamRequest<Self>,
    ) -> Result<Self::Stream, Self::Error> {
        let path = request.path.as_str().to_string();
        let supervisor = self
            .supervisor(request.plugin_context.instance_settings.as_ref())
            .await?;
        tracing::info!(%path, instance = %supervisor, "run stream");

        let config = supervisor.config();
        let framer = Framer::new(config.flatten.clone()).with_encoding(encoding_from_path(&path));
        let (sink, mut rows) = ChannelSink::channel(config.delivery_buffer, config.overflow);

        let token = CancellationToken::new();
        let ingestion = IngestionLoop::new(supervisor.clone(), framer, Arc::new(sink), token.clone());
        tokio::spawn(async move {
            match ingestion.run().await {
                Ok(IngestExit::AlreadyConsuming) => {
                    tracing::info!(%path, "stream already consumed by another subscriber");
                }
                Ok(exit) => tracing::info!(%path, ?exit, "ingestion stopped"),
                Err(e) => tracing::error!(%path, error = %e, "ingestion failed to connect"),
            }
        });

        let guard = token.drop_guard();
        Ok(Box::pin(async_stream::try_stream! {
            let _guard = guard;
            while let Some(table) = rows.recv().await {
                let frame = table_to_frame(&table)
                    .check()
                    .map_err(|e| StreamError::Frame(e.to_string()))?;
                let packet = backend::StreamPacket::from_frame(frame)
                    .map_err(|e| StreamError::Frame(e.to_string()))?;
                yield packet;
            }
        }))
    }

    async fn publish_stream(
        &self,
        _request: backend::PublishStreamRequest<Self>,
    ) -> Result<backend::PublishStreamResponse, Self::Error> {
        Ok(backend::PublishStreamResponse::permission_denied(
            serde_json::Value::Null,
        ))
    }
}
