use futures::stream::FuturesOrdered;
use grafana_plugin_sdk::backend::{self, async_trait, BoxDataResponseStream, DataResponse};
use grafana_plugin_sdk::data::Frame;
use grafana_plugin_sdk::live;
use stream_bridge::framer::FRAME_NAME;

use super::error::QueryError;
use super::query::{RabbitMqQuery, channel_path};
use super::RabbitMqPlugin;

// ═══════════════════════════════════════════════════════════════
//  DataService
// ═══════════════════════════════════════════════════════════════

#[async_trait]
impl backend::DataService for RabbitMqPlugin {
    type Query = RabbitMqQuery;
    type QueryError = QueryError;
    type Stream = BoxDataResponseStream<Self::QueryError>;

    /// Every query answers with an empty frame bound to the datasource's
    /// live channel; rows arrive through `run_stream`.
    async fn query_data(
        &self,
        request: backend::QueryDataRequest<Self::Query, Self>,
    ) -> Self::Stream {
        let settings = request.plugin_context.instance_settings.as_ref();
        let ds_uid = settings.map(|s| s.uid.clone()).unwrap_or_default();
        let supervisor = self.supervisor(settings).await;
        let stream_name = supervisor.map(|sv| sv.config().stream.name.clone());

        Box::pin(
            request
                .queries
                .into_iter()
                .map(|q| {
                    let ds_uid = ds_uid.clone();
                    let stream_name = stream_name
                        .as_ref()
                        .map(Clone::clone)
                        .map_err(|e| e.to_string());
                    async move {
                        let stream_name = stream_name.map_err(|message| QueryError {
                            ref_id: q.ref_id.clone(),
                            message,
                        })?;
                        handle_stream_query(&ds_uid, &stream_name, &q)
                    }
                })
                .collect::<FuturesOrdered<_>>(),
        )
    }
}

// ═══════════════════════════════════════════════════════════════
//  Streaming query handler — returns frame with channel metadata
// ═══════════════════════════════════════════════════════════════

fn handle_stream_query(
    ds_uid: &str,
    stream_name: &str,
    query: &backend::DataQuery<RabbitMqQuery>,
) -> Result<DataResponse, QueryError> {
    let ref_id = query.ref_id.clone();
    let path_str = channel_path(stream_name, query.query.encoding());
    tracing::debug!(%ref_id, path = %path_str, "binding query to live channel");

    let namespace = live::Namespace::new(ds_uid.to_string()).map_err(|e| QueryError {
        ref_id: ref_id.clone(),
        message: format!("invalid channel namespace: {e}"),
    })?;
    let path = live::Path::new(path_str).map_err(|e| QueryError {
        ref_id: ref_id.clone(),
        message: format!("invalid channel path: {e}"),
    })?;
    let channel = live::Channel::new(live::Scope::Datasource, namespace, path);

    let mut frame = Frame::new(FRAME_NAME);
    frame.set_channel(channel);

    let checked = frame.check().map_err(|e| QueryError {
        ref_id: ref_id.clone(),
        message: format!("frame error: {e}"),
    })?;

    Ok(DataResponse::new(ref_id, vec![checked]))
}
