mod query;
mod error;
mod frame;
mod data_service;
mod stream_service;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use grafana_plugin_sdk::backend::{self, async_trait};
use grafana_plugin_sdk::prelude::*;
use stream_bridge::{Broker, BridgeConfig, ConnectionSupervisor, RabbitMqBroker};
use tokio::sync::Mutex;

use error::InstanceError;

type InstanceSettings = backend::DataSourceInstanceSettings<serde_json::Value, serde_json::Value>;

// ═══════════════════════════════════════════════════════════════
//  Plugin struct
// ═══════════════════════════════════════════════════════════════

#[derive(Clone, Debug, GrafanaPlugin)]
#[grafana_plugin(plugin_type = "datasource")]
pub struct RabbitMqPlugin {
    instances: Arc<Instances>,
}

impl RabbitMqPlugin {
    pub fn new() -> Self {
        Self {
            instances: Arc::new(Instances::new(Arc::new(RabbitMqBroker))),
        }
    }

    async fn supervisor(
        &self,
        settings: Option<&InstanceSettings>,
    ) -> Result<Arc<ConnectionSupervisor>, InstanceError> {
        let settings = settings.ok_or(InstanceError::MissingSettings)?;
        self.instances.get(InstanceRequest::from_settings(settings)).await
    }
}

// ═══════════════════════════════════════════════════════════════
//  Instances — one supervisor per datasource
// ═══════════════════════════════════════════════════════════════

/// The parts of Grafana's instance settings a supervisor is built from.
#[derive(Clone, Copy)]
pub(crate) struct InstanceRequest<'a> {
    pub uid: &'a str,
    pub updated: DateTime<Utc>,
    pub json_data: &'a serde_json::Value,
    pub password: Option<&'a str>,
}

impl<'a> InstanceRequest<'a> {
    fn from_settings(settings: &'a InstanceSettings) -> Self {
        Self {
            uid: &settings.uid,
            updated: settings.updated,
            json_data: &settings.json_data,
            password: settings
                .decrypted_secure_json_data
                .get("password")
                .and_then(serde_json::Value::as_str),
        }
    }
}

struct Instance {
    updated: DateTime<Utc>,
    supervisor: Arc<ConnectionSupervisor>,
}

/// Supervisors keyed by datasource UID. An entry is rebuilt when Grafana
/// reports newer settings; the replaced supervisor is disposed.
///
/// The map lock is never held across broker I/O: a slow broker behind one
/// datasource does not stall the others.
pub(crate) struct Instances {
    broker: Arc<dyn Broker>,
    by_uid: Mutex<HashMap<String, Instance>>,
}

impl Instances {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            by_uid: Mutex::new(HashMap::new()),
        }
    }

    /// Cached supervisor for these settings, connecting a fresh one if the
    /// datasource is new or its settings changed.
    pub async fn get(&self, request: InstanceRequest<'_>) -> Result<Arc<ConnectionSupervisor>, InstanceError> {
        let stale = {
            let mut by_uid = self.by_uid.lock().await;
            if let Some(cached) = current(&by_uid, request) {
                return Ok(cached);
            }
            by_uid.remove(request.uid)
        };
        if let Some(stale) = stale {
            tracing::info!(uid = %request.uid, "datasource settings changed, disposing old instance");
            stale.supervisor.dispose().await;
        }

        let config = BridgeConfig::from_settings(request.json_data, request.password)?;
        tracing::debug!(uid = %request.uid, "creating RabbitMQ instance");
        let supervisor = Arc::new(ConnectionSupervisor::new(self.broker.clone(), config));
        supervisor.connect().await?;
        tracing::debug!(uid = %request.uid, instance = %supervisor, "connected to RabbitMQ");

        let (winner, replaced) = {
            let mut by_uid = self.by_uid.lock().await;
            match current(&by_uid, request) {
                Some(cached) => (cached, Some(supervisor)),
                None => {
                    let previous = by_uid.insert(
                        request.uid.to_string(),
                        Instance {
                            updated: request.updated,
                            supervisor: supervisor.clone(),
                        },
                    );
                    (supervisor, previous.map(|p| p.supervisor))
                }
            }
        };
        if let Some(replaced) = replaced {
            tracing::debug!(uid = %request.uid, "discarding concurrently built instance");
            replaced.dispose().await;
        }
        Ok(winner)
    }
}

/// Cached supervisor built from exactly these settings.
fn current(by_uid: &HashMap<String, Instance>, request: InstanceRequest<'_>) -> Option<Arc<ConnectionSupervisor>> {
    by_uid
        .get(request.uid)
        .filter(|instance| instance.updated == request.updated)
        .map(|instance| instance.supervisor.clone())
}

impl fmt::Debug for Instances {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instances").finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════
//  DiagnosticsService
// ═══════════════════════════════════════════════════════════════

#[async_trait]
impl backend::DiagnosticsService for RabbitMqPlugin {
    type CheckHealthError = std::convert::Infallible;
    type CollectMetricsError = std::convert::Infallible;

    async fn check_health(
        &self,
        request: backend::CheckHealthRequest<Self>,
    ) -> Result<backend::CheckHealthResponse, Self::CheckHealthError> {
        let supervisor = self
            .supervisor(request.plugin_context.instance_settings.as_ref())
            .await;
        Ok(match health_status(supervisor.as_deref()) {
            Ok(message) => backend::CheckHealthResponse::ok(message),
            Err(message) => backend::CheckHealthResponse::error(message),
        })
    }

    async fn collect_metrics(
        &self,
        _request: backend::CollectMetricsRequest<Self>,
    ) -> Result<backend::CollectMetricsResponse, Self::CollectMetricsError> {
        Ok(backend::CollectMetricsResponse::new(None))
    }
}

/// Health message for a datasource: `Ok` when the broker session is open.
fn health_status(supervisor: Result<&ConnectionSupervisor, &InstanceError>) -> Result<String, String> {
    match supervisor {
        Ok(sv) if sv.is_connected() => Ok("RabbitMQ Connected".to_string()),
        Ok(_) => Err("RabbitMQ Disconnected".to_string()),
        Err(e) => Err(format!("RabbitMQ Disconnected: {e}")),
    }
}
