//! OPC-UA node provider (§4.5 "OPC-UA node provider").
//!
//! One monitored node maps to exactly one characteristic (no topic fan-out
//! the way MQTT has it). Only `on_change` and `on_timer` trigger strategies
//! are supported — `on_trigger` sources are refused at startup with a
//! warning, since OPC-UA has no analogue to an MQTT trigger topic.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use opcua::client::prelude::{
    Client, ClientBuilder, DataChangeCallback, IdentityToken, MonitoredItemService, SubscriptionService,
};
use opcua::types::{MonitoredItemCreateRequest, NodeId, TimestampsToReturn, Variant};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::buffer::{DispatchOutcome, SharedBufferManager, TagConfig};
use crate::crypto::CredentialCipher;
use crate::db::models::{DataSourceSpec, OpcUaServer, TriggerStrategy};
use crate::db::repositories::{DataSourceRepository, OpcUaServerRepository};
use crate::providers::{Error, Result, SampleCallback, SampleContext, SampleEvent, SourceKind};

/// Default subscription publishing interval, used when neither the data
/// source nor the server row override it.
const DEFAULT_SAMPLING_INTERVAL_MS: f64 = 1000.0;
const DEFAULT_QUEUE_SIZE: u32 = 1;

struct NodeRoute {
    characteristic_id: i64,
}

/// Subscribes to every active OPC-UA data source's node and feeds data
/// changes into the shared buffer manager (§4.5).
pub struct OpcUaProvider<D, S> {
    data_sources: Arc<D>,
    servers: Arc<S>,
    cipher: CredentialCipher,
    buffers: SharedBufferManager,
    callback: Arc<dyn SampleCallback>,
    node_routes: DashMap<String, NodeRoute>,
    client: AsyncMutex<Client>,
    /// Bridges the OPC-UA SDK's synchronous subscription callback (invoked
    /// on the SDK's own I/O thread) into the async world: the callback sends
    /// `(node_id, value)` pairs here, and a task spawned in [`Self::start`]
    /// drains them through [`Self::on_data_change`].
    node_value_tx: mpsc::UnboundedSender<(String, Option<f64>)>,
    node_value_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<(String, Option<f64>)>>>,
}

impl<D, S> OpcUaProvider<D, S>
where
    D: DataSourceRepository + 'static,
    S: OpcUaServerRepository + 'static,
{
    pub fn new(
        data_sources: Arc<D>,
        servers: Arc<S>,
        cipher: CredentialCipher,
        buffers: SharedBufferManager,
        callback: Arc<dyn SampleCallback>,
    ) -> Self {
        let client = ClientBuilder::new()
            .application_name("openspc")
            .application_uri("urn:openspc:client")
            .trust_server_certs(false)
            .client()
            .expect("opcua client configuration is static and always valid");

        let (node_value_tx, node_value_rx) = mpsc::unbounded_channel();

        OpcUaProvider {
            data_sources,
            servers,
            cipher,
            buffers,
            callback,
            node_routes: DashMap::new(),
            client: AsyncMutex::new(client),
            node_value_tx,
            node_value_rx: AsyncMutex::new(Some(node_value_rx)),
        }
    }

    /// Loads active OPC-UA sources grouped by server, connects one session
    /// per server, and creates a monitored item per node (§4.5). Spawns the
    /// task that drains decoded data changes into the buffer manager.
    pub async fn start(self: &Arc<Self>, buffer_timeout: Duration) -> Result<()> {
        if let Some(mut rx) = self.node_value_rx.lock().await.take() {
            let provider = Arc::clone(self);
            tokio::spawn(async move {
                while let Some((node_id, value)) = rx.recv().await {
                    provider.on_data_change(&node_id, value).await;
                }
            });
        }

        let sources = self.data_sources.list_active_opcua().await?;
        let mut by_server: HashMap<i64, Vec<_>> = HashMap::new();
        for (data_source, characteristic) in sources {
            let DataSourceSpec::OpcUa { server_id, .. } = &data_source.spec else {
                continue;
            };
            if data_source.trigger_strategy == TriggerStrategy::OnTrigger {
                warn!(
                    characteristic_id = characteristic.id,
                    "opcua_on_trigger_not_supported, skipping data source"
                );
                continue;
            }
            by_server.entry(*server_id).or_default().push((data_source, characteristic));
        }

        for (server_id, entries) in by_server {
            let server = self
                .servers
                .get(server_id)
                .await?
                .ok_or_else(|| Error::OpcUaUnavailable(format!("server {server_id} not found")))?;

            for (data_source, characteristic) in &entries {
                let DataSourceSpec::OpcUa {
                    node_id,
                    sampling_interval_ms,
                    ..
                } = &data_source.spec
                else {
                    continue;
                };
                self.buffers
                    .register(TagConfig {
                        characteristic_id: characteristic.id,
                        subgroup_size: characteristic.subgroup_size as usize,
                        trigger_strategy: data_source.trigger_strategy,
                        trigger_tag: None,
                        metric_name: None,
                        buffer_timeout,
                    })
                    .await;
                self.node_routes.insert(
                    node_id.clone(),
                    NodeRoute {
                        characteristic_id: characteristic.id,
                    },
                );
            }

            if let Err(e) = self.connect_and_subscribe(&server, &entries).await {
                error!(server_id, error = %e, "opcua_server_connect_failed");
            }
        }

        info!(nodes = self.node_routes.len(), "opcua_provider_started");
        Ok(())
    }

    async fn connect_and_subscribe(
        &self,
        server: &OpcUaServer,
        entries: &[(crate::db::models::DataSource, crate::db::models::Characteristic)],
    ) -> Result<()> {
        let identity = match (&server.username, &server.password_ciphertext) {
            (Some(username), Some(ciphertext)) => {
                let password = self
                    .cipher
                    .decrypt(ciphertext)
                    .map_err(|e| Error::OpcUaUnavailable(format!("credential decrypt failed: {e}")))?;
                IdentityToken::UserName(username.clone(), password)
            }
            _ => IdentityToken::Anonymous,
        };

        let mut client = self.client.lock().await;
        let session = client
            .connect_to_endpoint_id_with_identity(server.endpoint_url.as_str(), identity)
            .map_err(|e| Error::OpcUaUnavailable(format!("{e:?}")))?;

        let tx = self.node_value_tx.clone();
        let subscription_id = {
            let mut session = session.write();
            session
                .create_subscription(
                    DEFAULT_SAMPLING_INTERVAL_MS,
                    10,
                    30,
                    DEFAULT_QUEUE_SIZE,
                    0,
                    true,
                    DataChangeCallback::new(move |changed_items| {
                        for item in changed_items {
                            let node_id = item.item_to_monitor().node_id.to_string();
                            let value = extract_numeric_data_value(item.last_value());
                            let _ = tx.send((node_id, value));
                        }
                    }),
                )
                .map_err(|e| Error::OpcUaUnavailable(format!("create_subscription failed: {e:?}")))?
        };

        let items: Vec<MonitoredItemCreateRequest> = entries
            .iter()
            .filter_map(|(data_source, characteristic)| {
                let DataSourceSpec::OpcUa {
                    node_id,
                    sampling_interval_ms,
                    ..
                } = &data_source.spec
                else {
                    return None;
                };
                let interval = sampling_interval_ms
                    .or(Some(server.default_sampling_interval_ms))
                    .map(|ms| ms as f64)
                    .unwrap_or(DEFAULT_SAMPLING_INTERVAL_MS);
                let node = NodeId::from_str(node_id.as_str()).ok()?;
                debug!(characteristic_id = characteristic.id, node_id, interval, "subscribing_to_opcua_node");
                Some(MonitoredItemCreateRequest::new(
                    node.into(),
                    TimestampsToReturn::Source,
                    interval,
                ))
            })
            .collect();

        {
            let mut session = session.write();
            session
                .create_monitored_items(subscription_id, TimestampsToReturn::Source, &items)
                .map_err(|e| Error::OpcUaUnavailable(format!("create_monitored_items failed: {e:?}")))?;
        }

        Ok(())
    }

    /// Routes a decoded OPC-UA value to its characteristic's buffer (§4.5).
    /// Callers extract the numeric value from the server's `DataValue` via
    /// [`extract_numeric`] before calling this.
    pub async fn on_data_change(&self, node_id: &str, value: Option<f64>) {
        let Some(route) = self.node_routes.get(node_id) else {
            warn!(node_id, "unmapped_opcua_node");
            return;
        };
        let characteristic_id = route.characteristic_id;
        drop(route);

        let Some(value) = value else {
            debug!(node_id, characteristic_id, "opcua_non_numeric_or_null_value");
            return;
        };

        let now = Utc::now();
        match self.buffers.dispatch(characteristic_id, value, now).await {
            Some(DispatchOutcome::Flushed(flush)) => {
                let event = SampleEvent {
                    characteristic_id,
                    measurements: flush.values,
                    timestamp: now,
                    context: SampleContext {
                        source: Some(SourceKind::OpcUa),
                        ..Default::default()
                    },
                };
                if let Err(e) = self.callback.on_sample(event).await {
                    error!(characteristic_id, error = %e, "opcua_sample_callback_failed");
                }
            }
            Some(DispatchOutcome::Buffered) => {}
            None => warn!(characteristic_id, "opcua_value_for_unregistered_characteristic"),
        }
    }

    /// Flushes every `on_timer` buffer (and any aged-out partial `on_change`
    /// buffer) bound to this provider's nodes. Intended to be driven by a
    /// periodic sweep task started alongside the subscription (§4.4).
    pub async fn sweep_timeouts(&self) {
        let now = Utc::now();
        for (characteristic_id, flushed) in self.buffers.sweep_timeouts(now).await {
            let event = SampleEvent {
                characteristic_id,
                measurements: flushed.values,
                timestamp: now,
                context: SampleContext {
                    source: Some(SourceKind::OpcUa),
                    ..Default::default()
                },
            };
            if let Err(e) = self.callback.on_sample(event).await {
                error!(characteristic_id, error = %e, "opcua_sample_callback_failed");
            }
        }
    }
}

/// Extracts a numeric reading from a monitored item's latest `DataValue`,
/// or `None` if the server reported a null or non-numeric value.
fn extract_numeric_data_value(data_value: &opcua::types::DataValue) -> Option<f64> {
    data_value.value.as_ref().and_then(extract_numeric)
}

/// Extracts a numeric reading from an OPC-UA `Variant`, matching the
/// original provider's type coercion: bool is excluded even though it is
/// integer-representable, and only numeric scalar variants pass through.
pub fn extract_numeric(value: &Variant) -> Option<f64> {
    match value {
        Variant::Boolean(_) | Variant::String(_) => None,
        Variant::SByte(v) => Some(*v as f64),
        Variant::Byte(v) => Some(*v as f64),
        Variant::Int16(v) => Some(*v as f64),
        Variant::UInt16(v) => Some(*v as f64),
        Variant::Int32(v) => Some(*v as f64),
        Variant::UInt32(v) => Some(*v as f64),
        Variant::Int64(v) => Some(*v as f64),
        Variant::UInt64(v) => Some(*v as f64),
        Variant::Float(v) => Some(*v as f64),
        Variant::Double(v) => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_numeric_variants() {
        assert_eq!(extract_numeric(&Variant::Double(3.5)), Some(3.5));
        assert_eq!(extract_numeric(&Variant::Int32(42)), Some(42.0));
        assert_eq!(extract_numeric(&Variant::UInt16(7)), Some(7.0));
    }

    #[test]
    fn rejects_boolean_even_though_it_is_integer_representable() {
        assert_eq!(extract_numeric(&Variant::Boolean(true)), None);
    }

    #[test]
    fn rejects_string_values() {
        assert_eq!(extract_numeric(&Variant::from("not numeric")), None);
    }
}
