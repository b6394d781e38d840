//! MQTT tag provider (§4.5 "MQTT tag provider").
//!
//! On start, loads every active MQTT data source, groups them by broker,
//! subscribes to each distinct topic and trigger tag exactly once per broker
//! connection, and dispatches incoming messages through the shared
//! [`BufferManager`]. Sparkplug-B topics (`spBv1.0/` prefix) are decoded into
//! named metrics; plain topics are parsed as a single ASCII float.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::buffer::{DispatchOutcome, SharedBufferManager, TagConfig};
use crate::crypto::CredentialCipher;
use crate::db::models::DataSourceSpec;
use crate::db::repositories::{BrokerRepository, DataSourceRepository};
use crate::providers::sparkplug;
use crate::providers::{Error, Result, SampleCallback, SampleContext, SampleEvent, SourceKind};

const SPARKPLUG_PREFIX: &str = "spBv1.0/";
const EVENT_LOOP_CAPACITY: usize = 64;

/// Per-characteristic routing info the event loop needs beyond what
/// [`BufferManager`] already tracks (§4.5).
struct CharRoute {
    metric_name: Option<String>,
}

/// Subscribes to every active MQTT data source across however many distinct
/// brokers they reference, and feeds readings into the shared buffer manager.
pub struct MqttTagProvider<D, B> {
    data_sources: Arc<D>,
    brokers: Arc<B>,
    cipher: CredentialCipher,
    buffers: SharedBufferManager,
    callback: Arc<dyn SampleCallback>,
    topic_to_chars: DashMap<String, Vec<i64>>,
    trigger_topics: DashMap<String, ()>,
    char_routes: DashMap<i64, CharRoute>,
    shutdown: Arc<Notify>,
}

impl<D, B> MqttTagProvider<D, B>
where
    D: DataSourceRepository + 'static,
    B: BrokerRepository + 'static,
{
    pub fn new(
        data_sources: Arc<D>,
        brokers: Arc<B>,
        cipher: CredentialCipher,
        buffers: SharedBufferManager,
        callback: Arc<dyn SampleCallback>,
    ) -> Self {
        MqttTagProvider {
            data_sources,
            brokers,
            cipher,
            buffers,
            callback,
            topic_to_chars: DashMap::new(),
            trigger_topics: DashMap::new(),
            char_routes: DashMap::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Loads active MQTT sources, groups them by broker, and spawns one
    /// connection task per broker (§4.5).
    pub async fn start(self: &Arc<Self>, buffer_timeout: Duration) -> Result<()> {
        let sources = self.data_sources.list_active_mqtt().await?;
        let mut by_broker: HashMap<i64, Vec<_>> = HashMap::new();
        for (data_source, characteristic) in sources {
            let DataSourceSpec::Mqtt { broker_id, .. } = &data_source.spec else {
                continue;
            };
            by_broker.entry(*broker_id).or_default().push((data_source, characteristic));
        }

        for (broker_id, entries) in by_broker {
            let broker = self
                .brokers
                .get(broker_id)
                .await?
                .ok_or_else(|| Error::MqttUnavailable(format!("broker {broker_id} not found")))?;

            for (data_source, characteristic) in &entries {
                let DataSourceSpec::Mqtt {
                    topic,
                    metric_name,
                    trigger_tag,
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
                        trigger_tag: trigger_tag.clone(),
                        metric_name: metric_name.clone(),
                        buffer_timeout,
                    })
                    .await;
                self.char_routes.insert(
                    characteristic.id,
                    CharRoute {
                        metric_name: metric_name.clone(),
                    },
                );
                self.topic_to_chars.entry(topic.clone()).or_default().push(characteristic.id);
                if let Some(tag) = trigger_tag {
                    self.trigger_topics.insert(tag.clone(), ());
                }
            }

            let provider = Arc::clone(self);
            tokio::spawn(async move {
                provider.run_broker_connection(broker, entries).await;
            });
        }

        info!(characteristics = self.char_routes.len(), "mqtt_tag_provider_started");
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    async fn run_broker_connection(
        self: Arc<Self>,
        broker: crate::db::models::Broker,
        entries: Vec<(crate::db::models::DataSource, crate::db::models::Characteristic)>,
    ) {
        let mut options = MqttOptions::new(format!("openspc-tag-{}", broker.id), broker.host.clone(), broker.port);
        options.set_keep_alive(Duration::from_secs(broker.keepalive_seconds as u64));
        if let (Some(username), Some(ciphertext)) = (&broker.username, &broker.password_ciphertext) {
            match self.cipher.decrypt(ciphertext) {
                Ok(password) => {
                    options.set_credentials(username.clone(), password);
                }
                Err(e) => {
                    error!(broker_id = broker.id, error = %e, "broker_credential_decrypt_failed");
                    return;
                }
            }
        }

        let (client, mut event_loop) = AsyncClient::new(options, EVENT_LOOP_CAPACITY);

        let mut topics: Vec<String> = Vec::new();
        let mut trigger_topics: Vec<String> = Vec::new();
        for (data_source, _) in &entries {
            if let DataSourceSpec::Mqtt { topic, trigger_tag, .. } = &data_source.spec {
                if !topics.contains(topic) {
                    topics.push(topic.clone());
                }
                if let Some(tag) = trigger_tag {
                    if !trigger_topics.contains(tag) {
                        trigger_topics.push(tag.clone());
                    }
                }
            }
        }
        for topic in topics.iter().chain(trigger_topics.iter()) {
            if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                error!(broker_id = broker.id, topic, error = %e, "mqtt_subscribe_failed");
            } else {
                info!(broker_id = broker.id, topic, "subscribed_to_topic");
            }
        }

        let max_delay = Duration::from_secs(broker.max_reconnect_delay_seconds.max(1));
        let mut backoff = Duration::from_secs(1);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(broker_id = broker.id, "mqtt_tag_provider_stopping");
                    return;
                }
                event = event_loop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            backoff = Duration::from_secs(1);
                            self.handle_message(&publish.topic, &publish.payload).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(broker_id = broker.id, error = %e, delay_secs = backoff.as_secs(), "mqtt_connection_error_backing_off");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(max_delay);
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(&self, topic: &str, payload: &[u8]) {
        if self.trigger_topics.contains_key(topic) {
            self.handle_trigger(topic).await;
        }

        let Some(char_ids) = self.topic_to_chars.get(topic).map(|v| v.clone()) else {
            if !self.trigger_topics.contains_key(topic) {
                debug!(topic, "unmapped_mqtt_topic");
            }
            return;
        };

        if topic.starts_with(SPARKPLUG_PREFIX) {
            self.handle_sparkplug_message(topic, payload, &char_ids).await;
        } else {
            self.handle_plain_message(topic, payload, &char_ids).await;
        }
    }

    async fn handle_sparkplug_message(&self, topic: &str, payload: &[u8], char_ids: &[i64]) {
        let metrics = match sparkplug::decode_metrics(payload) {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(topic, error = %e, "sparkplug_decode_failed");
                return;
            }
        };

        for &char_id in char_ids {
            let Some(route) = self.char_routes.get(&char_id) else { continue };
            let Some(metric_name) = route.metric_name.as_deref() else {
                debug!(char_id, topic, "no_metric_name_configured");
                continue;
            };
            let Some(&value) = metrics.get(metric_name) else { continue };
            self.dispatch_value(char_id, value).await;
        }
    }

    async fn handle_plain_message(&self, topic: &str, payload: &[u8], char_ids: &[i64]) {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text.trim(),
            Err(e) => {
                warn!(topic, error = %e, "mqtt_payload_not_utf8");
                return;
            }
        };
        let value: f64 = match text.parse() {
            Ok(value) => value,
            Err(e) => {
                warn!(topic, payload = text, error = %e, "mqtt_payload_parse_failed");
                return;
            }
        };
        for &char_id in char_ids {
            self.dispatch_value(char_id, value).await;
        }
    }

    async fn dispatch_value(&self, characteristic_id: i64, value: f64) {
        let now = Utc::now();
        match self.buffers.dispatch(characteristic_id, value, now).await {
            Some(DispatchOutcome::Flushed(flush)) => {
                self.emit(characteristic_id, flush.values, now).await;
            }
            Some(DispatchOutcome::Buffered) => {}
            None => warn!(characteristic_id, "mqtt_value_for_unregistered_characteristic"),
        }
    }

    /// Handles a trigger-tag publish: flushes every `on_trigger` buffer bound
    /// to that tag (§4.4 "on_trigger: flush B; reset B").
    pub async fn handle_trigger(&self, topic: &str) {
        for (char_id, flushed) in self.buffers.trigger(topic).await {
            self.emit(char_id, flushed.values, Utc::now()).await;
        }
    }

    /// Flushes every `on_timer` buffer (and any aged-out partial `on_change`
    /// buffer) bound to this provider's sources. Intended to be driven by a
    /// periodic sweep task started alongside the broker connections (§4.4).
    pub async fn sweep_timeouts(&self) {
        let now = Utc::now();
        for (char_id, flushed) in self.buffers.sweep_timeouts(now).await {
            self.emit(char_id, flushed.values, now).await;
        }
    }

    async fn emit(&self, characteristic_id: i64, measurements: Vec<f64>, timestamp: chrono::DateTime<Utc>) {
        let event = SampleEvent {
            characteristic_id,
            measurements,
            timestamp,
            context: SampleContext {
                source: Some(SourceKind::Tag),
                ..Default::default()
            },
        };
        if let Err(e) = self.callback.on_sample(event).await {
            error!(characteristic_id, error = %e, "mqtt_sample_callback_failed");
        }
    }
}
