//! Outbound re-publisher (§4.7 "Outbound publisher", §6 "Egress: MQTT
//! outbound re-publish").
//!
//! A second sink that re-publishes `SampleProcessedEvent`,
//! `ControlLimitsUpdatedEvent`, `ViolationCreatedEvent`, and
//! `ViolationAcknowledgedEvent` to every outbound-enabled broker under a
//! Unified Namespace topic `{prefix}/{plant}/{hierarchy...}/{char}/{event}`,
//! with per-`(broker, characteristic)` rate limiting. Payload format (plain
//! JSON or a Sparkplug-compatible metric set) is chosen per broker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, MqttOptions, QoS};
use serde_json::json;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::alerts::{AlertNotifier, ViolationAcknowledgedEvent, ViolationCreatedEvent};
use crate::crypto::CredentialCipher;
use crate::db::models::{Broker, OutboundPayloadFormat};
use crate::db::repositories::{BrokerRepository, HierarchyRepository};
use crate::events::bus::EventHandler;
use crate::events::{ControlLimitsUpdatedEvent, SampleProcessedEvent};
use crate::providers::sparkplug;

const EVENT_LOOP_CAPACITY: usize = 16;

/// A characteristic's topic path, resolved once from the hierarchy and
/// cached — it only changes if the characteristic is re-parented, which is
/// peripheral CRUD this module doesn't observe directly.
#[derive(Debug, Clone)]
struct TopicInfo {
    plant: String,
    path_segments: Vec<String>,
    characteristic: String,
}

/// Sanitizes one topic segment per §6: lowercase, spaces become underscores,
/// and the MQTT wildcard/NUL characters that would otherwise corrupt the
/// topic are stripped.
fn sanitize_segment(raw: &str) -> String {
    raw.to_lowercase()
        .replace(' ', "_")
        .chars()
        .filter(|c| !matches!(c, '#' | '+' | '\0'))
        .collect()
}

struct BrokerClient {
    client: AsyncClient,
    config: crate::db::models::OutboundBrokerConfig,
    seq: AtomicU64,
}

/// Re-publishes the four canonical events to outbound-enabled brokers
/// (§4.7). Generic over the repository traits so tests substitute fakes for
/// a live database.
pub struct OutboundPublisher<B, H> {
    brokers: Arc<B>,
    hierarchy: Arc<H>,
    cipher: CredentialCipher,
    topic_prefix: String,
    clients: DashMap<i64, BrokerClient>,
    topic_cache: DashMap<i64, TopicInfo>,
    last_publish: DashMap<(i64, i64), Instant>,
    shutdown: Arc<Notify>,
}

impl<B, H> OutboundPublisher<B, H>
where
    B: BrokerRepository + 'static,
    H: HierarchyRepository + 'static,
{
    pub fn new(brokers: Arc<B>, hierarchy: Arc<H>, cipher: CredentialCipher, topic_prefix: String) -> Self {
        OutboundPublisher {
            brokers,
            hierarchy,
            cipher,
            topic_prefix,
            clients: DashMap::new(),
            topic_cache: DashMap::new(),
            last_publish: DashMap::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Connects to every outbound-enabled broker and spawns one event-loop
    /// driver per connection (the client is publish-only from this side, but
    /// `rumqttc` still needs its event loop polled to keep the connection
    /// alive and flush queued publishes).
    pub async fn start(self: &Arc<Self>) -> crate::Result<()> {
        let brokers = self.brokers.list_outbound_enabled().await?;
        for broker in brokers {
            let Some(outbound) = broker.outbound else { continue };
            let mut options = MqttOptions::new(format!("openspc-outbound-{}", broker.id), broker.host.clone(), broker.port);
            options.set_keep_alive(Duration::from_secs(broker.keepalive_seconds as u64));
            if let (Some(username), Some(ciphertext)) = (&broker.username, &broker.password_ciphertext) {
                match self.cipher.decrypt(ciphertext) {
                    Ok(password) => options.set_credentials(username.clone(), password),
                    Err(e) => {
                        error!(broker_id = broker.id, error = %e, "outbound_broker_credential_decrypt_failed");
                        continue;
                    }
                };
            }
            let (client, mut event_loop) = AsyncClient::new(options, EVENT_LOOP_CAPACITY);
            self.clients.insert(
                broker.id,
                BrokerClient {
                    client,
                    config: outbound,
                    seq: AtomicU64::new(0),
                },
            );

            let publisher = Arc::clone(self);
            let broker_id = broker.id;
            tokio::spawn(async move {
                let max_delay = Duration::from_secs(broker.max_reconnect_delay_seconds.max(1));
                let mut backoff = Duration::from_secs(1);
                loop {
                    tokio::select! {
                        _ = publisher.shutdown.notified() => {
                            info!(broker_id, "outbound_publisher_stopping");
                            return;
                        }
                        event = event_loop.poll() => {
                            match event {
                                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {
                                    backoff = Duration::from_secs(1);
                                }
                                Err(e) => {
                                    warn!(broker_id, error = %e, delay_secs = backoff.as_secs(), "outbound_broker_connection_error");
                                    tokio::time::sleep(backoff).await;
                                    backoff = (backoff * 2).min(max_delay);
                                }
                            }
                        }
                    }
                }
            });
        }
        info!(brokers = self.clients.len(), "outbound_publisher_started");
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// Runs the periodic stale rate-limit entry sweep until [`stop`](Self::stop)
    /// is called (§4.7 "Stale rate-limit entries are periodically pruned").
    pub async fn run_rate_limit_pruner(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = ticker.tick() => self.prune_stale_rate_limits(interval),
            }
        }
    }

    /// Drops any rate-limit entry whose age exceeds `max_age` — it can no
    /// longer suppress a future publish, so keeping it around would only
    /// grow the map unbounded.
    fn prune_stale_rate_limits(&self, max_age: Duration) {
        let now = Instant::now();
        self.last_publish.retain(|_, last| now.duration_since(*last) <= max_age);
    }

    async fn topic_info(&self, characteristic_id: i64) -> crate::Result<TopicInfo> {
        if let Some(cached) = self.topic_cache.get(&characteristic_id) {
            return Ok(cached.clone());
        }
        let characteristic = self
            .hierarchy
            .get_characteristic(characteristic_id)
            .await?
            .ok_or_else(|| crate::Error::NotFound(format!("characteristic {characteristic_id}")))?;
        let node = self
            .hierarchy
            .get(characteristic.hierarchy_node_id)
            .await?
            .ok_or_else(|| crate::Error::NotFound(format!("hierarchy node {}", characteristic.hierarchy_node_id)))?;
        let ancestors = self.hierarchy.ancestors(node.id).await?;
        let plant = self
            .hierarchy
            .get_plant(node.plant_id)
            .await?
            .ok_or_else(|| crate::Error::NotFound(format!("plant {}", node.plant_id)))?;

        let mut path_segments: Vec<String> = ancestors.iter().rev().map(|n| sanitize_segment(&n.name)).collect();
        path_segments.push(sanitize_segment(&node.name));

        let info = TopicInfo {
            plant: sanitize_segment(&plant.name),
            path_segments,
            characteristic: sanitize_segment(&characteristic.name),
        };
        self.topic_cache.insert(characteristic_id, info.clone());
        Ok(info)
    }

    fn build_topic(&self, info: &TopicInfo, event: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.topic_prefix,
            info.plant,
            info.path_segments.join("/"),
            info.characteristic,
            event
        )
    }

    /// Publishes `fields` (name/value pairs, numeric only — sufficient for
    /// every canonical event's payload) to every outbound-enabled broker,
    /// subject to the broker's rate limit, encoded per the broker's
    /// configured format.
    async fn publish_event(&self, characteristic_id: i64, event_name: &'static str, fields: Vec<(String, f64)>) {
        let info = match self.topic_info(characteristic_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(characteristic_id, error = %e, "outbound_topic_resolution_failed");
                return;
            }
        };
        let topic = self.build_topic(&info, event_name);
        let now = Instant::now();

        for entry in self.clients.iter() {
            let broker_id = *entry.key();
            let rate_key = (broker_id, characteristic_id);
            if let Some(last) = self.last_publish.get(&rate_key) {
                if now.duration_since(*last) < Duration::from_secs(entry.value().config.min_seconds_between_publishes) {
                    continue;
                }
            }

            let payload = match entry.value().config.format {
                OutboundPayloadFormat::Json => {
                    let mut obj = json!({
                        "event": event_name,
                        "characteristic_id": characteristic_id,
                        "timestamp": Utc::now(),
                    });
                    let map = obj.as_object_mut().expect("json! object literal");
                    for (name, value) in &fields {
                        map.insert(name.clone(), json!(value));
                    }
                    serde_json::to_vec(&obj).unwrap_or_default()
                }
                OutboundPayloadFormat::Sparkplug => {
                    let seq = entry.value().seq.fetch_add(1, Ordering::SeqCst);
                    sparkplug::encode_metrics(&fields, Utc::now().timestamp_millis(), seq)
                }
            };

            if let Err(e) = entry.value().client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                warn!(broker_id, topic, error = %e, "outbound_publish_failed");
                continue;
            }
            self.last_publish.insert(rate_key, now);
        }
    }
}

#[async_trait]
impl<B, H> EventHandler<SampleProcessedEvent> for OutboundPublisher<B, H>
where
    B: BrokerRepository + 'static,
    H: HierarchyRepository + 'static,
{
    async fn handle(&self, event: SampleProcessedEvent) -> anyhow::Result<()> {
        let mut fields = vec![("mean".to_string(), event.mean), ("in_control".to_string(), if event.in_control { 1.0 } else { 0.0 })];
        if let Some(range) = event.range_value {
            fields.push(("range".to_string(), range));
        }
        self.publish_event(event.characteristic_id, "sample", fields).await;
        Ok(())
    }
}

#[async_trait]
impl<B, H> EventHandler<ControlLimitsUpdatedEvent> for OutboundPublisher<B, H>
where
    B: BrokerRepository + 'static,
    H: HierarchyRepository + 'static,
{
    async fn handle(&self, event: ControlLimitsUpdatedEvent) -> anyhow::Result<()> {
        let fields = vec![
            ("center_line".to_string(), event.center_line),
            ("ucl".to_string(), event.ucl),
            ("lcl".to_string(), event.lcl),
            ("sigma".to_string(), event.sigma),
        ];
        self.publish_event(event.characteristic_id, "limits", fields).await;
        Ok(())
    }
}

#[async_trait]
impl<B, H> AlertNotifier for OutboundPublisher<B, H>
where
    B: BrokerRepository + 'static,
    H: HierarchyRepository + 'static,
{
    async fn on_violation_created(&self, event: ViolationCreatedEvent) {
        let fields = vec![
            ("rule_id".to_string(), event.violation.rule_id as f64),
            ("requires_acknowledgement".to_string(), if event.violation.requires_acknowledgement { 1.0 } else { 0.0 }),
        ];
        self.publish_event(event.violation.characteristic_id, "violation", fields).await;
    }

    async fn on_violation_acknowledged(&self, event: ViolationAcknowledgedEvent) {
        let fields = vec![("rule_id".to_string(), event.violation.rule_id as f64), ("acknowledged".to_string(), 1.0)];
        self.publish_event(event.violation.characteristic_id, "ack", fields).await;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use aes_gcm::aead::OsRng;
    use aes_gcm::{Aes256Gcm, KeyInit};
    use base64::Engine;

    use super::*;

    fn test_cipher() -> CredentialCipher {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(encoded.as_bytes()).unwrap();
        CredentialCipher::from_key_file(file.path().to_str().unwrap()).unwrap()
    }

    #[test]
    fn sanitize_segment_lowercases_and_strips_wildcards() {
        assert_eq!(sanitize_segment("Line A #1"), "line_a_1");
        assert_eq!(sanitize_segment("Bore+Diameter"), "borediameter");
    }

    #[test]
    fn prune_stale_rate_limits_drops_only_expired_entries() {
        let publisher: OutboundPublisher<NoopBrokerRepo, NoopHierarchyRepo> =
            OutboundPublisher::new(Arc::new(NoopBrokerRepo), Arc::new(NoopHierarchyRepo), test_cipher(), "openspc".to_string());
        let now = Instant::now();
        publisher.last_publish.insert((1, 1), now);
        publisher.last_publish.insert((1, 2), now - Duration::from_secs(120));
        publisher.prune_stale_rate_limits(Duration::from_secs(60));
        assert!(publisher.last_publish.contains_key(&(1, 1)));
        assert!(!publisher.last_publish.contains_key(&(1, 2)));
    }

    struct NoopBrokerRepo;
    #[async_trait]
    impl BrokerRepository for NoopBrokerRepo {
        async fn get(&self, _broker_id: i64) -> crate::Result<Option<Broker>> {
            Ok(None)
        }
        async fn list_outbound_enabled(&self) -> crate::Result<Vec<Broker>> {
            Ok(vec![])
        }
    }

    struct NoopHierarchyRepo;
    #[async_trait]
    impl HierarchyRepository for NoopHierarchyRepo {
        async fn get(&self, _hierarchy_node_id: i64) -> crate::Result<Option<crate::db::models::HierarchyNode>> {
            Ok(None)
        }
        async fn ancestors(&self, _hierarchy_node_id: i64) -> crate::Result<Vec<crate::db::models::HierarchyNode>> {
            Ok(vec![])
        }
        async fn active_plants(&self) -> crate::Result<Vec<crate::db::models::Plant>> {
            Ok(vec![])
        }
        async fn characteristics_for_plant(&self, _plant_id: i64) -> crate::Result<Vec<crate::db::models::Characteristic>> {
            Ok(vec![])
        }
        async fn get_plant(&self, _plant_id: i64) -> crate::Result<Option<crate::db::models::Plant>> {
            Ok(None)
        }
        async fn get_characteristic(&self, _characteristic_id: i64) -> crate::Result<Option<crate::db::models::Characteristic>> {
            Ok(None)
        }
    }
}
