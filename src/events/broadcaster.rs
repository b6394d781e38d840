//! Live-subscriber broadcaster (§4.7 "Live-subscriber broadcaster", §6
//! "Live-subscriber channel").
//!
//! Owns a registry of live-subscriber connections, each subscribed to a set
//! of `characteristic_id`s. It is attached to [`crate::events::EventBus`]
//! (for `sample`/`limits_update` messages) and registered as an
//! [`crate::alerts::AlertNotifier`] (for `violation`/`ack_update` messages).
//! The actual WebSocket framing lives in [`crate::api`]; this module only
//! tracks subscriptions and fans messages out.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::alerts::{AlertNotifier, ViolationAcknowledgedEvent, ViolationCreatedEvent};
use crate::db::models::Violation;
use crate::events::bus::EventHandler;
use crate::events::{ControlLimitsUpdatedEvent, SampleProcessedEvent};
use crate::stats::Zone;

/// Wire shape of one reported violation (§6 "Server→client messages").
#[derive(Debug, Clone, Serialize)]
pub struct ViolationPayload {
    pub id: i64,
    pub characteristic_id: i64,
    pub sample_id: i64,
    pub rule_id: u8,
    pub rule_name: String,
    pub severity: crate::rules::Severity,
}

impl From<&Violation> for ViolationPayload {
    fn from(v: &Violation) -> Self {
        ViolationPayload {
            id: v.id,
            characteristic_id: v.characteristic_id,
            sample_id: v.sample_id,
            rule_id: v.rule_id,
            rule_name: v.rule_name.clone(),
            severity: v.severity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SamplePayload {
    pub id: i64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub mean: f64,
    pub zone: Option<Zone>,
    pub in_control: bool,
}

/// Every message shape the server can push to a live-subscriber connection
/// (§6 "Server→client messages").
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Sample {
        characteristic_id: i64,
        sample: SamplePayload,
        violations: Vec<ViolationPayload>,
    },
    Violation {
        violation: ViolationPayload,
    },
    AckUpdate {
        violation: ViolationPayload,
    },
    LimitsUpdate {
        characteristic_id: i64,
        center_line: f64,
        ucl: f64,
        lcl: f64,
        sigma: f64,
    },
    Pong,
    Error {
        message: String,
    },
}

struct Connection {
    sender: mpsc::UnboundedSender<ServerMessage>,
    subscriptions: StdMutex<HashSet<i64>>,
    last_ping: StdMutex<Instant>,
}

/// Registry of live-subscriber connections plus the fan-out logic described
/// in §4.7. Connection add/remove/subscribe/unsubscribe hold only a short
/// critical section per connection (§5 "Shared-resource discipline");
/// broadcasting snapshots the relevant connection ids and sends outside any
/// lock, since `mpsc::UnboundedSender::send` never blocks.
pub struct LiveBroadcaster {
    connections: DashMap<u64, Connection>,
    next_id: AtomicU64,
    ping_timeout: Duration,
}

impl LiveBroadcaster {
    pub fn new(ping_timeout: Duration) -> Self {
        LiveBroadcaster {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            ping_timeout,
        }
    }

    /// Registers a new connection and returns its id plus the receiving end
    /// of its outbound message channel; the caller (the WebSocket handler in
    /// [`crate::api`]) drains the channel and forwards frames to the socket.
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            id,
            Connection {
                sender: tx,
                subscriptions: StdMutex::new(HashSet::new()),
                last_ping: StdMutex::new(Instant::now()),
            },
        );
        (id, rx)
    }

    pub fn remove(&self, id: u64) {
        self.connections.remove(&id);
    }

    pub fn subscribe(&self, id: u64, characteristic_ids: &[i64]) {
        if let Some(conn) = self.connections.get(&id) {
            conn.subscriptions.lock().unwrap().extend(characteristic_ids.iter().copied());
        }
    }

    pub fn unsubscribe(&self, id: u64, characteristic_ids: &[i64]) {
        if let Some(conn) = self.connections.get(&id) {
            let mut subs = conn.subscriptions.lock().unwrap();
            for char_id in characteristic_ids {
                subs.remove(char_id);
            }
        }
    }

    /// Records a client ping and replies with `pong` directly, bypassing the
    /// event bus (§6: client→server `{"type":"ping"}`, server→client
    /// `{"type":"pong"}`).
    pub fn touch_ping(&self, id: u64) {
        if let Some(conn) = self.connections.get(&id) {
            *conn.last_ping.lock().unwrap() = Instant::now();
            let _ = conn.sender.send(ServerMessage::Pong);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Evicts every connection whose last ping is older than the configured
    /// timeout (§4.7 "A heartbeat monitor evicts connections whose last ping
    /// exceeds a configurable timeout"). Takes `now` explicitly so the policy
    /// is testable without sleeping.
    pub fn evict_stale(&self, now: Instant) {
        let stale: Vec<u64> = self
            .connections
            .iter()
            .filter(|entry| now.duration_since(*entry.value().last_ping.lock().unwrap()) > self.ping_timeout)
            .map(|entry| *entry.key())
            .collect();
        for id in stale {
            self.connections.remove(&id);
        }
    }

    /// Runs the heartbeat monitor until cancelled. Intended to be spawned as
    /// a background task at startup (§5 "Scheduling model").
    pub async fn run_heartbeat(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.evict_stale(Instant::now());
        }
    }

    /// Sends to every connection subscribed to `characteristic_id`. A
    /// connection whose send fails (receiver dropped) is torn down
    /// immediately (§4.7 "A subscriber whose send fails is removed").
    fn send_to_subscribers(&self, characteristic_id: i64, message: &ServerMessage) {
        let mut dead = Vec::new();
        for entry in self.connections.iter() {
            let subscribed = entry.value().subscriptions.lock().unwrap().contains(&characteristic_id);
            if subscribed && entry.value().sender.send(message.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.connections.remove(&id);
        }
    }

    /// Sends to every connection regardless of subscription (§4.7
    /// "On ViolationAcknowledgedEvent it broadcasts to all connections").
    fn send_to_all(&self, message: &ServerMessage) {
        let mut dead = Vec::new();
        for entry in self.connections.iter() {
            if entry.value().sender.send(message.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.connections.remove(&id);
        }
    }
}

#[async_trait]
impl EventHandler<SampleProcessedEvent> for LiveBroadcaster {
    async fn handle(&self, event: SampleProcessedEvent) -> anyhow::Result<()> {
        let message = ServerMessage::Sample {
            characteristic_id: event.characteristic_id,
            sample: SamplePayload {
                id: event.sample_id,
                timestamp: event.timestamp,
                mean: event.mean,
                zone: event.zone,
                in_control: event.in_control,
            },
            violations: vec![],
        };
        self.send_to_subscribers(event.characteristic_id, &message);
        Ok(())
    }
}

#[async_trait]
impl EventHandler<ControlLimitsUpdatedEvent> for LiveBroadcaster {
    async fn handle(&self, event: ControlLimitsUpdatedEvent) -> anyhow::Result<()> {
        let message = ServerMessage::LimitsUpdate {
            characteristic_id: event.characteristic_id,
            center_line: event.center_line,
            ucl: event.ucl,
            lcl: event.lcl,
            sigma: event.sigma,
        };
        self.send_to_subscribers(event.characteristic_id, &message);
        Ok(())
    }
}

#[async_trait]
impl AlertNotifier for LiveBroadcaster {
    async fn on_violation_created(&self, event: ViolationCreatedEvent) {
        let message = ServerMessage::Violation {
            violation: ViolationPayload::from(&event.violation),
        };
        self.send_to_subscribers(event.violation.characteristic_id, &message);
    }

    async fn on_violation_acknowledged(&self, event: ViolationAcknowledgedEvent) {
        let message = ServerMessage::AckUpdate {
            violation: ViolationPayload::from(&event.violation),
        };
        self.send_to_all(&message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Severity;

    fn violation() -> Violation {
        Violation {
            id: 1,
            sample_id: 1,
            characteristic_id: 42,
            rule_id: 1,
            rule_name: "Outlier".to_string(),
            severity: Severity::Critical,
            requires_acknowledgement: true,
            acknowledged: false,
            ack_user: None,
            ack_reason: None,
            ack_timestamp: None,
        }
    }

    #[tokio::test]
    async fn sample_events_reach_only_subscribers_of_that_characteristic() {
        let broadcaster = LiveBroadcaster::new(Duration::from_secs(90));
        let (subscriber_id, mut subscriber_rx) = broadcaster.register();
        let (other_id, mut other_rx) = broadcaster.register();
        broadcaster.subscribe(subscriber_id, &[42]);
        broadcaster.subscribe(other_id, &[7]);

        broadcaster
            .handle(SampleProcessedEvent {
                characteristic_id: 42,
                sample_id: 1,
                mean: 100.0,
                range_value: None,
                zone: None,
                in_control: true,
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();

        assert!(matches!(subscriber_rx.try_recv().unwrap(), ServerMessage::Sample { characteristic_id: 42, .. }));
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn acknowledgement_broadcasts_to_every_connection() {
        let broadcaster = LiveBroadcaster::new(Duration::from_secs(90));
        let (_id_a, mut rx_a) = broadcaster.register();
        let (_id_b, mut rx_b) = broadcaster.register();

        broadcaster
            .on_violation_acknowledged(ViolationAcknowledgedEvent {
                violation: violation(),
                timestamp: chrono::Utc::now(),
            })
            .await;

        assert!(matches!(rx_a.try_recv().unwrap(), ServerMessage::AckUpdate { .. }));
        assert!(matches!(rx_b.try_recv().unwrap(), ServerMessage::AckUpdate { .. }));
    }

    #[tokio::test]
    async fn unsubscribing_stops_further_delivery() {
        let broadcaster = LiveBroadcaster::new(Duration::from_secs(90));
        let (id, mut rx) = broadcaster.register();
        broadcaster.subscribe(id, &[42]);
        broadcaster.unsubscribe(id, &[42]);

        broadcaster
            .handle(SampleProcessedEvent {
                characteristic_id: 42,
                sample_id: 1,
                mean: 100.0,
                range_value: None,
                zone: None,
                in_control: true,
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stale_connections_are_evicted_after_the_ping_timeout() {
        let broadcaster = LiveBroadcaster::new(Duration::from_secs(60));
        let (id, _rx) = broadcaster.register();
        assert_eq!(broadcaster.connection_count(), 1);

        broadcaster.evict_stale(Instant::now() + Duration::from_secs(61));

        assert_eq!(broadcaster.connection_count(), 0);
        drop(id);
    }

    #[test]
    fn ping_refreshes_the_liveness_deadline() {
        let broadcaster = LiveBroadcaster::new(Duration::from_secs(60));
        let (id, mut rx) = broadcaster.register();
        let later = Instant::now() + Duration::from_secs(30);
        broadcaster.touch_ping(id);

        broadcaster.evict_stale(later);

        assert_eq!(broadcaster.connection_count(), 1);
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Pong));
    }
}
