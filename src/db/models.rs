//! Domain entities (§3). These are plain structs returned by the repository
//! layer — nothing here knows about `tokio_postgres::Row`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rules::Severity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plant {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub id: i64,
    pub plant_id: i64,
    pub parent_id: Option<i64>,
    pub name: String,
    pub node_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Characteristic {
    pub id: i64,
    pub hierarchy_node_id: i64,
    pub name: String,
    pub subgroup_size: i32,
    pub target: Option<f64>,
    pub usl: Option<f64>,
    pub lsl: Option<f64>,
    pub center_line: Option<f64>,
    pub ucl: Option<f64>,
    pub lcl: Option<f64>,
    pub sigma: Option<f64>,
    /// Allows a subgroup smaller than `subgroup_size` to flush (§4.4, on_timer
    /// partial flush; §4.6 validate step).
    pub allows_variable_n: bool,
}

impl Characteristic {
    /// The characteristic's current zone boundaries, or `None` if limits
    /// haven't been computed yet (§4.6 step 4).
    pub fn zone_boundaries(&self) -> Option<crate::stats::ZoneBoundaries> {
        let cl = self.center_line?;
        let sigma = self.sigma?;
        crate::stats::ZoneBoundaries::new(cl, sigma).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicRule {
    pub characteristic_id: i64,
    pub rule_id: u8,
    pub enabled: bool,
    pub requires_acknowledgement: bool,
}

/// How raw readings accumulate into a subgroup before the engine sees them
/// (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStrategy {
    OnChange,
    OnTrigger,
    OnTimer,
}

/// The polymorphic data-source row, reimplemented as a tagged variant per
/// `spec.md` §9 ("Typed sum for data sources") rather than a discriminator
/// column plus child tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSourceSpec {
    Manual,
    Mqtt {
        broker_id: i64,
        topic: String,
        metric_name: Option<String>,
        trigger_tag: Option<String>,
    },
    OpcUa {
        server_id: i64,
        node_id: String,
        sampling_interval_ms: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: i64,
    pub characteristic_id: i64,
    pub is_active: bool,
    pub trigger_strategy: TriggerStrategy,
    pub spec: DataSourceSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: i64,
    pub characteristic_id: i64,
    pub timestamp: DateTime<Utc>,
    pub batch_number: Option<String>,
    pub operator_id: Option<String>,
    pub is_excluded: bool,
    pub actual_n: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: i64,
    pub sample_id: i64,
    pub value: f64,
    pub sequence: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub id: i64,
    pub sample_id: i64,
    pub characteristic_id: i64,
    pub rule_id: u8,
    pub rule_name: String,
    pub severity: Severity,
    pub requires_acknowledgement: bool,
    pub acknowledged: bool,
    pub ack_user: Option<String>,
    pub ack_reason: Option<String>,
    pub ack_timestamp: Option<DateTime<Utc>>,
}

impl Violation {
    /// §3 invariant: unacknowledged iff requires-ack and not yet acked.
    pub fn is_unacknowledged(&self) -> bool {
        self.requires_acknowledgement && !self.acknowledged
    }

    /// §3 invariant: informational iff it doesn't require ack and isn't acked.
    pub fn is_informational(&self) -> bool {
        !self.requires_acknowledgement && !self.acknowledged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Point,
    Period,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: i64,
    pub characteristic_id: i64,
    pub sample_id: Option<i64>,
    pub kind: AnnotationKind,
    pub note: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionScope {
    Global,
    Hierarchy,
    Characteristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Days,
    Weeks,
    Months,
    Years,
}

impl TimeUnit {
    /// Day multiplier per `original_source/backend/src/openspc/core/purge_engine.py`:
    /// months approximated as 30 days, years as 365.
    pub fn days(self) -> i64 {
        match self {
            TimeUnit::Days => 1,
            TimeUnit::Weeks => 7,
            TimeUnit::Months => 30,
            TimeUnit::Years => 365,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetentionType {
    Forever,
    SampleCount { value: i64 },
    TimeDelta { value: i64, unit: TimeUnit },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: i64,
    pub scope: RetentionScope,
    /// `plant_id` for `Global`, `hierarchy_node_id` for `Hierarchy`,
    /// `characteristic_id` for `Characteristic`.
    pub scope_id: i64,
    pub retention_type: RetentionType,
}

/// Where a resolved policy came from, for `spec.md` §8 testable property 8
/// ("the returned policy's source is the nearest in the chain").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Characteristic,
    Hierarchy,
    Global,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPolicy {
    pub retention_type: RetentionType,
    pub source: PolicySource,
    pub source_id: Option<i64>,
}

/// Connection parameters for an MQTT broker the core egresses against (§4,
/// §6 "Egress: MQTT subscribe"). Credential CRUD is out of scope; the core
/// only reads these rows to connect. `password` is the ciphertext as stored;
/// callers decrypt with [`crate::crypto::CredentialCipher`] before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broker {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password_ciphertext: Option<String>,
    pub keepalive_seconds: u16,
    pub max_reconnect_delay_seconds: u64,
    pub use_tls: bool,
    /// Outbound-publish settings; `None` for ingress-only brokers.
    pub outbound: Option<OutboundBrokerConfig>,
}

/// Per-broker outbound re-publish settings (§4 "Outbound publisher").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutboundBrokerConfig {
    pub enabled: bool,
    pub format: OutboundPayloadFormat,
    pub min_seconds_between_publishes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundPayloadFormat {
    Json,
    Sparkplug,
}

/// Connection parameters for an OPC-UA server (§6 "Egress" / `DataSourceSpec::OpcUa`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpcUaServer {
    pub id: i64,
    pub name: String,
    pub endpoint_url: String,
    pub username: Option<String>,
    pub password_ciphertext: Option<String>,
    pub default_sampling_interval_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeHistoryRow {
    pub id: i64,
    pub plant_id: i64,
    pub characteristic_id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub samples_deleted: i64,
    pub error_message: Option<String>,
}

/// A row of the `api_key` table (§6 "authenticated by API key"). `key_hash` is
/// the SHA-256 hex digest of the presented key, never the key itself.
/// `characteristic_ids` of `None` grants every characteristic; `Some(&[])`
/// grants none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyGrant {
    pub key_hash: String,
    pub name: String,
    pub characteristic_ids: Option<Vec<i64>>,
    pub revoked: bool,
}

impl ApiKeyGrant {
    pub fn allows(&self, characteristic_id: i64) -> bool {
        !self.revoked
            && match &self.characteristic_ids {
                None => true,
                Some(ids) => ids.contains(&characteristic_id),
            }
    }
}
