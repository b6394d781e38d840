//! The four ingress modalities that converge on a single [`SampleEvent`]
//! contract (§4.5).
//!
//! Manual/REST submission is a thin, synchronous validation path; MQTT and
//! OPC-UA are long-running background tasks that subscribe on startup and
//! dispatch arriving readings through a [`crate::buffer::BufferManager`].

pub mod manual;
pub mod mqtt;
pub mod opcua;
pub mod sparkplug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use manual::ManualProvider;
pub use mqtt::MqttTagProvider;
pub use opcua::OpcUaProvider;

/// Where a [`SampleEvent`] originated, carried in its context for
/// downstream auditability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceKind {
    Manual,
    Rest,
    Tag,
    OpcUa,
}

/// Caller-supplied context accompanying a subgroup's measurements (§4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleContext {
    pub batch_number: Option<String>,
    pub operator_id: Option<String>,
    pub source: Option<SourceKind>,
    pub metadata: Option<serde_json::Value>,
}

/// The normalized event every provider hands to the engine (§4.5).
#[derive(Debug, Clone)]
pub struct SampleEvent {
    pub characteristic_id: i64,
    pub measurements: Vec<f64>,
    pub timestamp: DateTime<Utc>,
    pub context: SampleContext,
}

/// Errors raised while normalizing provider input into a [`SampleEvent`].
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(i64),

    #[error("characteristic {characteristic_id} does not accept {attempted:?} submissions")]
    ProviderTypeMismatch {
        characteristic_id: i64,
        attempted: SourceKind,
    },

    #[error("characteristic {characteristic_id} expects {expected} measurements, got {got}")]
    MeasurementCountMismatch {
        characteristic_id: i64,
        expected: i32,
        got: usize,
    },

    #[error("MQTT client unavailable: {0}")]
    MqttUnavailable(String),

    #[error("OPC-UA client unavailable: {0}")]
    OpcUaUnavailable(String),

    #[error("on_trigger strategy is not supported for OPC-UA data sources")]
    OpcUaTriggerUnsupported,

    #[error(transparent)]
    Database(#[from] crate::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Invoked by a provider once it has assembled a complete (or
/// timeout-flushed) subgroup. Implemented by [`crate::engine::SpcEngine`] in
/// production; tests substitute a recording callback.
#[async_trait]
pub trait SampleCallback: Send + Sync {
    async fn on_sample(&self, event: SampleEvent) -> crate::Result<()>;
}
