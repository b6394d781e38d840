//! The process-local event bus, the live-subscriber broadcaster, and the
//! outbound re-publisher (§4.7).
//!
//! `SampleProcessedEvent` and `ControlLimitsUpdatedEvent` travel through
//! [`EventBus`]. Violation lifecycle events (`ViolationCreatedEvent`,
//! `ViolationAcknowledgedEvent`, both defined on [`crate::alerts`]) are
//! pushed directly to [`crate::alerts::AlertNotifier`]s by
//! [`crate::alerts::AlertManager`] instead of travelling through the bus —
//! see `DESIGN.md` for why the split exists. [`LiveBroadcaster`] and
//! [`OutboundPublisher`] each subscribe to the bus *and* register as an
//! `AlertNotifier`, so both sinks see all four event classes despite the
//! split transport.

pub mod broadcaster;
pub mod bus;
pub mod outbound;

pub use broadcaster::LiveBroadcaster;
pub use bus::{EventBus, EventHandler};
pub use outbound::OutboundPublisher;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::stats::Zone;

/// A subgroup finished processing (§4.6 step 9, §4.7 "Canonical events").
#[derive(Debug, Clone, Serialize)]
pub struct SampleProcessedEvent {
    pub characteristic_id: i64,
    pub sample_id: i64,
    pub mean: f64,
    pub range_value: Option<f64>,
    pub zone: Option<Zone>,
    pub in_control: bool,
    pub timestamp: DateTime<Utc>,
}

/// A characteristic's control limits were recalculated (§4.6
/// "Control-limit recalculation", §4.7 "Canonical events").
#[derive(Debug, Clone, Serialize)]
pub struct ControlLimitsUpdatedEvent {
    pub characteristic_id: i64,
    pub center_line: f64,
    pub ucl: f64,
    pub lcl: f64,
    pub sigma: f64,
    pub timestamp: DateTime<Utc>,
}
