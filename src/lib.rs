//! # OpenSPC
//!
//! Statistical Process Control (SPC) backend core: ingests measurement streams
//! from manufacturing equipment, maintains per-characteristic rolling windows of
//! subgroup samples, evaluates Nelson pattern-detection rules in real time,
//! persists results, and fans results out to live subscribers and outbound
//! brokers.
//!
//! ## Module map
//!
//! - [`stats`] — pure statistics: sigma estimators, control-limit calculators,
//!   zone boundaries (leaf dependency of everything else).
//! - [`window`] — the bounded rolling window and its LRU-cached manager.
//! - [`rules`] — the eight stateless Nelson pattern detectors.
//! - [`buffer`] — per-characteristic subgroup accumulation and trigger
//!   strategies (on-change / on-trigger / on-timer).
//! - [`providers`] — the four ingress modalities that produce [`providers::SampleEvent`]s.
//! - [`engine`] — the orchestrator tying persistence, the window, and the rule
//!   library together.
//! - [`events`] — the in-process event bus, live-subscriber broadcaster, and
//!   outbound re-publisher.
//! - [`alerts`] — violation bookkeeping and acknowledgement.
//! - [`retention`] — policy resolution and the background purge engine.
//! - [`db`] — repository layer over the relational store.
//! - [`api`] — the REST submit-sample surface and the live-subscriber WebSocket.
//! - [`config`] — process configuration.
//! - [`crypto`] — credential-at-rest encryption.
//! - [`telemetry`] — tracing/metrics bootstrap.

pub mod alerts;
pub mod api;
pub mod buffer;
pub mod config;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod providers;
pub mod retention;
pub mod rules;
pub mod stats;
pub mod telemetry;
pub mod window;

pub use error::{Error, Result};
