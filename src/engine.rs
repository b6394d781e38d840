//! The SPC engine: the central orchestrator that turns a normalized
//! [`crate::providers::SampleEvent`] into a persisted sample, a classified
//! window entry, and any fired rule violations (§4.6).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::alerts::AlertManager;
use crate::db::models::Sample;
use crate::db::repositories::{CharacteristicRepository, SampleRepository, ViolationRepository};
use crate::events::{ControlLimitsUpdatedEvent, EventBus, SampleProcessedEvent};
use crate::providers::{SampleCallback, SampleContext, SampleEvent};
use crate::rules::{NelsonRuleLibrary, RuleResult, Severity};
use crate::stats::{self, ZoneBoundaries};
use crate::telemetry::Metrics;
use crate::window::WindowManager;

/// Errors the engine can raise while processing a subgroup or recalculating
/// limits (§4.6, §7).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(i64),

    #[error("subgroup for characteristic {characteristic_id} must have at least one measurement")]
    EmptyMeasurements { characteristic_id: i64 },

    #[error(
        "characteristic {characteristic_id} expects at most {subgroup_size} measurements \
         and does not allow variable-n subgroups, got {got}"
    )]
    OversizedSubgroup {
        characteristic_id: i64,
        subgroup_size: i32,
        got: usize,
    },

    #[error("not enough history to recalculate limits for characteristic {characteristic_id}: need {need}, have {got}")]
    InsufficientHistory {
        characteristic_id: i64,
        need: usize,
        got: usize,
    },

    #[error(transparent)]
    Stats(#[from] stats::Error),

    #[error(transparent)]
    Database(#[from] crate::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What `process_sample` returns, matching the REST response shape of
/// §6 ("submit-sample REST").
#[derive(Debug, Clone, Serialize)]
pub struct SampleResult {
    pub sample_id: i64,
    pub mean: f64,
    pub range_value: Option<f64>,
    pub zone: Option<crate::stats::Zone>,
    pub in_control: bool,
    pub sigma_distance: Option<f64>,
    pub violations: Vec<RuleResult>,
    pub processing_time_ms: f64,
}

/// Ties persistence, the rolling window, the rule library, and the alert
/// manager together into the single per-characteristic serialized cycle
/// described in §4.6 and §5.
pub struct SpcEngine<C, S, V, R> {
    characteristics: Arc<C>,
    samples: Arc<S>,
    window_manager: Arc<WindowManager<R>>,
    rule_library: NelsonRuleLibrary,
    alert_manager: Arc<AlertManager<V>>,
    event_bus: Arc<EventBus>,
    metrics: Option<Arc<Metrics>>,
}

impl<C, S, V, R> SpcEngine<C, S, V, R>
where
    C: CharacteristicRepository,
    S: SampleRepository,
    V: ViolationRepository,
    R: crate::window::manager::WindowRepository,
{
    pub fn new(
        characteristics: Arc<C>,
        samples: Arc<S>,
        window_manager: Arc<WindowManager<R>>,
        alert_manager: Arc<AlertManager<V>>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        SpcEngine {
            characteristics,
            samples,
            window_manager,
            rule_library: NelsonRuleLibrary::new(),
            alert_manager,
            event_bus,
            metrics: None,
        }
    }

    /// Attaches a metrics registry (§4.11: samples processed, rule fires,
    /// violations created). Optional — an engine built without one simply
    /// records nothing.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record_sample_metrics(&self, elapsed_secs: f64) {
        if let Some(metrics) = &self.metrics {
            metrics.samples_processed_total.inc();
            metrics.sample_processing_duration_seconds.observe(elapsed_secs);
        }
    }

    /// Runs the full subgroup-processing cycle described in §4.6 steps 1-10.
    pub async fn process_sample(
        &self,
        characteristic_id: i64,
        measurements: Vec<f64>,
        timestamp: DateTime<Utc>,
        context: SampleContext,
    ) -> Result<SampleResult> {
        let started = Instant::now();

        let characteristic = self
            .characteristics
            .get(characteristic_id)
            .await
            .map_err(Error::Database)?
            .ok_or(Error::CharacteristicNotFound(characteristic_id))?;

        if measurements.is_empty() {
            return Err(Error::EmptyMeasurements { characteristic_id });
        }
        if measurements.len() > characteristic.subgroup_size as usize && !characteristic.allows_variable_n {
            return Err(Error::OversizedSubgroup {
                characteristic_id,
                subgroup_size: characteristic.subgroup_size,
                got: measurements.len(),
            });
        }

        let (mean, range) = stats::mean_range(&measurements);

        let sample: Sample = self
            .samples
            .insert_with_measurements(
                characteristic_id,
                timestamp,
                &measurements,
                context.batch_number.clone(),
                context.operator_id.clone(),
            )
            .await
            .map_err(Error::Database)?;

        let boundaries = characteristic.zone_boundaries();
        let Some(boundaries) = boundaries else {
            // Limits not yet computed for a brand-new characteristic: return
            // an uncontrolled-looking but in-control result with no rules
            // evaluated (§4.6 step 4).
            self.event_bus
                .publish(SampleProcessedEvent {
                    characteristic_id,
                    sample_id: sample.id,
                    mean,
                    range_value: range,
                    zone: None,
                    in_control: true,
                    timestamp: Utc::now(),
                })
                .await;
            self.record_sample_metrics(started.elapsed().as_secs_f64());
            return Ok(SampleResult {
                sample_id: sample.id,
                mean,
                range_value: range,
                zone: None,
                in_control: true,
                sigma_distance: None,
                violations: vec![],
                processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            });
        };

        // Fetched before the window lock: this read doesn't depend on window
        // state, so it doesn't need to be serialized against other cycles
        // for the same characteristic.
        let rules = self
            .characteristics
            .rules(characteristic_id)
            .await
            .map_err(Error::Database)?;
        let enabled: HashSet<u8> = rules
            .values()
            .filter(|r| r.enabled)
            .map(|r| r.rule_id)
            .collect();

        // Append and evaluate under one held window guard (§4.6, §5): two
        // concurrent cycles for this characteristic cannot interleave their
        // append and rule-evaluation steps.
        let (window_sample, fired) = self
            .window_manager
            .add_sample_and_evaluate(
                characteristic_id,
                sample.id,
                sample.timestamp,
                mean,
                range,
                &boundaries,
                &self.rule_library,
                &enabled,
            )
            .await
            .map_err(Error::Database)?;

        let violations = self
            .alert_manager
            .record_violations(characteristic_id, sample.id, &fired, &rules)
            .await
            .map_err(Error::Database)?;

        self.event_bus
            .publish(SampleProcessedEvent {
                characteristic_id,
                sample_id: sample.id,
                mean,
                range_value: range,
                zone: Some(window_sample.zone),
                in_control: violations.is_empty(),
                timestamp: Utc::now(),
            })
            .await;

        if let Some(metrics) = &self.metrics {
            for result in fired.iter().filter(|r| r.triggered) {
                metrics
                    .rule_fires_total
                    .with_label_values(&[&result.rule_id.to_string(), result.severity.as_str()])
                    .inc();
            }
            if !violations.is_empty() {
                metrics.violations_created_total.inc_by(violations.len() as u64);
            }
        }
        self.record_sample_metrics(started.elapsed().as_secs_f64());

        Ok(SampleResult {
            sample_id: sample.id,
            mean,
            range_value: range,
            zone: Some(window_sample.zone),
            in_control: violations.is_empty(),
            sigma_distance: Some(window_sample.sigma_distance),
            violations: fired.into_iter().filter(|r| r.triggered).collect(),
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Recomputes a characteristic's control limits from historical samples,
    /// optionally excluding those flagged `is_excluded`, invalidates its
    /// cached window, and publishes `ControlLimitsUpdatedEvent` (§4.6
    /// "Control-limit recalculation"). No samples are mutated.
    pub async fn recalculate_limits(&self, characteristic_id: i64, exclude_ooc: bool) -> Result<ZoneBoundaries> {
        let characteristic = self
            .characteristics
            .get(characteristic_id)
            .await
            .map_err(Error::Database)?
            .ok_or(Error::CharacteristicNotFound(characteristic_id))?;

        let n = characteristic.subgroup_size as usize;
        let method = stats::SigmaMethod::for_subgroup_size(n);
        let min_subgroups = match method {
            stats::SigmaMethod::MovingRange => 3,
            _ => 2,
        };

        let stats_rows = self
            .samples
            .load_subgroup_stats(characteristic_id, 1000, exclude_ooc)
            .await
            .map_err(Error::Database)?;

        if stats_rows.len() < min_subgroups {
            return Err(Error::InsufficientHistory {
                characteristic_id,
                need: min_subgroups,
                got: stats_rows.len(),
            });
        }

        let means: Vec<f64> = stats_rows.iter().map(|s| s.mean).collect();
        let limits = match method {
            stats::SigmaMethod::MovingRange => {
                let imr = stats::limits::calculate_imr_limits(&means, 2)?;
                imr.xbar_limits
            }
            stats::SigmaMethod::RBar => {
                let ranges: Vec<f64> = stats_rows.iter().filter_map(|s| s.range).collect();
                let xbar_r = stats::limits::calculate_xbar_r_limits(&means, &ranges, n)?;
                xbar_r.xbar_limits
            }
            stats::SigmaMethod::SBar => {
                let std_devs: Vec<f64> = stats_rows.iter().filter_map(|s| s.std_dev).collect();
                let xbar_s = stats::limits::calculate_xbar_s_limits(&means, &std_devs, n)?;
                xbar_s.xbar_limits
            }
        };

        self.characteristics
            .update_limits(characteristic_id, limits.center_line, limits.ucl, limits.lcl, limits.sigma)
            .await
            .map_err(Error::Database)?;
        self.window_manager.invalidate(characteristic_id).await;

        let boundaries = ZoneBoundaries::new(limits.center_line, limits.sigma)?;

        self.event_bus
            .publish(ControlLimitsUpdatedEvent {
                characteristic_id,
                center_line: limits.center_line,
                ucl: limits.ucl,
                lcl: limits.lcl,
                sigma: limits.sigma,
                timestamp: Utc::now(),
            })
            .await;

        Ok(boundaries)
    }
}

#[async_trait]
impl<C, S, V, R> SampleCallback for SpcEngine<C, S, V, R>
where
    C: CharacteristicRepository,
    S: SampleRepository,
    V: ViolationRepository,
    R: crate::window::manager::WindowRepository,
{
    /// Bridges a provider's completed subgroup into `process_sample` (§4.5
    /// "Invoked by a provider once it has assembled a complete subgroup").
    /// Errors propagate per §7 ("engine failures... re-raise so the caller
    /// sees a failure"); the manual/REST surfaces see it directly, MQTT/OPC-UA
    /// providers log and move on to the next message.
    async fn on_sample(&self, event: SampleEvent) -> crate::Result<()> {
        self.process_sample(event.characteristic_id, event.measurements, event.timestamp, event.context)
            .await
            .map_err(crate::Error::from)?;
        Ok(())
    }
}

impl From<Error> for crate::Error {
    fn from(e: Error) -> Self {
        crate::Error::Engine(Box::new(e))
    }
}
