//! Per-characteristic subgroup accumulation and trigger strategies (§4.4).
//!
//! A [`SubgroupBuffer`] turns a stream of individual readings into subgroup
//! vectors according to a [`TriggerStrategy`]. Buffers hold no knowledge of
//! MQTT/OPC-UA/manual origin; providers own one buffer per characteristic and
//! decide when to flush based on the strategy in the buffer's [`TagConfig`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db::models::TriggerStrategy;

/// Static configuration for one characteristic's buffer, derived from its
/// `DataSource` row (§4.4, §4.5).
#[derive(Debug, Clone)]
pub struct TagConfig {
    pub characteristic_id: i64,
    pub subgroup_size: usize,
    pub trigger_strategy: TriggerStrategy,
    pub trigger_tag: Option<String>,
    pub metric_name: Option<String>,
    pub buffer_timeout: Duration,
}

/// A FIFO of pending readings for one characteristic, plus the wall-clock
/// timestamp of its last update.
#[derive(Debug, Clone, Default)]
pub struct SubgroupBuffer {
    values: Vec<f64>,
    last_update: Option<DateTime<Utc>>,
}

/// The result of flushing a buffer: the values it held and whether it was
/// undersized relative to the characteristic's subgroup size (§4.4 timeout
/// partial-flush, §4.6 step 1 `variable-n` allowance).
#[derive(Debug, Clone, PartialEq)]
pub struct FlushedSubgroup {
    pub values: Vec<f64>,
    pub actual_n: usize,
    pub undersized: bool,
}

impl SubgroupBuffer {
    pub fn new() -> Self {
        SubgroupBuffer::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Appends a value and stamps `last_update`. Returns `true` once the
    /// buffer has reached `subgroup_size` (the on_change fill signal).
    pub fn add(&mut self, value: f64, subgroup_size: usize, now: DateTime<Utc>) -> bool {
        self.values.push(value);
        self.last_update = Some(now);
        self.values.len() >= subgroup_size
    }

    /// Drains the buffer, returning its contents tagged with whether the
    /// flush is undersized against `subgroup_size`. A no-op (empty result)
    /// when the buffer holds nothing — callers should skip emitting a
    /// `SampleEvent` for an empty flush (§4.4 on_trigger "if B is empty at
    /// trigger, do nothing").
    pub fn flush(&mut self, subgroup_size: usize) -> FlushedSubgroup {
        let values = std::mem::take(&mut self.values);
        self.last_update = None;
        let actual_n = values.len();
        FlushedSubgroup {
            undersized: actual_n < subgroup_size,
            values,
            actual_n,
        }
    }

    /// True when the buffer holds at least one reading and its age exceeds
    /// `timeout` (§4.4 on_timer sweep and the on_change partial-flush case).
    pub fn is_timed_out(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        match self.last_update {
            Some(last) if !self.values.is_empty() => {
                now.signed_duration_since(last)
                    .to_std()
                    .map(|age| age >= timeout)
                    .unwrap_or(true)
            }
            _ => false,
        }
    }
}

/// Holds one [`SubgroupBuffer`] per characteristic plus its [`TagConfig`],
/// and applies trigger-strategy logic on each arriving reading (§4.4). Shared
/// across a provider's message-handling tasks, so each per-characteristic
/// buffer is behind its own lock via an outer `Mutex` guarding the map — the
/// map itself only grows at provider startup, so a single lock around
/// lookups is not a bottleneck relative to the I/O the providers otherwise do.
pub struct BufferManager {
    buffers: Mutex<HashMap<i64, (TagConfig, SubgroupBuffer)>>,
}

/// What happened when a reading was dispatched into a buffer, for the caller
/// to act on (flush or not).
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Buffered, no flush yet.
    Buffered,
    /// The buffer reached `subgroup_size` (on_change fill) or was flushed at
    /// the caller's explicit request; contains the flushed subgroup.
    Flushed(FlushedSubgroup),
}

impl BufferManager {
    pub fn new() -> Self {
        BufferManager {
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, config: TagConfig) {
        let mut guard = self.buffers.lock().await;
        guard
            .entry(config.characteristic_id)
            .or_insert_with(|| (config.clone(), SubgroupBuffer::new()))
            .0 = config;
    }

    pub async fn unregister(&self, characteristic_id: i64) {
        self.buffers.lock().await.remove(&characteristic_id);
    }

    pub async fn configured_characteristics(&self) -> Vec<i64> {
        self.buffers.lock().await.keys().copied().collect()
    }

    /// Dispatches one arriving value for `characteristic_id` according to
    /// its configured [`TriggerStrategy`] (§4.4):
    ///
    /// - `on_change`: append; flush when the buffer reaches `subgroup_size`.
    /// - `on_trigger`: append only; flushing happens via [`Self::trigger`].
    /// - `on_timer`: append only; flushing happens via the timeout sweep.
    pub async fn dispatch(&self, characteristic_id: i64, value: f64, now: DateTime<Utc>) -> Option<DispatchOutcome> {
        let mut guard = self.buffers.lock().await;
        let (config, buffer) = guard.get_mut(&characteristic_id)?;
        let filled = buffer.add(value, config.subgroup_size, now);
        Some(match config.trigger_strategy {
            TriggerStrategy::OnChange if filled => {
                DispatchOutcome::Flushed(buffer.flush(config.subgroup_size))
            }
            _ => DispatchOutcome::Buffered,
        })
    }

    /// Flushes every buffer whose `trigger_tag` matches `topic` and whose
    /// strategy is `on_trigger`. A buffer with nothing pending is skipped
    /// (§4.4 "if B is empty at trigger, do nothing").
    pub async fn trigger(&self, topic: &str) -> Vec<(i64, FlushedSubgroup)> {
        let mut guard = self.buffers.lock().await;
        let mut flushed = Vec::new();
        for (char_id, (config, buffer)) in guard.iter_mut() {
            if config.trigger_strategy == TriggerStrategy::OnTrigger
                && config.trigger_tag.as_deref() == Some(topic)
                && !buffer.is_empty()
            {
                flushed.push((*char_id, buffer.flush(config.subgroup_size)));
            }
        }
        flushed
    }

    /// Sweeps every buffer for timeout-driven flush (§4.4): `on_timer`
    /// buffers flush on any pending reading past `buffer_timeout`; `on_change`
    /// buffers with a partial subgroup also flush once they've aged out,
    /// since otherwise a short subgroup could accumulate forever.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Vec<(i64, FlushedSubgroup)> {
        let mut guard = self.buffers.lock().await;
        let mut flushed = Vec::new();
        for (char_id, (config, buffer)) in guard.iter_mut() {
            let eligible = matches!(
                config.trigger_strategy,
                TriggerStrategy::OnTimer | TriggerStrategy::OnChange
            );
            if eligible && buffer.is_timed_out(config.buffer_timeout, now) {
                flushed.push((*char_id, buffer.flush(config.subgroup_size)));
            }
        }
        flushed
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread-safe handle to share one [`BufferManager`] across provider tasks.
pub type SharedBufferManager = Arc<BufferManager>;

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: TriggerStrategy) -> TagConfig {
        TagConfig {
            characteristic_id: 1,
            subgroup_size: 3,
            trigger_strategy: strategy,
            trigger_tag: Some("trig/1".to_string()),
            metric_name: None,
            buffer_timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn on_change_flushes_exactly_when_full() {
        let manager = BufferManager::new();
        manager.register(config(TriggerStrategy::OnChange)).await;
        let now = Utc::now();

        assert_eq!(manager.dispatch(1, 1.0, now).await, Some(DispatchOutcome::Buffered));
        assert_eq!(manager.dispatch(1, 2.0, now).await, Some(DispatchOutcome::Buffered));
        let third = manager.dispatch(1, 3.0, now).await.unwrap();
        match third {
            DispatchOutcome::Flushed(flush) => {
                assert_eq!(flush.values, vec![1.0, 2.0, 3.0]);
                assert!(!flush.undersized);
            }
            other => panic!("expected flush, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn on_trigger_never_flushes_from_dispatch() {
        let manager = BufferManager::new();
        manager.register(config(TriggerStrategy::OnTrigger)).await;
        let now = Utc::now();
        for v in [1.0, 2.0, 3.0, 4.0] {
            assert_eq!(manager.dispatch(1, v, now).await, Some(DispatchOutcome::Buffered));
        }
        let flushed = manager.trigger("trig/1").await;
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].1.values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn on_trigger_with_empty_buffer_does_nothing() {
        let manager = BufferManager::new();
        manager.register(config(TriggerStrategy::OnTrigger)).await;
        let flushed = manager.trigger("trig/1").await;
        assert!(flushed.is_empty());
    }

    #[tokio::test]
    async fn timeout_sweep_flushes_partial_subgroup_as_undersized() {
        let manager = BufferManager::new();
        manager.register(config(TriggerStrategy::OnTimer)).await;
        let start = Utc::now();
        manager.dispatch(1, 1.0, start).await;

        let later = start + chrono::Duration::seconds(61);
        let flushed = manager.sweep_timeouts(later).await;
        assert_eq!(flushed.len(), 1);
        assert!(flushed[0].1.undersized);
        assert_eq!(flushed[0].1.actual_n, 1);
    }

    #[tokio::test]
    async fn timeout_sweep_ignores_fresh_buffers() {
        let manager = BufferManager::new();
        manager.register(config(TriggerStrategy::OnTimer)).await;
        let now = Utc::now();
        manager.dispatch(1, 1.0, now).await;
        let flushed = manager.sweep_timeouts(now).await;
        assert!(flushed.is_empty());
    }

    #[tokio::test]
    async fn unregister_drops_pending_buffer() {
        let manager = BufferManager::new();
        manager.register(config(TriggerStrategy::OnChange)).await;
        manager.unregister(1).await;
        assert_eq!(manager.dispatch(1, 1.0, Utc::now()).await, None);
    }
}
