//! Background retention purge engine (§4.9).
//!
//! Every `interval_hours`, iterates active plants and, per characteristic,
//! resolves the effective retention policy and deletes stale samples in
//! batches of [`BATCH_SIZE`], one transaction per batch (`PgSampleRepository`
//! already scopes each `delete_*_batch` call to its own transaction). A
//! failure on one characteristic is recorded in its purge-history row and
//! the loop moves on to the next (§7 "Purge failures mark the run failed in
//! history and continue on the next characteristic").

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::db::models::{PurgeHistoryRow, RetentionType};
use crate::db::repositories::{
    CharacteristicRepository, HierarchyRepository, RetentionRepository, SampleRepository, ViolationRepository,
};
use crate::retention::policy::resolve_policy;
use crate::retention::Result;

/// Source (`original_source/backend/src/openspc/core/purge_engine.py`): samples
/// are deleted in fixed-size batches so a characteristic with years of
/// history never holds one giant transaction.
const BATCH_SIZE: i64 = 1000;

/// One plant/characteristic purge cycle's outcome, mostly useful for tests
/// and logging; the durable record is the `purge_history` row.
#[derive(Debug, Clone, PartialEq)]
pub struct PurgeOutcome {
    pub characteristic_id: i64,
    pub samples_deleted: i64,
}

pub struct PurgeEngine<C, H, R, S, V> {
    characteristics: Arc<C>,
    hierarchy: Arc<H>,
    retention: Arc<R>,
    samples: Arc<S>,
    violations: Arc<V>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl<C, H, R, S, V> PurgeEngine<C, H, R, S, V>
where
    C: CharacteristicRepository,
    H: HierarchyRepository,
    R: RetentionRepository,
    S: SampleRepository,
    V: ViolationRepository,
{
    pub fn new(characteristics: Arc<C>, hierarchy: Arc<H>, retention: Arc<R>, samples: Arc<S>, violations: Arc<V>, interval: Duration) -> Self {
        PurgeEngine {
            characteristics,
            hierarchy,
            retention,
            samples,
            violations,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// Runs the periodic loop until [`stop`](Self::stop) is called. Intended
    /// to be spawned as a background task at startup (§5 "Scheduling model").
    pub async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("purge_engine_stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "purge_cycle_failed");
                    }
                }
            }
        }
    }

    /// Runs one full purge cycle across every active plant's characteristics.
    pub async fn run_once(&self) -> Result<Vec<PurgeOutcome>> {
        let mut outcomes = Vec::new();
        for plant in self.hierarchy.active_plants().await? {
            let characteristics = self.hierarchy.characteristics_for_plant(plant.id).await?;
            for characteristic in characteristics {
                match self.purge_characteristic(plant.id, characteristic.id).await {
                    Ok(Some(outcome)) => outcomes.push(outcome),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(characteristic_id = characteristic.id, error = %e, "purge_characteristic_failed");
                    }
                }
            }
        }
        Ok(outcomes)
    }

    /// Resolves, records, and executes one characteristic's purge. Returns
    /// `None` for a `forever` policy (no history row is written, nothing to
    /// report: §4.9 step 2 "skip").
    async fn purge_characteristic(&self, plant_id: i64, characteristic_id: i64) -> Result<Option<PurgeOutcome>> {
        let resolved = resolve_policy(characteristic_id, &self.characteristics, &self.hierarchy, &self.retention).await?;

        if matches!(resolved.retention_type, RetentionType::Forever) {
            return Ok(None);
        }

        let started_at = Utc::now();
        let history_id = self
            .retention
            .record_purge_start(plant_id, characteristic_id, started_at)
            .await
            .map_err(crate::retention::Error::Database)?;

        // Reported before deletion so the history record reflects what was
        // at stake, even though CASCADE removes these rows along with the
        // samples that own them (§4.9 "violation counts... reported before
        // deletion").
        let violation_stats = self.violations.stats(Some(characteristic_id), None).await;
        if let Ok(stats) = &violation_stats {
            info!(characteristic_id, unacknowledged = stats.unacknowledged, total = stats.total, "purge_violation_snapshot");
        }

        let deletion = self.delete_stale(characteristic_id, resolved.retention_type).await;

        match deletion {
            Ok(samples_deleted) => {
                self.record_complete(history_id, samples_deleted, None).await?;
                Ok(Some(PurgeOutcome {
                    characteristic_id,
                    samples_deleted,
                }))
            }
            Err(e) => {
                self.record_complete(history_id, 0, Some(e.to_string())).await?;
                Err(e.into())
            }
        }
    }

    async fn delete_stale(&self, characteristic_id: i64, retention_type: RetentionType) -> crate::Result<i64> {
        match retention_type {
            RetentionType::Forever => Ok(0),
            RetentionType::SampleCount { value } => {
                let current = self.samples.count(characteristic_id).await?;
                let excess = current - value;
                if excess <= 0 {
                    return Ok(0);
                }
                self.delete_in_batches(excess, |batch_size| {
                    let samples = self.samples.clone();
                    Box::pin(async move { samples.delete_oldest_batch(characteristic_id, batch_size).await })
                })
                .await
            }
            RetentionType::TimeDelta { value, unit } => {
                let cutoff = Utc::now() - chrono::Duration::days(value * unit.days());
                let mut total = 0i64;
                loop {
                    let deleted = self.samples.delete_before_batch(characteristic_id, cutoff, BATCH_SIZE).await?;
                    total += deleted;
                    if deleted < BATCH_SIZE {
                        break;
                    }
                }
                Ok(total)
            }
        }
    }

    /// Deletes `remaining` rows `BATCH_SIZE` at a time, stopping early if a
    /// batch comes back short (nothing left to delete).
    async fn delete_in_batches<F>(&self, remaining: i64, delete_batch: F) -> crate::Result<i64>
    where
        F: Fn(i64) -> std::pin::Pin<Box<dyn std::future::Future<Output = crate::Result<i64>> + Send>>,
    {
        let mut left = remaining;
        let mut total = 0i64;
        while left > 0 {
            let batch_size = left.min(BATCH_SIZE);
            let deleted = delete_batch(batch_size).await?;
            total += deleted;
            left -= deleted;
            if deleted < batch_size {
                break;
            }
        }
        Ok(total)
    }

    async fn record_complete(&self, history_id: i64, samples_deleted: i64, error_message: Option<String>) -> Result<PurgeHistoryRow> {
        Ok(self
            .retention
            .record_purge_complete(history_id, Utc::now(), samples_deleted, error_message)
            .await
            .map_err(crate::retention::Error::Database)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use crate::db::models::{
        Characteristic, CharacteristicRule, HierarchyNode, Plant, RetentionPolicy, RetentionScope, Sample, TimeUnit,
    };
    use crate::db::repositories::{NewViolation, SubgroupStats, ViolationStats};
    use crate::rules::Severity;
    use crate::window::LoadedSample;

    struct FakeCharRepo {
        characteristics: HashMap<i64, Characteristic>,
    }

    #[async_trait]
    impl CharacteristicRepository for FakeCharRepo {
        async fn get(&self, characteristic_id: i64) -> crate::Result<Option<Characteristic>> {
            Ok(self.characteristics.get(&characteristic_id).cloned())
        }
        async fn rules(&self, _characteristic_id: i64) -> crate::Result<HashMap<u8, CharacteristicRule>> {
            Ok(HashMap::new())
        }
        async fn update_limits(&self, _: i64, _: f64, _: f64, _: f64, _: f64) -> crate::Result<()> {
            Ok(())
        }
    }

    struct FakeHierarchyRepo {
        plants: Vec<Plant>,
        characteristics: Vec<Characteristic>,
        node: HierarchyNode,
    }

    #[async_trait]
    impl HierarchyRepository for FakeHierarchyRepo {
        async fn get(&self, _hierarchy_node_id: i64) -> crate::Result<Option<HierarchyNode>> {
            Ok(Some(self.node.clone()))
        }
        async fn ancestors(&self, _hierarchy_node_id: i64) -> crate::Result<Vec<HierarchyNode>> {
            Ok(vec![])
        }
        async fn active_plants(&self) -> crate::Result<Vec<Plant>> {
            Ok(self.plants.clone())
        }
        async fn characteristics_for_plant(&self, _plant_id: i64) -> crate::Result<Vec<Characteristic>> {
            Ok(self.characteristics.clone())
        }
    }

    struct FakeRetentionRepo {
        policy: Option<RetentionPolicy>,
        completed: StdMutex<Vec<(i64, i64, Option<String>)>>,
    }

    #[async_trait]
    impl RetentionRepository for FakeRetentionRepo {
        async fn characteristic_policy(&self, _characteristic_id: i64) -> crate::Result<Option<RetentionPolicy>> {
            Ok(self.policy.clone())
        }
        async fn hierarchy_policy(&self, _hierarchy_node_id: i64) -> crate::Result<Option<RetentionPolicy>> {
            Ok(None)
        }
        async fn global_policy(&self, _plant_id: i64) -> crate::Result<Option<RetentionPolicy>> {
            Ok(None)
        }
        async fn record_purge_start(&self, _plant_id: i64, _characteristic_id: i64, _started_at: chrono::DateTime<Utc>) -> crate::Result<i64> {
            Ok(1)
        }
        async fn record_purge_complete(
            &self,
            history_id: i64,
            _completed_at: chrono::DateTime<Utc>,
            samples_deleted: i64,
            error_message: Option<String>,
        ) -> crate::Result<crate::db::models::PurgeHistoryRow> {
            self.completed.lock().unwrap().push((history_id, samples_deleted, error_message.clone()));
            Ok(crate::db::models::PurgeHistoryRow {
                id: history_id,
                plant_id: 1,
                characteristic_id: 1,
                started_at: Utc::now(),
                completed_at: Some(Utc::now()),
                samples_deleted,
                error_message,
            })
        }
    }

    #[derive(Default)]
    struct FakeSampleRepo {
        ages_days: StdMutex<Vec<i64>>,
    }

    #[async_trait]
    impl SampleRepository for FakeSampleRepo {
        async fn insert_with_measurements(&self, _: i64, timestamp: chrono::DateTime<Utc>, values: &[f64], _: Option<String>, _: Option<String>) -> crate::Result<Sample> {
            Ok(Sample {
                id: 1,
                characteristic_id: 1,
                timestamp,
                batch_number: None,
                operator_id: None,
                is_excluded: false,
                actual_n: values.len() as i32,
            })
        }
        async fn load_recent_samples(&self, _: i64, _: usize) -> crate::Result<Vec<LoadedSample>> {
            Ok(vec![])
        }
        async fn set_excluded(&self, _: i64, _: bool) -> crate::Result<()> {
            Ok(())
        }
        async fn count(&self, _characteristic_id: i64) -> crate::Result<i64> {
            Ok(self.ages_days.lock().unwrap().len() as i64)
        }
        async fn delete_oldest_batch(&self, _characteristic_id: i64, batch_size: i64) -> crate::Result<i64> {
            let mut ages = self.ages_days.lock().unwrap();
            ages.sort_unstable_by(|a, b| b.cmp(a));
            let to_delete = (batch_size as usize).min(ages.len());
            for _ in 0..to_delete {
                ages.pop();
            }
            Ok(to_delete as i64)
        }
        async fn delete_before_batch(&self, _characteristic_id: i64, cutoff: chrono::DateTime<Utc>, batch_size: i64) -> crate::Result<i64> {
            let cutoff_age_days = (Utc::now() - cutoff).num_days();
            let mut ages = self.ages_days.lock().unwrap();
            let mut deleted = 0i64;
            ages.retain(|age| {
                if deleted < batch_size && *age > cutoff_age_days {
                    deleted += 1;
                    false
                } else {
                    true
                }
            });
            Ok(deleted)
        }
        async fn load_subgroup_stats(&self, _: i64, _: usize, _: bool) -> crate::Result<Vec<SubgroupStats>> {
            Ok(vec![])
        }
    }

    #[derive(Default)]
    struct FakeViolationRepo;

    #[async_trait]
    impl ViolationRepository for FakeViolationRepo {
        async fn insert(&self, violation: NewViolation) -> crate::Result<crate::db::models::Violation> {
            Ok(crate::db::models::Violation {
                id: 1,
                sample_id: violation.sample_id,
                characteristic_id: violation.characteristic_id,
                rule_id: violation.rule_id,
                rule_name: violation.rule_name,
                severity: violation.severity,
                requires_acknowledgement: violation.requires_acknowledgement,
                acknowledged: false,
                ack_user: None,
                ack_reason: None,
                ack_timestamp: None,
            })
        }
        async fn get(&self, _violation_id: i64) -> crate::Result<Option<crate::db::models::Violation>> {
            Ok(None)
        }
        async fn acknowledge(&self, violation_id: i64, user: &str, reason: &str, at: chrono::DateTime<Utc>, _exclude_sample: bool) -> crate::Result<crate::db::models::Violation> {
            Ok(crate::db::models::Violation {
                id: violation_id,
                sample_id: 1,
                characteristic_id: 1,
                rule_id: 1,
                rule_name: "Outlier".to_string(),
                severity: Severity::Critical,
                requires_acknowledgement: true,
                acknowledged: true,
                ack_user: Some(user.to_string()),
                ack_reason: Some(reason.to_string()),
                ack_timestamp: Some(at),
            })
        }
        async fn stats(&self, _: Option<i64>, _: Option<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)>) -> crate::Result<ViolationStats> {
            Ok(ViolationStats::default())
        }
    }

    fn node() -> HierarchyNode {
        HierarchyNode {
            id: 10,
            plant_id: 1,
            parent_id: None,
            name: "line1".to_string(),
            node_type: "line".to_string(),
        }
    }

    fn characteristic() -> Characteristic {
        Characteristic {
            id: 1,
            hierarchy_node_id: 10,
            name: "bore diameter".to_string(),
            subgroup_size: 1,
            target: None,
            usl: None,
            lsl: None,
            center_line: None,
            ucl: None,
            lcl: None,
            sigma: None,
            allows_variable_n: false,
        }
    }

    #[tokio::test]
    async fn time_delta_policy_deletes_only_samples_older_than_cutoff() {
        let mut characteristics = HashMap::new();
        characteristics.insert(1, characteristic());
        let char_repo = Arc::new(FakeCharRepo { characteristics });
        let hierarchy = Arc::new(FakeHierarchyRepo {
            plants: vec![Plant { id: 1, name: "p".to_string(), code: "P1".to_string(), is_active: true }],
            characteristics: vec![characteristic()],
            node: node(),
        });
        let retention = Arc::new(FakeRetentionRepo {
            policy: Some(RetentionPolicy {
                id: 1,
                scope: RetentionScope::Characteristic,
                scope_id: 1,
                retention_type: RetentionType::TimeDelta { value: 7, unit: TimeUnit::Days },
            }),
            completed: StdMutex::new(vec![]),
        });
        let samples = Arc::new(FakeSampleRepo {
            ages_days: StdMutex::new(vec![3, 5, 10, 15]),
        });
        let violations = Arc::new(FakeViolationRepo);

        let engine = PurgeEngine::new(char_repo, hierarchy, retention.clone(), samples.clone(), violations, Duration::from_secs(3600));
        let outcomes = engine.run_once().await.unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].samples_deleted, 2);
        assert_eq!(samples.ages_days.lock().unwrap().len(), 2);
        assert_eq!(retention.completed.lock().unwrap().len(), 1);
        assert_eq!(retention.completed.lock().unwrap()[0].1, 2);
    }

    #[tokio::test]
    async fn forever_policy_is_skipped_with_no_history_row() {
        let mut characteristics = HashMap::new();
        characteristics.insert(1, characteristic());
        let char_repo = Arc::new(FakeCharRepo { characteristics });
        let hierarchy = Arc::new(FakeHierarchyRepo {
            plants: vec![Plant { id: 1, name: "p".to_string(), code: "P1".to_string(), is_active: true }],
            characteristics: vec![characteristic()],
            node: node(),
        });
        let retention = Arc::new(FakeRetentionRepo {
            policy: Some(RetentionPolicy {
                id: 1,
                scope: RetentionScope::Characteristic,
                scope_id: 1,
                retention_type: RetentionType::Forever,
            }),
            completed: StdMutex::new(vec![]),
        });
        let samples = Arc::new(FakeSampleRepo::default());
        let violations = Arc::new(FakeViolationRepo);

        let engine = PurgeEngine::new(char_repo, hierarchy, retention.clone(), samples, violations, Duration::from_secs(3600));
        let outcomes = engine.run_once().await.unwrap();

        assert!(outcomes.is_empty());
        assert!(retention.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sample_count_policy_deletes_oldest_excess() {
        let mut characteristics = HashMap::new();
        characteristics.insert(1, characteristic());
        let char_repo = Arc::new(FakeCharRepo { characteristics });
        let hierarchy = Arc::new(FakeHierarchyRepo {
            plants: vec![Plant { id: 1, name: "p".to_string(), code: "P1".to_string(), is_active: true }],
            characteristics: vec![characteristic()],
            node: node(),
        });
        let retention = Arc::new(FakeRetentionRepo {
            policy: Some(RetentionPolicy {
                id: 1,
                scope: RetentionScope::Characteristic,
                scope_id: 1,
                retention_type: RetentionType::SampleCount { value: 3 },
            }),
            completed: StdMutex::new(vec![]),
        });
        let samples = Arc::new(FakeSampleRepo {
            ages_days: StdMutex::new(vec![1, 2, 3, 4, 5]),
        });
        let violations = Arc::new(FakeViolationRepo);

        let engine = PurgeEngine::new(char_repo, hierarchy, retention, samples.clone(), violations, Duration::from_secs(3600));
        let outcomes = engine.run_once().await.unwrap();

        assert_eq!(outcomes[0].samples_deleted, 2);
        assert_eq!(samples.ages_days.lock().unwrap().len(), 3);
    }
}
