//! Violation bookkeeping and acknowledgement (§4.8).
//!
//! A thin orchestrator around the violation table: creates violations from
//! triggered [`RuleResult`]s, acknowledges them, and fans both operations out
//! to registered [`AlertNotifier`]s. Violation lifecycle events are pushed to
//! notifiers directly rather than through [`crate::events::EventBus`] — see
//! `DESIGN.md` for why the split exists.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::db::models::{CharacteristicRule, Violation};
use crate::db::repositories::{NewViolation, ViolationRepository, ViolationStats};
use crate::rules::RuleResult;

/// A violation just created, delivered to every registered notifier.
#[derive(Debug, Clone, Serialize)]
pub struct ViolationCreatedEvent {
    pub violation: Violation,
    pub timestamp: DateTime<Utc>,
}

/// A violation just acknowledged, delivered to every registered notifier.
#[derive(Debug, Clone, Serialize)]
pub struct ViolationAcknowledgedEvent {
    pub violation: Violation,
    pub timestamp: DateTime<Utc>,
}

/// A sink for violation lifecycle events (§4.7). Implemented by the
/// live-subscriber broadcaster and the outbound publisher, both of which
/// register themselves with an [`AlertManager`] at startup.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn on_violation_created(&self, event: ViolationCreatedEvent);
    async fn on_violation_acknowledged(&self, event: ViolationAcknowledgedEvent);
}

/// Orchestrates violation creation, acknowledgement, and the statistics
/// rollup, generic over the repository trait so tests can substitute a fake
/// for a live database.
pub struct AlertManager<V> {
    violations: Arc<V>,
    notifiers: RwLock<Vec<Arc<dyn AlertNotifier>>>,
}

impl<V> AlertManager<V>
where
    V: ViolationRepository,
{
    pub fn new(violations: Arc<V>) -> Self {
        AlertManager {
            violations,
            notifiers: RwLock::new(Vec::new()),
        }
    }

    pub async fn register_notifier(&self, notifier: Arc<dyn AlertNotifier>) {
        self.notifiers.write().await.push(notifier);
    }

    /// Inserts a violation for every triggered rule result and notifies
    /// registered notifiers (§4.6 step 8, §4.8). `rules` supplies each rule's
    /// configured `requires_acknowledgement`; a rule absent from the map
    /// (shouldn't happen for a triggered rule, since triggering implies it
    /// was enabled) defaults to not requiring acknowledgement.
    pub async fn record_violations(
        &self,
        characteristic_id: i64,
        sample_id: i64,
        fired: &[RuleResult],
        rules: &HashMap<u8, CharacteristicRule>,
    ) -> crate::Result<Vec<Violation>> {
        let mut created = Vec::with_capacity(fired.len());
        for result in fired.iter().filter(|r| r.triggered) {
            let requires_acknowledgement = rules
                .get(&result.rule_id)
                .map(|r| r.requires_acknowledgement)
                .unwrap_or(false);
            let violation = self
                .violations
                .insert(NewViolation {
                    sample_id,
                    characteristic_id,
                    rule_id: result.rule_id,
                    rule_name: result.rule_name.to_string(),
                    severity: result.severity,
                    requires_acknowledgement,
                })
                .await?;
            self.notify_created(violation.clone()).await;
            created.push(violation);
        }
        Ok(created)
    }

    async fn notify_created(&self, violation: Violation) {
        let event = ViolationCreatedEvent {
            violation,
            timestamp: Utc::now(),
        };
        for notifier in self.notifiers.read().await.iter() {
            notifier.on_violation_created(event.clone()).await;
        }
    }

    /// Acknowledges a violation and, if `exclude_sample` is set, marks its
    /// sample excluded from future limit recomputation — the sample itself
    /// is retained. Both the ack fields and the exclusion flip happen in the
    /// repository's single transaction (§4.6 "Acknowledgement").
    pub async fn acknowledge(
        &self,
        violation_id: i64,
        user: &str,
        reason: &str,
        exclude_sample: bool,
    ) -> crate::Result<Violation> {
        let violation = self
            .violations
            .acknowledge(violation_id, user, reason, Utc::now(), exclude_sample)
            .await?;
        let event = ViolationAcknowledgedEvent {
            violation: violation.clone(),
            timestamp: Utc::now(),
        };
        for notifier in self.notifiers.read().await.iter() {
            notifier.on_violation_acknowledged(event.clone()).await;
        }
        Ok(violation)
    }

    /// The violation statistics rollup (§4.8), optionally filtered.
    pub async fn stats(
        &self,
        characteristic_id: Option<i64>,
        date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> crate::Result<ViolationStats> {
        self.violations.stats(characteristic_id, date_range).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex as StdMutex;

    use crate::rules::Severity;

    #[derive(Default)]
    struct FakeViolationRepo {
        next_id: AtomicI64,
        inserted: StdMutex<Vec<NewViolation>>,
        acked: StdMutex<Vec<i64>>,
        excluded: StdMutex<Vec<(i64, bool)>>,
    }

    #[async_trait]
    impl ViolationRepository for FakeViolationRepo {
        async fn insert(&self, violation: NewViolation) -> crate::Result<Violation> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.inserted.lock().unwrap().push(violation.clone());
            Ok(Violation {
                id,
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

        async fn get(&self, _violation_id: i64) -> crate::Result<Option<Violation>> {
            Ok(None)
        }

        async fn acknowledge(
            &self,
            violation_id: i64,
            user: &str,
            reason: &str,
            at: DateTime<Utc>,
            exclude_sample: bool,
        ) -> crate::Result<Violation> {
            self.acked.lock().unwrap().push(violation_id);
            self.excluded.lock().unwrap().push((1, exclude_sample));
            Ok(Violation {
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

        async fn stats(
            &self,
            _characteristic_id: Option<i64>,
            _date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        ) -> crate::Result<ViolationStats> {
            Ok(ViolationStats::default())
        }
    }

    struct RecordingNotifier {
        created: StdMutex<Vec<Violation>>,
        acked: StdMutex<Vec<Violation>>,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            RecordingNotifier {
                created: StdMutex::new(Vec::new()),
                acked: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AlertNotifier for RecordingNotifier {
        async fn on_violation_created(&self, event: ViolationCreatedEvent) {
            self.created.lock().unwrap().push(event.violation);
        }

        async fn on_violation_acknowledged(&self, event: ViolationAcknowledgedEvent) {
            self.acked.lock().unwrap().push(event.violation);
        }
    }

    fn rule_result(rule_id: u8, triggered: bool) -> RuleResult {
        RuleResult {
            rule_id,
            rule_name: "Outlier",
            severity: Severity::Critical,
            triggered,
            involved_sample_ids: vec![1],
            message: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn record_violations_skips_untriggered_rules() {
        let manager = AlertManager::new(Arc::new(FakeViolationRepo::default()));
        let fired = vec![rule_result(1, true), rule_result(2, false)];
        let created = manager
            .record_violations(1, 1, &fired, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].rule_id, 1);
    }

    #[tokio::test]
    async fn record_violations_notifies_registered_notifiers() {
        let manager = AlertManager::new(Arc::new(FakeViolationRepo::default()));
        let notifier = Arc::new(RecordingNotifier::new());
        manager.register_notifier(notifier.clone()).await;

        manager
            .record_violations(1, 1, &[rule_result(1, true)], &HashMap::new())
            .await
            .unwrap();

        assert_eq!(notifier.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn acknowledge_optionally_excludes_the_sample() {
        let violations = Arc::new(FakeViolationRepo::default());
        let manager = AlertManager::new(violations.clone());

        manager.acknowledge(1, "qa", "false alarm", true).await.unwrap();

        assert_eq!(violations.excluded.lock().unwrap().as_slice(), &[(1, true)]);
    }

    #[tokio::test]
    async fn acknowledge_without_exclusion_leaves_sample_untouched() {
        let violations = Arc::new(FakeViolationRepo::default());
        let manager = AlertManager::new(violations.clone());

        manager.acknowledge(1, "qa", "confirmed", false).await.unwrap();

        assert_eq!(violations.excluded.lock().unwrap().as_slice(), &[(1, false)]);
    }
}
