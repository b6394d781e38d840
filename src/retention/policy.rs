//! Retention policy resolution by inheritance (§4.9 step 1, §8 testable
//! property 8): characteristic override → nearest hierarchy ancestor →
//! plant-global default → implicit `forever`. The first match wins.

use std::sync::Arc;

use crate::db::models::{PolicySource, ResolvedPolicy, RetentionType};
use crate::db::repositories::{CharacteristicRepository, HierarchyRepository, RetentionRepository};
use crate::retention::{Error, Result};

/// Resolves the effective retention policy for one characteristic.
pub async fn resolve_policy<C, H, R>(
    characteristic_id: i64,
    characteristics: &Arc<C>,
    hierarchy: &Arc<H>,
    retention: &Arc<R>,
) -> Result<ResolvedPolicy>
where
    C: CharacteristicRepository,
    H: HierarchyRepository,
    R: RetentionRepository,
{
    if let Some(policy) = retention.characteristic_policy(characteristic_id).await? {
        return Ok(ResolvedPolicy {
            retention_type: policy.retention_type,
            source: PolicySource::Characteristic,
            source_id: Some(characteristic_id),
        });
    }

    let characteristic = characteristics
        .get(characteristic_id)
        .await?
        .ok_or_else(|| Error::Database(crate::Error::NotFound(format!("characteristic {characteristic_id}"))))?;

    let node = hierarchy
        .get(characteristic.hierarchy_node_id)
        .await?
        .ok_or(Error::HierarchyNodeNotFound(characteristic.hierarchy_node_id))?;

    // The node that owns the characteristic counts as the nearest hierarchy
    // level, so it's checked before walking further up via `ancestors`.
    if let Some(policy) = retention.hierarchy_policy(node.id).await? {
        return Ok(ResolvedPolicy {
            retention_type: policy.retention_type,
            source: PolicySource::Hierarchy,
            source_id: Some(node.id),
        });
    }

    for ancestor in hierarchy.ancestors(node.id).await? {
        if let Some(policy) = retention.hierarchy_policy(ancestor.id).await? {
            return Ok(ResolvedPolicy {
                retention_type: policy.retention_type,
                source: PolicySource::Hierarchy,
                source_id: Some(ancestor.id),
            });
        }
    }

    if let Some(policy) = retention.global_policy(node.plant_id).await? {
        return Ok(ResolvedPolicy {
            retention_type: policy.retention_type,
            source: PolicySource::Global,
            source_id: Some(node.plant_id),
        });
    }

    Ok(ResolvedPolicy {
        retention_type: RetentionType::Forever,
        source: PolicySource::Default,
        source_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    use crate::db::models::{Characteristic, CharacteristicRule, HierarchyNode, Plant, RetentionPolicy, RetentionScope};

    struct FakeCharRepo {
        characteristic: Characteristic,
    }

    #[async_trait]
    impl CharacteristicRepository for FakeCharRepo {
        async fn get(&self, _characteristic_id: i64) -> crate::Result<Option<Characteristic>> {
            Ok(Some(self.characteristic.clone()))
        }
        async fn rules(&self, _characteristic_id: i64) -> crate::Result<HashMap<u8, CharacteristicRule>> {
            Ok(HashMap::new())
        }
        async fn update_limits(&self, _: i64, _: f64, _: f64, _: f64, _: f64) -> crate::Result<()> {
            Ok(())
        }
    }

    struct FakeHierarchyRepo {
        nodes: HashMap<i64, HierarchyNode>,
        chain: Vec<i64>,
    }

    #[async_trait]
    impl HierarchyRepository for FakeHierarchyRepo {
        async fn get(&self, hierarchy_node_id: i64) -> crate::Result<Option<HierarchyNode>> {
            Ok(self.nodes.get(&hierarchy_node_id).cloned())
        }
        async fn ancestors(&self, _hierarchy_node_id: i64) -> crate::Result<Vec<HierarchyNode>> {
            Ok(self.chain.iter().filter_map(|id| self.nodes.get(id).cloned()).collect())
        }
        async fn active_plants(&self) -> crate::Result<Vec<Plant>> {
            Ok(vec![])
        }
        async fn characteristics_for_plant(&self, _plant_id: i64) -> crate::Result<Vec<Characteristic>> {
            Ok(vec![])
        }
    }

    struct FakeRetentionRepo {
        char_policy: Option<RetentionPolicy>,
        hierarchy_policies: HashMap<i64, RetentionPolicy>,
        global_policy: Option<RetentionPolicy>,
    }

    #[async_trait]
    impl RetentionRepository for FakeRetentionRepo {
        async fn characteristic_policy(&self, _characteristic_id: i64) -> crate::Result<Option<RetentionPolicy>> {
            Ok(self.char_policy.clone())
        }
        async fn hierarchy_policy(&self, hierarchy_node_id: i64) -> crate::Result<Option<RetentionPolicy>> {
            Ok(self.hierarchy_policies.get(&hierarchy_node_id).cloned())
        }
        async fn global_policy(&self, _plant_id: i64) -> crate::Result<Option<RetentionPolicy>> {
            Ok(self.global_policy.clone())
        }
        async fn record_purge_start(
            &self,
            _plant_id: i64,
            _characteristic_id: i64,
            _started_at: chrono::DateTime<chrono::Utc>,
        ) -> crate::Result<i64> {
            Ok(1)
        }
        async fn record_purge_complete(
            &self,
            _history_id: i64,
            _completed_at: chrono::DateTime<chrono::Utc>,
            _samples_deleted: i64,
            _error_message: Option<String>,
        ) -> crate::Result<crate::db::models::PurgeHistoryRow> {
            unreachable!("not exercised here")
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

    fn node(id: i64, plant_id: i64, parent_id: Option<i64>) -> HierarchyNode {
        HierarchyNode {
            id,
            plant_id,
            parent_id,
            name: format!("node-{id}"),
            node_type: "line".to_string(),
        }
    }

    fn policy(id: i64, scope: RetentionScope, scope_id: i64, retention_type: RetentionType) -> RetentionPolicy {
        RetentionPolicy {
            id,
            scope,
            scope_id,
            retention_type,
        }
    }

    #[tokio::test]
    async fn characteristic_override_wins_over_everything_else() {
        let chars = Arc::new(FakeCharRepo { characteristic: characteristic() });
        let mut nodes = HashMap::new();
        nodes.insert(10, node(10, 1, Some(5)));
        let hierarchy = Arc::new(FakeHierarchyRepo { nodes, chain: vec![5] });
        let retention = Arc::new(FakeRetentionRepo {
            char_policy: Some(policy(1, RetentionScope::Characteristic, 1, RetentionType::SampleCount { value: 100 })),
            hierarchy_policies: HashMap::new(),
            global_policy: None,
        });

        let resolved = resolve_policy(1, &chars, &hierarchy, &retention).await.unwrap();
        assert_eq!(resolved.source, PolicySource::Characteristic);
        assert_eq!(resolved.retention_type, RetentionType::SampleCount { value: 100 });
    }

    #[tokio::test]
    async fn nearest_ancestor_wins_over_plant_global() {
        let chars = Arc::new(FakeCharRepo { characteristic: characteristic() });
        let mut nodes = HashMap::new();
        nodes.insert(10, node(10, 1, Some(5)));
        nodes.insert(5, node(5, 1, Some(2)));
        nodes.insert(2, node(2, 1, None));
        let hierarchy = Arc::new(FakeHierarchyRepo { nodes, chain: vec![5, 2] });
        let mut hierarchy_policies = HashMap::new();
        hierarchy_policies.insert(5, policy(2, RetentionScope::Hierarchy, 5, RetentionType::TimeDelta { value: 7, unit: crate::db::models::TimeUnit::Days }));
        let retention = Arc::new(FakeRetentionRepo {
            char_policy: None,
            hierarchy_policies,
            global_policy: Some(policy(3, RetentionScope::Global, 1, RetentionType::Forever)),
        });

        let resolved = resolve_policy(1, &chars, &hierarchy, &retention).await.unwrap();
        assert_eq!(resolved.source, PolicySource::Hierarchy);
        assert_eq!(resolved.source_id, Some(5));
    }

    #[tokio::test]
    async fn falls_back_to_plant_global_then_default() {
        let chars = Arc::new(FakeCharRepo { characteristic: characteristic() });
        let mut nodes = HashMap::new();
        nodes.insert(10, node(10, 1, None));
        let hierarchy = Arc::new(FakeHierarchyRepo { nodes, chain: vec![] });

        let retention_with_global = Arc::new(FakeRetentionRepo {
            char_policy: None,
            hierarchy_policies: HashMap::new(),
            global_policy: Some(policy(3, RetentionScope::Global, 1, RetentionType::SampleCount { value: 500 })),
        });
        let resolved = resolve_policy(1, &chars, &hierarchy, &retention_with_global).await.unwrap();
        assert_eq!(resolved.source, PolicySource::Global);

        let retention_without_any = Arc::new(FakeRetentionRepo {
            char_policy: None,
            hierarchy_policies: HashMap::new(),
            global_policy: None,
        });
        let resolved = resolve_policy(1, &chars, &hierarchy, &retention_without_any).await.unwrap();
        assert_eq!(resolved.source, PolicySource::Default);
        assert_eq!(resolved.retention_type, RetentionType::Forever);
    }
}
