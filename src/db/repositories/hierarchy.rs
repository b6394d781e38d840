//! Hierarchy and plant reads, including ancestor walks (§4.9 "Cycles" note,
//! §4.9 retention inheritance).

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::Pool;

use crate::db::models::{Characteristic, HierarchyNode, Plant};
use crate::error::Result;

#[async_trait]
pub trait HierarchyRepository: Send + Sync {
    async fn get(&self, hierarchy_node_id: i64) -> Result<Option<HierarchyNode>>;

    /// Ancestors of `hierarchy_node_id`, nearest first, not including the
    /// node itself. Walks `parent_id` rather than trusting a DB-enforced
    /// invariant (`spec.md` §9: "do not rely on the DB to prevent cycles").
    async fn ancestors(&self, hierarchy_node_id: i64) -> Result<Vec<HierarchyNode>>;

    async fn active_plants(&self) -> Result<Vec<Plant>>;

    async fn characteristics_for_plant(&self, plant_id: i64) -> Result<Vec<Characteristic>>;

    /// A single plant by id, for topic-path construction (§6 "Egress: MQTT
    /// outbound re-publish").
    async fn get_plant(&self, plant_id: i64) -> Result<Option<Plant>>;

    async fn get_characteristic(&self, characteristic_id: i64) -> Result<Option<Characteristic>>;
}

pub struct PgHierarchyRepository {
    pool: Arc<Pool>,
}

impl PgHierarchyRepository {
    pub fn new(pool: Arc<Pool>) -> Self {
        PgHierarchyRepository { pool }
    }
}

fn row_to_node(row: &tokio_postgres::Row) -> HierarchyNode {
    HierarchyNode {
        id: row.get("id"),
        plant_id: row.get("plant_id"),
        parent_id: row.get("parent_id"),
        name: row.get("name"),
        node_type: row.get("node_type"),
    }
}

#[async_trait]
impl HierarchyRepository for PgHierarchyRepository {
    async fn get(&self, hierarchy_node_id: i64) -> Result<Option<HierarchyNode>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, plant_id, parent_id, name, node_type FROM hierarchy_node WHERE id = $1",
                &[&hierarchy_node_id],
            )
            .await?;
        Ok(row.map(|r| row_to_node(&r)))
    }

    async fn ancestors(&self, hierarchy_node_id: i64) -> Result<Vec<HierarchyNode>> {
        let client = self.pool.get().await?;
        let mut chain = Vec::new();
        let mut visited = std::collections::HashSet::new();
        let mut current_id = hierarchy_node_id;
        // Bounded by a generous depth cap rather than trusting the DB to
        // have no cycles; a cycle would otherwise loop forever here.
        for _ in 0..64 {
            if !visited.insert(current_id) {
                break;
            }
            let row = client
                .query_opt(
                    "SELECT id, plant_id, parent_id, name, node_type FROM hierarchy_node WHERE id = $1",
                    &[&current_id],
                )
                .await?;
            let Some(row) = row else { break };
            let Some(parent_id) = row.get::<_, Option<i64>>("parent_id") else {
                break;
            };
            let parent_row = client
                .query_opt(
                    "SELECT id, plant_id, parent_id, name, node_type FROM hierarchy_node WHERE id = $1",
                    &[&parent_id],
                )
                .await?;
            let Some(parent_row) = parent_row else { break };
            let parent = row_to_node(&parent_row);
            current_id = parent.id;
            chain.push(parent);
        }
        Ok(chain)
    }

    async fn active_plants(&self) -> Result<Vec<Plant>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, name, code, is_active FROM plant WHERE is_active = true",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Plant {
                id: row.get("id"),
                name: row.get("name"),
                code: row.get("code"),
                is_active: row.get("is_active"),
            })
            .collect())
    }

    async fn characteristics_for_plant(&self, plant_id: i64) -> Result<Vec<Characteristic>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT c.id, c.hierarchy_node_id, c.name, c.subgroup_size, c.target, c.usl, \
                        c.lsl, c.center_line, c.ucl, c.lcl, c.sigma, c.allows_variable_n \
                 FROM characteristic c JOIN hierarchy_node h ON h.id = c.hierarchy_node_id \
                 WHERE h.plant_id = $1",
                &[&plant_id],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Characteristic {
                id: row.get("id"),
                hierarchy_node_id: row.get("hierarchy_node_id"),
                name: row.get("name"),
                subgroup_size: row.get("subgroup_size"),
                target: row.get("target"),
                usl: row.get("usl"),
                lsl: row.get("lsl"),
                center_line: row.get("center_line"),
                ucl: row.get("ucl"),
                lcl: row.get("lcl"),
                sigma: row.get("sigma"),
                allows_variable_n: row.get("allows_variable_n"),
            })
            .collect())
    }

    async fn get_plant(&self, plant_id: i64) -> Result<Option<Plant>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT id, name, code, is_active FROM plant WHERE id = $1", &[&plant_id])
            .await?;
        Ok(row.map(|row| Plant {
            id: row.get("id"),
            name: row.get("name"),
            code: row.get("code"),
            is_active: row.get("is_active"),
        }))
    }

    async fn get_characteristic(&self, characteristic_id: i64) -> Result<Option<Characteristic>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, hierarchy_node_id, name, subgroup_size, target, usl, lsl, \
                 center_line, ucl, lcl, sigma, allows_variable_n \
                 FROM characteristic WHERE id = $1",
                &[&characteristic_id],
            )
            .await?;
        Ok(row.map(|row| Characteristic {
            id: row.get("id"),
            hierarchy_node_id: row.get("hierarchy_node_id"),
            name: row.get("name"),
            subgroup_size: row.get("subgroup_size"),
            target: row.get("target"),
            usl: row.get("usl"),
            lsl: row.get("lsl"),
            center_line: row.get("center_line"),
            ucl: row.get("ucl"),
            lcl: row.get("lcl"),
            sigma: row.get("sigma"),
            allows_variable_n: row.get("allows_variable_n"),
        }))
    }
}
