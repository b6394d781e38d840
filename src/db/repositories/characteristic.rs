//! Characteristic lookups and limit writes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::Pool;

use crate::db::models::{Characteristic, CharacteristicRule};
use crate::error::Result;

#[async_trait]
pub trait CharacteristicRepository: Send + Sync {
    async fn get(&self, characteristic_id: i64) -> Result<Option<Characteristic>>;

    /// The rules configured for a characteristic, keyed by rule id. Rules
    /// absent from the map are treated as disabled.
    async fn rules(&self, characteristic_id: i64) -> Result<HashMap<u8, CharacteristicRule>>;

    async fn update_limits(
        &self,
        characteristic_id: i64,
        center_line: f64,
        ucl: f64,
        lcl: f64,
        sigma: f64,
    ) -> Result<()>;
}

pub struct PgCharacteristicRepository {
    pool: Arc<Pool>,
}

impl PgCharacteristicRepository {
    pub fn new(pool: Arc<Pool>) -> Self {
        PgCharacteristicRepository { pool }
    }
}

#[async_trait]
impl CharacteristicRepository for PgCharacteristicRepository {
    async fn get(&self, characteristic_id: i64) -> Result<Option<Characteristic>> {
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

    async fn rules(&self, characteristic_id: i64) -> Result<HashMap<u8, CharacteristicRule>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT rule_id, enabled, requires_acknowledgement \
                 FROM characteristic_rule WHERE characteristic_id = $1",
                &[&characteristic_id],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let rule_id: i16 = row.get("rule_id");
                let rule_id = rule_id as u8;
                (
                    rule_id,
                    CharacteristicRule {
                        characteristic_id,
                        rule_id,
                        enabled: row.get("enabled"),
                        requires_acknowledgement: row.get("requires_acknowledgement"),
                    },
                )
            })
            .collect())
    }

    async fn update_limits(
        &self,
        characteristic_id: i64,
        center_line: f64,
        ucl: f64,
        lcl: f64,
        sigma: f64,
    ) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE characteristic SET center_line = $2, ucl = $3, lcl = $4, sigma = $5 \
                 WHERE id = $1",
                &[&characteristic_id, &center_line, &ucl, &lcl, &sigma],
            )
            .await?;
        Ok(())
    }
}
