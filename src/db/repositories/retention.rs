//! Retention policy reads and purge-history writes (§4.9).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;

use crate::db::models::{PurgeHistoryRow, RetentionPolicy, RetentionScope, RetentionType, TimeUnit};
use crate::error::Result;

#[async_trait]
pub trait RetentionRepository: Send + Sync {
    async fn characteristic_policy(&self, characteristic_id: i64) -> Result<Option<RetentionPolicy>>;

    async fn hierarchy_policy(&self, hierarchy_node_id: i64) -> Result<Option<RetentionPolicy>>;

    async fn global_policy(&self, plant_id: i64) -> Result<Option<RetentionPolicy>>;

    async fn record_purge_start(
        &self,
        plant_id: i64,
        characteristic_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<i64>;

    async fn record_purge_complete(
        &self,
        history_id: i64,
        completed_at: DateTime<Utc>,
        samples_deleted: i64,
        error_message: Option<String>,
    ) -> Result<PurgeHistoryRow>;
}

pub struct PgRetentionRepository {
    pool: Arc<Pool>,
}

impl PgRetentionRepository {
    pub fn new(pool: Arc<Pool>) -> Self {
        PgRetentionRepository { pool }
    }
}

fn retention_type_from_row(row: &tokio_postgres::Row) -> RetentionType {
    let kind: String = row.get("retention_type");
    match kind.as_str() {
        "sample_count" => RetentionType::SampleCount {
            value: row.get("value"),
        },
        "time_delta" => {
            let unit: String = row.get("unit");
            let unit = match unit.as_str() {
                "weeks" => TimeUnit::Weeks,
                "months" => TimeUnit::Months,
                "years" => TimeUnit::Years,
                _ => TimeUnit::Days,
            };
            RetentionType::TimeDelta {
                value: row.get("value"),
                unit,
            }
        }
        _ => RetentionType::Forever,
    }
}

async fn query_policy(
    client: &deadpool_postgres::Client,
    scope: RetentionScope,
    scope_column: &str,
    scope_id: i64,
) -> Result<Option<RetentionPolicy>> {
    let scope_str = match scope {
        RetentionScope::Global => "global",
        RetentionScope::Hierarchy => "hierarchy",
        RetentionScope::Characteristic => "characteristic",
    };
    let sql = format!(
        "SELECT id, {scope_column} AS scope_id, retention_type, value, unit \
         FROM retention_policy WHERE scope = $1 AND {scope_column} = $2"
    );
    let row = client.query_opt(&sql, &[&scope_str, &scope_id]).await?;
    Ok(row.map(|row| RetentionPolicy {
        id: row.get("id"),
        scope,
        scope_id: row.get("scope_id"),
        retention_type: retention_type_from_row(&row),
    }))
}

#[async_trait]
impl RetentionRepository for PgRetentionRepository {
    async fn characteristic_policy(&self, characteristic_id: i64) -> Result<Option<RetentionPolicy>> {
        let client = self.pool.get().await?;
        query_policy(
            &client,
            RetentionScope::Characteristic,
            "characteristic_id",
            characteristic_id,
        )
        .await
    }

    async fn hierarchy_policy(&self, hierarchy_node_id: i64) -> Result<Option<RetentionPolicy>> {
        let client = self.pool.get().await?;
        query_policy(
            &client,
            RetentionScope::Hierarchy,
            "hierarchy_node_id",
            hierarchy_node_id,
        )
        .await
    }

    async fn global_policy(&self, plant_id: i64) -> Result<Option<RetentionPolicy>> {
        let client = self.pool.get().await?;
        query_policy(&client, RetentionScope::Global, "plant_id", plant_id).await
    }

    async fn record_purge_start(
        &self,
        plant_id: i64,
        characteristic_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO purge_history (plant_id, characteristic_id, started_at, samples_deleted) \
                 VALUES ($1, $2, $3, 0) RETURNING id",
                &[&plant_id, &characteristic_id, &started_at],
            )
            .await?;
        Ok(row.get("id"))
    }

    async fn record_purge_complete(
        &self,
        history_id: i64,
        completed_at: DateTime<Utc>,
        samples_deleted: i64,
        error_message: Option<String>,
    ) -> Result<PurgeHistoryRow> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "UPDATE purge_history SET completed_at = $2, samples_deleted = $3, error_message = $4 \
                 WHERE id = $1 \
                 RETURNING id, plant_id, characteristic_id, started_at, completed_at, samples_deleted, error_message",
                &[&history_id, &completed_at, &samples_deleted, &error_message],
            )
            .await?;
        Ok(PurgeHistoryRow {
            id: row.get("id"),
            plant_id: row.get("plant_id"),
            characteristic_id: row.get("characteristic_id"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            samples_deleted: row.get("samples_deleted"),
            error_message: row.get("error_message"),
        })
    }
}
