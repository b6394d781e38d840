//! Sample + measurement persistence, and the read paths the window manager
//! and retention engine need.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;

use crate::db::models::Sample;
use crate::error::Result;
use crate::window::LoadedSample;

/// One historical subgroup's derived statistics, as needed by
/// `recalculate_limits` (§4.6) — mean and range/std-dev per subgroup, not the
/// raw measurements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubgroupStats {
    pub mean: f64,
    pub range: Option<f64>,
    pub std_dev: Option<f64>,
}

#[async_trait]
pub trait SampleRepository: Send + Sync {
    /// Inserts a sample and its measurement children atomically and returns
    /// the persisted `Sample` (§4.6 step 3).
    async fn insert_with_measurements(
        &self,
        characteristic_id: i64,
        timestamp: DateTime<Utc>,
        values: &[f64],
        batch_number: Option<String>,
        operator_id: Option<String>,
    ) -> Result<Sample>;

    async fn load_recent_samples(
        &self,
        characteristic_id: i64,
        limit: usize,
    ) -> Result<Vec<LoadedSample>>;

    /// Sets `is_excluded`; never mutates any other sample field (§3 lifecycle).
    async fn set_excluded(&self, sample_id: i64, excluded: bool) -> Result<()>;

    async fn count(&self, characteristic_id: i64) -> Result<i64>;

    /// Deletes up to `batch_size` of the oldest samples for a characteristic.
    /// Returns the number actually deleted.
    async fn delete_oldest_batch(&self, characteristic_id: i64, batch_size: i64) -> Result<i64>;

    /// Deletes up to `batch_size` samples older than `cutoff`.
    async fn delete_before_batch(
        &self,
        characteristic_id: i64,
        cutoff: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<i64>;

    /// Per-subgroup mean/range/std-dev for the most recent `limit` samples,
    /// oldest first, optionally skipping `is_excluded` ones.
    async fn load_subgroup_stats(
        &self,
        characteristic_id: i64,
        limit: usize,
        exclude_excluded: bool,
    ) -> Result<Vec<SubgroupStats>>;
}

pub struct PgSampleRepository {
    pool: Arc<Pool>,
}

impl PgSampleRepository {
    pub fn new(pool: Arc<Pool>) -> Self {
        PgSampleRepository { pool }
    }
}

#[async_trait]
impl SampleRepository for PgSampleRepository {
    async fn insert_with_measurements(
        &self,
        characteristic_id: i64,
        timestamp: DateTime<Utc>,
        values: &[f64],
        batch_number: Option<String>,
        operator_id: Option<String>,
    ) -> Result<Sample> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;

        let actual_n = values.len() as i32;
        let row = txn
            .query_one(
                "INSERT INTO sample \
                 (characteristic_id, timestamp, batch_number, operator_id, is_excluded, actual_n) \
                 VALUES ($1, $2, $3, $4, false, $5) \
                 RETURNING id",
                &[&characteristic_id, &timestamp, &batch_number, &operator_id, &actual_n],
            )
            .await?;
        let sample_id: i64 = row.get("id");

        for (sequence, value) in values.iter().enumerate() {
            txn.execute(
                "INSERT INTO measurement (sample_id, value, sequence) VALUES ($1, $2, $3)",
                &[&sample_id, value, &(sequence as i32)],
            )
            .await?;
        }

        txn.commit().await?;

        Ok(Sample {
            id: sample_id,
            characteristic_id,
            timestamp,
            batch_number,
            operator_id,
            is_excluded: false,
            actual_n,
        })
    }

    async fn load_recent_samples(
        &self,
        characteristic_id: i64,
        limit: usize,
    ) -> Result<Vec<LoadedSample>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT s.id, s.timestamp, s.is_excluded, \
                        AVG(m.value) AS mean, \
                        (MAX(m.value) - MIN(m.value)) AS range, \
                        COUNT(m.value) AS n \
                 FROM sample s JOIN measurement m ON m.sample_id = s.id \
                 WHERE s.characteristic_id = $1 \
                 GROUP BY s.id, s.timestamp, s.is_excluded \
                 ORDER BY s.timestamp DESC \
                 LIMIT $2",
                &[&characteristic_id, &(limit as i64)],
            )
            .await?;

        let mut samples: Vec<LoadedSample> = rows
            .into_iter()
            .map(|row| {
                let n: i64 = row.get("n");
                LoadedSample {
                    sample_id: row.get("id"),
                    timestamp: row.get("timestamp"),
                    value: row.get("mean"),
                    range: if n > 1 { row.get("range") } else { None },
                    is_excluded: row.get("is_excluded"),
                }
            })
            .collect();
        samples.reverse(); // oldest first, matching RollingWindow::append order
        Ok(samples)
    }

    async fn set_excluded(&self, sample_id: i64, excluded: bool) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE sample SET is_excluded = $2 WHERE id = $1",
                &[&sample_id, &excluded],
            )
            .await?;
        Ok(())
    }

    async fn count(&self, characteristic_id: i64) -> Result<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) AS n FROM sample WHERE characteristic_id = $1",
                &[&characteristic_id],
            )
            .await?;
        Ok(row.get("n"))
    }

    async fn delete_oldest_batch(&self, characteristic_id: i64, batch_size: i64) -> Result<i64> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let rows = txn
            .execute(
                "DELETE FROM sample WHERE id IN ( \
                    SELECT id FROM sample WHERE characteristic_id = $1 \
                    ORDER BY timestamp ASC LIMIT $2 \
                 )",
                &[&characteristic_id, &batch_size],
            )
            .await?;
        txn.commit().await?;
        Ok(rows as i64)
    }

    async fn delete_before_batch(
        &self,
        characteristic_id: i64,
        cutoff: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<i64> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let rows = txn
            .execute(
                "DELETE FROM sample WHERE id IN ( \
                    SELECT id FROM sample WHERE characteristic_id = $1 AND timestamp < $2 \
                    ORDER BY timestamp ASC LIMIT $3 \
                 )",
                &[&characteristic_id, &cutoff, &batch_size],
            )
            .await?;
        txn.commit().await?;
        Ok(rows as i64)
    }

    async fn load_subgroup_stats(
        &self,
        characteristic_id: i64,
        limit: usize,
        exclude_excluded: bool,
    ) -> Result<Vec<SubgroupStats>> {
        let client = self.pool.get().await?;
        let query = if exclude_excluded {
            "SELECT AVG(m.value) AS mean, \
                    (MAX(m.value) - MIN(m.value)) AS range, \
                    STDDEV_SAMP(m.value) AS std_dev, COUNT(m.value) AS n \
             FROM sample s JOIN measurement m ON m.sample_id = s.id \
             WHERE s.characteristic_id = $1 AND s.is_excluded = false \
             GROUP BY s.id ORDER BY s.timestamp DESC LIMIT $2"
        } else {
            "SELECT AVG(m.value) AS mean, \
                    (MAX(m.value) - MIN(m.value)) AS range, \
                    STDDEV_SAMP(m.value) AS std_dev, COUNT(m.value) AS n \
             FROM sample s JOIN measurement m ON m.sample_id = s.id \
             WHERE s.characteristic_id = $1 \
             GROUP BY s.id ORDER BY s.timestamp DESC LIMIT $2"
        };
        let rows = client
            .query(query, &[&characteristic_id, &(limit as i64)])
            .await?;
        let mut stats: Vec<SubgroupStats> = rows
            .into_iter()
            .map(|row| {
                let n: i64 = row.get("n");
                SubgroupStats {
                    mean: row.get("mean"),
                    range: if n > 1 { row.get("range") } else { None },
                    std_dev: if n > 1 { row.get("std_dev") } else { None },
                }
            })
            .collect();
        stats.reverse();
        Ok(stats)
    }
}
