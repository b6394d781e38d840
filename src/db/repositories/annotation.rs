//! Chart annotations (§3). Peripheral to the core engine but part of the
//! persisted data model it shares a database with.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;

use crate::db::models::{Annotation, AnnotationKind};
use crate::error::Result;

#[async_trait]
pub trait AnnotationRepository: Send + Sync {
    async fn list_for_characteristic(&self, characteristic_id: i64) -> Result<Vec<Annotation>>;

    /// Point annotations are upsert-by-`(characteristic_id, sample_id)` per
    /// the §3 invariant.
    async fn upsert_point(
        &self,
        characteristic_id: i64,
        sample_id: i64,
        note: String,
        at: DateTime<Utc>,
    ) -> Result<Annotation>;

    async fn create_period(
        &self,
        characteristic_id: i64,
        note: String,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<Annotation>;
}

pub struct PgAnnotationRepository {
    pool: Arc<Pool>,
}

impl PgAnnotationRepository {
    pub fn new(pool: Arc<Pool>) -> Self {
        PgAnnotationRepository { pool }
    }
}

fn row_to_annotation(row: tokio_postgres::Row) -> Annotation {
    let kind: String = row.get("kind");
    Annotation {
        id: row.get("id"),
        characteristic_id: row.get("characteristic_id"),
        sample_id: row.get("sample_id"),
        kind: if kind == "period" {
            AnnotationKind::Period
        } else {
            AnnotationKind::Point
        },
        note: row.get("note"),
        starts_at: row.get("starts_at"),
        ends_at: row.get("ends_at"),
    }
}

#[async_trait]
impl AnnotationRepository for PgAnnotationRepository {
    async fn list_for_characteristic(&self, characteristic_id: i64) -> Result<Vec<Annotation>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, characteristic_id, sample_id, kind, note, starts_at, ends_at \
                 FROM annotation WHERE characteristic_id = $1 ORDER BY starts_at ASC",
                &[&characteristic_id],
            )
            .await?;
        Ok(rows.into_iter().map(row_to_annotation).collect())
    }

    async fn upsert_point(
        &self,
        characteristic_id: i64,
        sample_id: i64,
        note: String,
        at: DateTime<Utc>,
    ) -> Result<Annotation> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO annotation (characteristic_id, sample_id, kind, note, starts_at) \
                 VALUES ($1, $2, 'point', $3, $4) \
                 ON CONFLICT (characteristic_id, sample_id) WHERE kind = 'point' \
                 DO UPDATE SET note = EXCLUDED.note \
                 RETURNING id, characteristic_id, sample_id, kind, note, starts_at, ends_at",
                &[&characteristic_id, &sample_id, &note, &at],
            )
            .await?;
        Ok(row_to_annotation(row))
    }

    async fn create_period(
        &self,
        characteristic_id: i64,
        note: String,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<Annotation> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO annotation (characteristic_id, sample_id, kind, note, starts_at, ends_at) \
                 VALUES ($1, NULL, 'period', $2, $3, $4) \
                 RETURNING id, characteristic_id, sample_id, kind, note, starts_at, ends_at",
                &[&characteristic_id, &note, &starts_at, &ends_at],
            )
            .await?;
        Ok(row_to_annotation(row))
    }
}
