//! Violation persistence, acknowledgement, and the statistics rollup used by
//! the alert manager (§4.8).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;

use crate::db::models::Violation;
use crate::error::{Error, Result};
use crate::rules::Severity;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ViolationStats {
    pub total: i64,
    pub unacknowledged: i64,
    pub informational: i64,
    pub by_rule: HashMap<u8, i64>,
    pub by_severity: HashMap<Severity, i64>,
}

/// A new violation before it has an id or acknowledgement state.
#[derive(Debug, Clone, PartialEq)]
pub struct NewViolation {
    pub sample_id: i64,
    pub characteristic_id: i64,
    pub rule_id: u8,
    pub rule_name: String,
    pub severity: Severity,
    pub requires_acknowledgement: bool,
}

#[async_trait]
pub trait ViolationRepository: Send + Sync {
    async fn insert(&self, violation: NewViolation) -> Result<Violation>;

    async fn get(&self, violation_id: i64) -> Result<Option<Violation>>;

    /// Atomically acknowledges a violation and, when `exclude_sample` is set,
    /// flips the violated sample's `is_excluded` flag in the same transaction
    /// (§4.6 "Acknowledgement"). Returns `Error::Conflict` if the violation is
    /// already acknowledged, `Error::NotFound` if it doesn't exist.
    async fn acknowledge(
        &self,
        violation_id: i64,
        user: &str,
        reason: &str,
        at: DateTime<Utc>,
        exclude_sample: bool,
    ) -> Result<Violation>;

    async fn stats(
        &self,
        characteristic_id: Option<i64>,
        date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<ViolationStats>;
}

pub struct PgViolationRepository {
    pool: Arc<Pool>,
}

impl PgViolationRepository {
    pub fn new(pool: Arc<Pool>) -> Self {
        PgViolationRepository { pool }
    }
}

fn severity_str(s: Severity) -> &'static str {
    match s {
        Severity::Warning => "WARNING",
        Severity::Critical => "CRITICAL",
    }
}

fn severity_from_str(s: &str) -> Severity {
    match s {
        "CRITICAL" => Severity::Critical,
        _ => Severity::Warning,
    }
}

fn row_to_violation(row: tokio_postgres::Row) -> Violation {
    let rule_id: i16 = row.get("rule_id");
    let severity: String = row.get("severity");
    Violation {
        id: row.get("id"),
        sample_id: row.get("sample_id"),
        characteristic_id: row.get("characteristic_id"),
        rule_id: rule_id as u8,
        rule_name: row.get("rule_name"),
        severity: severity_from_str(&severity),
        requires_acknowledgement: row.get("requires_acknowledgement"),
        acknowledged: row.get("acknowledged"),
        ack_user: row.get("ack_user"),
        ack_reason: row.get("ack_reason"),
        ack_timestamp: row.get("ack_timestamp"),
    }
}

#[async_trait]
impl ViolationRepository for PgViolationRepository {
    async fn insert(&self, violation: NewViolation) -> Result<Violation> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO violation \
                 (sample_id, characteristic_id, rule_id, rule_name, severity, \
                  requires_acknowledgement, acknowledged) \
                 VALUES ($1, $2, $3, $4, $5, $6, false) \
                 RETURNING id, sample_id, characteristic_id, rule_id, rule_name, severity, \
                           requires_acknowledgement, acknowledged, ack_user, ack_reason, ack_timestamp",
                &[
                    &violation.sample_id,
                    &violation.characteristic_id,
                    &(violation.rule_id as i16),
                    &violation.rule_name,
                    &severity_str(violation.severity),
                    &violation.requires_acknowledgement,
                ],
            )
            .await?;
        Ok(row_to_violation(row))
    }

    async fn get(&self, violation_id: i64) -> Result<Option<Violation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, sample_id, characteristic_id, rule_id, rule_name, severity, \
                        requires_acknowledgement, acknowledged, ack_user, ack_reason, ack_timestamp \
                 FROM violation WHERE id = $1",
                &[&violation_id],
            )
            .await?;
        Ok(row.map(row_to_violation))
    }

    async fn acknowledge(
        &self,
        violation_id: i64,
        user: &str,
        reason: &str,
        at: DateTime<Utc>,
        exclude_sample: bool,
    ) -> Result<Violation> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;

        let existing = txn
            .query_opt(
                "SELECT sample_id, acknowledged FROM violation WHERE id = $1 FOR UPDATE",
                &[&violation_id],
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("violation {violation_id}")))?;

        let already: bool = existing.get("acknowledged");
        if already {
            return Err(Error::Conflict(format!(
                "violation {violation_id} is already acknowledged"
            )));
        }
        let sample_id: i64 = existing.get("sample_id");

        let row = txn
            .query_one(
                "UPDATE violation SET acknowledged = true, ack_user = $2, ack_reason = $3, \
                 ack_timestamp = $4 \
                 WHERE id = $1 \
                 RETURNING id, sample_id, characteristic_id, rule_id, rule_name, severity, \
                           requires_acknowledgement, acknowledged, ack_user, ack_reason, ack_timestamp",
                &[&violation_id, &user, &reason, &at],
            )
            .await?;

        if exclude_sample {
            txn.execute(
                "UPDATE sample SET is_excluded = true WHERE id = $1",
                &[&sample_id],
            )
            .await?;
        }

        txn.commit().await?;
        Ok(row_to_violation(row))
    }

    async fn stats(
        &self,
        characteristic_id: Option<i64>,
        date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<ViolationStats> {
        let client = self.pool.get().await?;

        let mut clauses: Vec<String> = vec!["1 = 1".to_string()];
        let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = Vec::new();
        if let Some(char_id) = &characteristic_id {
            clauses.push(format!("characteristic_id = ${}", params.len() + 1));
            params.push(char_id);
        }
        if let Some((from, to)) = &date_range {
            clauses.push(format!(
                "created_at >= ${} AND created_at < ${}",
                params.len() + 1,
                params.len() + 2
            ));
            params.push(from);
            params.push(to);
        }
        let where_clause = clauses.join(" AND ");

        let sql = format!(
            "SELECT rule_id, severity, requires_acknowledgement, acknowledged \
             FROM violation WHERE {where_clause}"
        );
        let rows = client.query(&sql, &params).await?;

        let mut stats = ViolationStats::default();
        for row in rows {
            let rule_id: i16 = row.get("rule_id");
            let rule_id = rule_id as u8;
            let severity: String = row.get("severity");
            let severity = severity_from_str(&severity);
            let requires_ack: bool = row.get("requires_acknowledgement");
            let acknowledged: bool = row.get("acknowledged");

            stats.total += 1;
            if requires_ack && !acknowledged {
                stats.unacknowledged += 1;
            }
            if !requires_ack && !acknowledged {
                stats.informational += 1;
            }
            *stats.by_rule.entry(rule_id).or_insert(0) += 1;
            *stats.by_severity.entry(severity).or_insert(0) += 1;
        }
        Ok(stats)
    }
}
