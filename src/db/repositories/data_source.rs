//! Reads for the polymorphic `data_source` table (§3, §4.5).

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::Row;

use crate::db::models::{Characteristic, DataSource, DataSourceSpec, TriggerStrategy};
use crate::error::Result;

#[async_trait]
pub trait DataSourceRepository: Send + Sync {
    async fn get_for_characteristic(&self, characteristic_id: i64) -> Result<Option<DataSource>>;

    /// Active MQTT sources paired with their owning characteristic, for
    /// provider startup subscription (§4.5).
    async fn list_active_mqtt(&self) -> Result<Vec<(DataSource, Characteristic)>>;

    /// Active OPC-UA sources paired with their owning characteristic.
    async fn list_active_opcua(&self) -> Result<Vec<(DataSource, Characteristic)>>;
}

pub struct PgDataSourceRepository {
    pool: Arc<Pool>,
}

impl PgDataSourceRepository {
    pub fn new(pool: Arc<Pool>) -> Self {
        PgDataSourceRepository { pool }
    }
}

fn trigger_strategy_from_str(s: &str) -> TriggerStrategy {
    match s {
        "on_trigger" => TriggerStrategy::OnTrigger,
        "on_timer" => TriggerStrategy::OnTimer,
        _ => TriggerStrategy::OnChange,
    }
}

fn row_to_data_source(row: &Row) -> DataSource {
    let kind: String = row.get("kind");
    let spec = match kind.as_str() {
        "mqtt" => DataSourceSpec::Mqtt {
            broker_id: row.get("broker_id"),
            topic: row.get("topic"),
            metric_name: row.get("metric_name"),
            trigger_tag: row.get("trigger_tag"),
        },
        "opcua" => DataSourceSpec::OpcUa {
            server_id: row.get("server_id"),
            node_id: row.get("node_id"),
            sampling_interval_ms: row
                .get::<_, Option<i32>>("sampling_interval_ms")
                .map(|v| v as u32),
        },
        _ => DataSourceSpec::Manual,
    };
    let strategy: String = row.get("trigger_strategy");
    DataSource {
        id: row.get("id"),
        characteristic_id: row.get("characteristic_id"),
        is_active: row.get("is_active"),
        trigger_strategy: trigger_strategy_from_str(&strategy),
        spec,
    }
}

fn row_to_characteristic(row: &Row) -> Characteristic {
    Characteristic {
        id: row.get("char_id"),
        hierarchy_node_id: row.get("hierarchy_node_id"),
        name: row.get("char_name"),
        subgroup_size: row.get("subgroup_size"),
        target: row.get("target"),
        usl: row.get("usl"),
        lsl: row.get("lsl"),
        center_line: row.get("center_line"),
        ucl: row.get("ucl"),
        lcl: row.get("lcl"),
        sigma: row.get("sigma"),
        allows_variable_n: row.get("allows_variable_n"),
    }
}

const JOIN_SELECT: &str = "SELECT \
    d.id, d.characteristic_id, d.is_active, d.trigger_strategy, d.kind, \
    d.broker_id, d.topic, d.metric_name, d.trigger_tag, \
    d.server_id, d.node_id, d.sampling_interval_ms, \
    c.id AS char_id, c.hierarchy_node_id, c.name AS char_name, c.subgroup_size, \
    c.target, c.usl, c.lsl, c.center_line, c.ucl, c.lcl, c.sigma, c.allows_variable_n \
    FROM data_source d JOIN characteristic c ON c.id = d.characteristic_id";

#[async_trait]
impl DataSourceRepository for PgDataSourceRepository {
    async fn get_for_characteristic(&self, characteristic_id: i64) -> Result<Option<DataSource>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, characteristic_id, is_active, trigger_strategy, kind, \
                        broker_id, topic, metric_name, trigger_tag, \
                        server_id, node_id, sampling_interval_ms \
                 FROM data_source WHERE characteristic_id = $1",
                &[&characteristic_id],
            )
            .await?;
        Ok(row.map(|r| row_to_data_source(&r)))
    }

    async fn list_active_mqtt(&self) -> Result<Vec<(DataSource, Characteristic)>> {
        let client = self.pool.get().await?;
        let sql = format!("{JOIN_SELECT} WHERE d.is_active = true AND d.kind = 'mqtt'");
        let rows = client.query(&sql, &[]).await?;
        Ok(rows
            .iter()
            .map(|r| (row_to_data_source(r), row_to_characteristic(r)))
            .collect())
    }

    async fn list_active_opcua(&self) -> Result<Vec<(DataSource, Characteristic)>> {
        let client = self.pool.get().await?;
        let sql = format!("{JOIN_SELECT} WHERE d.is_active = true AND d.kind = 'opcua'");
        let rows = client.query(&sql, &[]).await?;
        Ok(rows
            .iter()
            .map(|r| (row_to_data_source(r), row_to_characteristic(r)))
            .collect())
    }
}
