//! Connection parameters for MQTT brokers and OPC-UA servers (§6). The rows
//! themselves are configured by peripheral CRUD (out of scope); the core
//! only reads them at provider startup and outbound-publisher dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::Row;

use crate::db::models::{Broker, OpcUaServer, OutboundBrokerConfig, OutboundPayloadFormat};
use crate::error::Result;

#[async_trait]
pub trait BrokerRepository: Send + Sync {
    async fn get(&self, broker_id: i64) -> Result<Option<Broker>>;

    /// Every broker with outbound re-publication turned on, read once at
    /// outbound-publisher startup (§4.7 "Outbound publisher").
    async fn list_outbound_enabled(&self) -> Result<Vec<Broker>>;
}

#[async_trait]
pub trait OpcUaServerRepository: Send + Sync {
    async fn get(&self, server_id: i64) -> Result<Option<OpcUaServer>>;
}

pub struct PgBrokerRepository {
    pool: Arc<Pool>,
}

impl PgBrokerRepository {
    pub fn new(pool: Arc<Pool>) -> Self {
        PgBrokerRepository { pool }
    }
}

fn row_to_broker(row: Row) -> Broker {
    let outbound_enabled: Option<bool> = row.get("outbound_enabled");
    let outbound = outbound_enabled.map(|enabled| {
        let format: String = row.get("outbound_format");
        OutboundBrokerConfig {
            enabled,
            format: if format == "sparkplug" {
                OutboundPayloadFormat::Sparkplug
            } else {
                OutboundPayloadFormat::Json
            },
            min_seconds_between_publishes: row.get::<_, i64>("outbound_min_seconds") as u64,
        }
    });
    Broker {
        id: row.get("id"),
        name: row.get("name"),
        host: row.get("host"),
        port: row.get::<_, i32>("port") as u16,
        username: row.get("username"),
        password_ciphertext: row.get("password_ciphertext"),
        keepalive_seconds: row.get::<_, i32>("keepalive_seconds") as u16,
        max_reconnect_delay_seconds: row.get::<_, i64>("max_reconnect_delay_seconds") as u64,
        use_tls: row.get("use_tls"),
        outbound,
    }
}

#[async_trait]
impl BrokerRepository for PgBrokerRepository {
    async fn get(&self, broker_id: i64) -> Result<Option<Broker>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, name, host, port, username, password_ciphertext, \
                        keepalive_seconds, max_reconnect_delay_seconds, use_tls, \
                        outbound_enabled, outbound_format, outbound_min_seconds \
                 FROM broker WHERE id = $1",
                &[&broker_id],
            )
            .await?;
        Ok(row.map(row_to_broker))
    }

    async fn list_outbound_enabled(&self) -> Result<Vec<Broker>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, name, host, port, username, password_ciphertext, \
                        keepalive_seconds, max_reconnect_delay_seconds, use_tls, \
                        outbound_enabled, outbound_format, outbound_min_seconds \
                 FROM broker WHERE outbound_enabled = true",
                &[],
            )
            .await?;
        Ok(rows.into_iter().map(row_to_broker).collect())
    }
}

pub struct PgOpcUaServerRepository {
    pool: Arc<Pool>,
}

impl PgOpcUaServerRepository {
    pub fn new(pool: Arc<Pool>) -> Self {
        PgOpcUaServerRepository { pool }
    }
}

#[async_trait]
impl OpcUaServerRepository for PgOpcUaServerRepository {
    async fn get(&self, server_id: i64) -> Result<Option<OpcUaServer>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, name, endpoint_url, username, password_ciphertext, \
                        default_sampling_interval_ms \
                 FROM opcua_server WHERE id = $1",
                &[&server_id],
            )
            .await?;
        Ok(row.map(|r| OpcUaServer {
            id: r.get("id"),
            name: r.get("name"),
            endpoint_url: r.get("endpoint_url"),
            username: r.get("username"),
            password_ciphertext: r.get("password_ciphertext"),
            default_sampling_interval_ms: r.get::<_, i32>("default_sampling_interval_ms") as u32,
        }))
    }
}
