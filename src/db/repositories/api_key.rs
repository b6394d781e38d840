//! API key lookup (§6 "authenticated by API key"). Key issuance and rotation
//! are CRUD concerns the specification explicitly places out of scope; this
//! repository only reads the allowlist a deployment has already provisioned.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::Pool;

use crate::db::models::ApiKeyGrant;
use crate::error::Result;

#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// Looks up a grant by the SHA-256 hex digest of the presented key.
    /// Returns `None` for an unknown hash; a revoked key is still returned
    /// (callers check `ApiKeyGrant::allows`, which is always `false` for one).
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyGrant>>;
}

pub struct PgApiKeyRepository {
    pool: Arc<Pool>,
}

impl PgApiKeyRepository {
    pub fn new(pool: Arc<Pool>) -> Self {
        PgApiKeyRepository { pool }
    }
}

#[async_trait]
impl ApiKeyRepository for PgApiKeyRepository {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyGrant>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT key_hash, name, characteristic_ids, revoked FROM api_key WHERE key_hash = $1",
                &[&key_hash],
            )
            .await?;
        Ok(row.map(|row| ApiKeyGrant {
            key_hash: row.get("key_hash"),
            name: row.get("name"),
            characteristic_ids: row.get("characteristic_ids"),
            revoked: row.get("revoked"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_grant_allows_every_characteristic() {
        let grant = ApiKeyGrant {
            key_hash: "x".to_string(),
            name: "line1-gateway".to_string(),
            characteristic_ids: None,
            revoked: false,
        };
        assert!(grant.allows(1));
        assert!(grant.allows(999));
    }

    #[test]
    fn scoped_grant_rejects_characteristics_outside_the_list() {
        let grant = ApiKeyGrant {
            key_hash: "x".to_string(),
            name: "line1-gateway".to_string(),
            characteristic_ids: Some(vec![1, 2]),
            revoked: false,
        };
        assert!(grant.allows(1));
        assert!(!grant.allows(3));
    }

    #[test]
    fn revoked_grant_allows_nothing() {
        let grant = ApiKeyGrant {
            key_hash: "x".to_string(),
            name: "line1-gateway".to_string(),
            characteristic_ids: None,
            revoked: true,
        };
        assert!(!grant.allows(1));
    }
}
