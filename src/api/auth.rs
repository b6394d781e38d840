//! API-key verification for the data-entry surface (§6 "authenticated by API
//! key", §7 "401 auth, 403 key-lacks-characteristic").
//!
//! Key issuance, rotation, and any management CRUD are out of scope; this is
//! the read-only check the REST ingress needs: hash the presented key, look
//! its grant up, and let the caller decide whether the grant covers the
//! characteristic being submitted to.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::db::models::ApiKeyGrant;
use crate::db::repositories::ApiKeyRepository;

/// Hashes a presented key the same way stored grants are keyed, so neither
/// the plaintext key nor a reversible encoding of it ever reaches the
/// database or logs.
pub fn hash_key(raw_key: &str) -> String {
    let digest = Sha256::digest(raw_key.as_bytes());
    hex::encode(digest)
}

#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, raw_key: &str) -> Option<ApiKeyGrant>;
}

/// Looks grants up through an [`ApiKeyRepository`] (§4.14: "checking a
/// presented key against a `data_source`-scoped allowlist loaded from the
/// DB").
pub struct RepositoryAuthVerifier<K> {
    repository: std::sync::Arc<K>,
}

impl<K> RepositoryAuthVerifier<K> {
    pub fn new(repository: std::sync::Arc<K>) -> Self {
        RepositoryAuthVerifier { repository }
    }
}

#[async_trait]
impl<K> AuthVerifier for RepositoryAuthVerifier<K>
where
    K: ApiKeyRepository,
{
    async fn verify(&self, raw_key: &str) -> Option<ApiKeyGrant> {
        let hash = hash_key(raw_key);
        match self.repository.find_by_hash(&hash).await {
            Ok(grant) => grant,
            Err(error) => {
                tracing::error!(%error, "api_key_lookup_failed");
                None
            }
        }
    }
}
