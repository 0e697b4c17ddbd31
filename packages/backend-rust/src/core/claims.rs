use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::CoordinationError;
use crate::cache::RedisCache;

/// Short-lived exclusive claims. A second claimant for the same key within
/// the TTL is refused, so concurrent deliveries of one job do not both call
/// the provider.
#[derive(Clone)]
pub enum ClaimStore {
    Redis(RedisCache),
    Memory(Arc<MemoryClaims>),
}

#[derive(Default)]
pub struct MemoryClaims {
    held: Mutex<HashMap<String, Instant>>,
}

impl MemoryClaims {
    /// Expired claims are dropped on every call, so kept claims from scored
    /// attempts do not accumulate.
    pub fn try_claim_at(&self, key: &str, ttl: Duration, now: Instant) -> bool {
        let mut held = self.held.lock();
        held.retain(|_, expires| *expires > now);
        match held.get(key) {
            Some(expires) if *expires > now => false,
            _ => {
                held.insert(key.to_string(), now + ttl);
                true
            }
        }
    }

    pub fn release(&self, key: &str) {
        self.held.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }
}

impl ClaimStore {
    pub fn memory() -> Self {
        ClaimStore::Memory(Arc::new(MemoryClaims::default()))
    }

    pub async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        match self {
            ClaimStore::Memory(claims) => Ok(claims.try_claim_at(key, ttl, Instant::now())),
            ClaimStore::Redis(cache) => {
                let mut conn = cache.connection();
                let result: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg("1")
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query_async(&mut conn)
                    .await?;
                Ok(result.is_some())
            }
        }
    }

    /// Lets a retry of the same job claim again before the TTL lapses.
    pub async fn release(&self, key: &str) -> Result<(), CoordinationError> {
        match self {
            ClaimStore::Memory(claims) => {
                claims.release(key);
                Ok(())
            }
            ClaimStore::Redis(cache) => {
                let mut conn = cache.connection();
                let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_expiry() {
        let claims = MemoryClaims::default();
        let ttl = Duration::from_secs(120);
        let now = Instant::now();

        assert!(claims.try_claim_at("ai:claim:a1", ttl, now));
        assert!(!claims.try_claim_at("ai:claim:a1", ttl, now + Duration::from_secs(5)));
        assert!(claims.try_claim_at("ai:claim:a2", ttl, now));
        assert!(claims.try_claim_at("ai:claim:a1", ttl, now + Duration::from_secs(121)));
    }

    #[test]
    fn test_expired_claims_are_pruned() {
        let claims = MemoryClaims::default();
        let ttl = Duration::from_secs(120);
        let now = Instant::now();
        for i in 0..50 {
            assert!(claims.try_claim_at(&format!("ai:claim:{i}"), ttl, now));
        }
        assert_eq!(claims.len(), 50);

        assert!(claims.try_claim_at("ai:claim:late", ttl, now + Duration::from_secs(121)));
        assert_eq!(claims.len(), 1);
    }

    #[tokio::test]
    async fn test_release_allows_reclaim() {
        let store = ClaimStore::memory();
        let ttl = Duration::from_secs(60);
        assert!(store.try_claim("k", ttl).await.unwrap());
        assert!(!store.try_claim("k", ttl).await.unwrap());
        store.release("k").await.unwrap();
        assert!(store.try_claim("k", ttl).await.unwrap());
    }
}
