use std::sync::Arc;

use common_redis::Client;

use crate::error::IngestError;
use crate::metric_consts::{PERSON_MANAGER_CACHE_HITS, PERSON_MANAGER_CACHE_MISSES};
use crate::person::store::PersonStore;
use crate::types::TeamId;

/// Answers "does this distinct id already have a person?" without a
/// round-trip to postgres on the hot path. A positive answer is never
/// cached (a newly-seen distinct id stays newly-seen only until it's
/// created), but a negative answer is cached briefly so that a burst of
/// events for the same never-before-seen distinct id only triggers one
/// postgres lookup.
pub struct PersonManager {
    store: Arc<PersonStore>,
    redis: Arc<dyn Client + Send + Sync>,
    negative_cache_ttl_secs: u64,
}

impl PersonManager {
    pub fn new(
        store: Arc<PersonStore>,
        redis: Arc<dyn Client + Send + Sync>,
        negative_cache_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            redis,
            negative_cache_ttl_secs,
        }
    }

    /// Returns `true` if `distinct_id` has no known person yet, consulting
    /// the negative cache before falling back to postgres.
    pub async fn is_new_distinct_id(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<bool, IngestError> {
        let cache_key = Self::negative_cache_key(team_id, distinct_id);
        match self.redis.get(cache_key.clone()).await {
            Ok(_) => {
                metrics::counter!(PERSON_MANAGER_CACHE_HITS).increment(1);
                return Ok(true);
            }
            Err(common_redis::CustomRedisError::NotFound) => {
                metrics::counter!(PERSON_MANAGER_CACHE_MISSES).increment(1);
            }
            Err(other) => return Err(other.into()),
        }

        let existing = self.store.find_by_distinct_id(team_id, distinct_id).await?;
        if existing.is_some() {
            return Ok(false);
        }

        self.redis
            .set_nx_ex(cache_key, "1".to_string(), self.negative_cache_ttl_secs)
            .await?;
        Ok(true)
    }

    /// Clears the negative cache entry for a distinct id once it's been
    /// assigned a person, so a subsequent lookup doesn't trust a stale "new".
    pub async fn forget(&self, team_id: TeamId, distinct_id: &str) -> Result<(), IngestError> {
        self.redis
            .del(Self::negative_cache_key(team_id, distinct_id))
            .await?;
        Ok(())
    }

    fn negative_cache_key(team_id: TeamId, distinct_id: &str) -> String {
        format!("ingest-core/person-absent/{team_id}/{distinct_id}")
    }
}
