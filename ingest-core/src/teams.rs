use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use sqlx::PgPool;

use crate::error::IngestError;
use crate::metric_consts::{TEAM_CACHE_HITS, TEAM_CACHE_MISSES};
use crate::types::Team;

/// Read-through cache over `posthog_team`, keyed by API token. The core never
/// writes this table, so a cache miss always means "load from postgres",
/// never "retry a write".
#[derive(Clone)]
pub struct TeamCache {
    pool: PgPool,
    cache: Cache<String, Option<Arc<Team>>>,
    by_id: Cache<crate::types::TeamId, Option<Arc<Team>>>,
}

impl TeamCache {
    pub fn new(pool: PgPool, max_size: u64, ttl_secs: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_size)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();
        let by_id = Cache::builder()
            .max_capacity(max_size)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();
        Self { pool, cache, by_id }
    }

    /// Resolves a team by its internal id, the lookup path the event
    /// pipeline uses once a caller's team_id has already been authenticated.
    pub async fn get_by_id(
        &self,
        team_id: crate::types::TeamId,
    ) -> Result<Option<Arc<Team>>, IngestError> {
        if let Some(hit) = self.by_id.get(&team_id) {
            metrics::counter!(TEAM_CACHE_HITS).increment(1);
            return Ok(hit);
        }
        metrics::counter!(TEAM_CACHE_MISSES).increment(1);

        let team = sqlx::query_as!(
            Team,
            r#"
            SELECT id, uuid, organization_id, api_token, name, anonymize_ips
            FROM posthog_team
            WHERE id = $1
            "#,
            team_id
        )
        .fetch_optional(&self.pool)
        .await?
        .map(Arc::new);

        self.by_id.insert(team_id, team.clone());
        Ok(team)
    }

    /// Resolves a team by its public API token, consulting the cache first.
    /// A `None` result (token not found) is cached too, so a storm of events
    /// carrying a bad token doesn't hammer postgres.
    pub async fn get_by_token(&self, token: &str) -> Result<Option<Arc<Team>>, IngestError> {
        if let Some(hit) = self.cache.get(token) {
            metrics::counter!(TEAM_CACHE_HITS).increment(1);
            return Ok(hit);
        }
        metrics::counter!(TEAM_CACHE_MISSES).increment(1);

        let team = sqlx::query_as!(
            Team,
            r#"
            SELECT id, uuid, organization_id, api_token, name, anonymize_ips
            FROM posthog_team
            WHERE api_token = $1
            "#,
            token
        )
        .fetch_optional(&self.pool)
        .await?
        .map(Arc::new);

        self.cache.insert(token.to_string(), team.clone());
        Ok(team)
    }

    pub fn invalidate(&self, token: &str) {
        self.cache.invalidate(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_team() -> Arc<Team> {
        Arc::new(Team {
            id: 1,
            uuid: Uuid::now_v7(),
            organization_id: Uuid::now_v7(),
            api_token: "token123".to_string(),
            name: "acme".to_string(),
            anonymize_ips: false,
        })
    }

    #[test]
    fn cache_round_trips_a_hit() {
        let cache: Cache<String, Option<Arc<Team>>> = Cache::builder().max_capacity(10).build();
        let team = sample_team();
        cache.insert("token123".to_string(), Some(team.clone()));
        assert_eq!(cache.get("token123").unwrap().unwrap().id, team.id);
    }

    #[test]
    fn cache_can_hold_a_negative_result() {
        let cache: Cache<String, Option<Arc<Team>>> = Cache::builder().max_capacity(10).build();
        cache.insert("missing".to_string(), None);
        assert_eq!(cache.get("missing"), Some(None));
    }
}
