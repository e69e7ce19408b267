use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::error::IngestError;
use crate::metric_consts::{MERGE_ATTEMPTS, MERGE_RACE_RETRIES, PERSON_CREATED, PERSON_DELETED};
use crate::person::{NewPerson, PersonManager, PersonStore};
use crate::types::{Person, TeamId};

const MAX_MERGE_ATTEMPTS: u32 = 3;

/// Resolves distinct ids to persons and carries out the merge protocol:
/// optimistic create-or-refetch on first sight, and a bounded-retry merge
/// when an `$identify`/`$create_alias` links two distinct ids that already
/// resolve to different persons.
pub struct IdentityResolver {
    store: Arc<PersonStore>,
    manager: Arc<PersonManager>,
}

impl IdentityResolver {
    pub fn new(store: Arc<PersonStore>, manager: Arc<PersonManager>) -> Self {
        Self { store, manager }
    }

    /// Returns the person for `distinct_id`, creating one if this is the
    /// first event ever seen for it. Races two ingest workers creating the
    /// same brand-new distinct id simultaneously: the loser's unique
    /// constraint violation is treated as "someone beat me to it", and the
    /// loser re-fetches rather than erroring.
    pub async fn resolve_or_create(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Person, IngestError> {
        if let Some(existing) = self.store.find_by_distinct_id(team_id, distinct_id).await? {
            return Ok(existing);
        }

        if !self.manager.is_new_distinct_id(team_id, distinct_id).await? {
            if let Some(existing) = self.store.find_by_distinct_id(team_id, distinct_id).await? {
                return Ok(existing);
            }
        }

        for attempt in 1..=MAX_MERGE_ATTEMPTS {
            metrics::counter!(MERGE_ATTEMPTS).increment(1);
            let created = self
                .store
                .create(NewPerson {
                    team_id,
                    distinct_ids: vec![distinct_id.to_string()],
                    properties: Value::Object(Default::default()),
                    is_identified: false,
                })
                .await;

            match created {
                Ok(person) => {
                    metrics::counter!(PERSON_CREATED).increment(1);
                    self.manager.forget(team_id, distinct_id).await?;
                    return Ok(person);
                }
                Err(e) if e.is_race_condition() && attempt < MAX_MERGE_ATTEMPTS => {
                    metrics::counter!(MERGE_RACE_RETRIES).increment(1);
                    if let Some(existing) =
                        self.store.find_by_distinct_id(team_id, distinct_id).await?
                    {
                        return Ok(existing);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(IngestError::RaceConditionError(format!(
            "gave up creating person for distinct_id={distinct_id} after {MAX_MERGE_ATTEMPTS} attempts"
        )))
    }

    /// `$identify`/`$create_alias` entry point: fetch or lazily create the
    /// person currently identified (`distinct_id`), mark it identified, and
    /// return it without touching any other distinct id.
    pub async fn identify(&self, team_id: TeamId, distinct_id: &str) -> Result<Person, IngestError> {
        let person = self.resolve_or_create(team_id, distinct_id).await?;
        self.set_is_identified(person).await
    }

    /// Implements `alias(prev, new, team_id)`: links `prev` and `new` distinct
    /// ids to the same person. If both already resolve to different persons,
    /// `new`'s person absorbs `prev`'s (it survives; `prev`'s person is
    /// deleted), per the merge protocol in §4.2.
    pub async fn merge(
        &self,
        team_id: TeamId,
        prev_distinct_id: &str,
        new_distinct_id: &str,
    ) -> Result<Person, IngestError> {
        for attempt in 1..=MAX_MERGE_ATTEMPTS {
            metrics::counter!(MERGE_ATTEMPTS).increment(1);

            let prev_person = self.store.find_by_distinct_id(team_id, prev_distinct_id).await?;
            let new_person = self.store.find_by_distinct_id(team_id, new_distinct_id).await?;

            let result = match (prev_person, new_person) {
                (Some(p), Some(n)) if p.id == n.id => Ok(n),
                (Some(p), Some(n)) => self.merge_people(&n, &p).await,
                (Some(p), None) => self.attach(team_id, &p, new_distinct_id).await,
                (None, Some(n)) => self.attach(team_id, &n, prev_distinct_id).await,
                (None, None) => self
                    .store
                    .create(NewPerson {
                        team_id,
                        distinct_ids: vec![prev_distinct_id.to_string(), new_distinct_id.to_string()],
                        properties: Value::Object(Default::default()),
                        is_identified: false,
                    })
                    .await
                    .map(|p| {
                        metrics::counter!(PERSON_CREATED).increment(1);
                        p
                    }),
            };

            match result {
                Ok(person) => return Ok(person),
                Err(e) if e.is_race_condition() && attempt < MAX_MERGE_ATTEMPTS => {
                    metrics::counter!(MERGE_RACE_RETRIES).increment(1);
                    warn!(
                        team_id,
                        attempt, "merge race detected, re-observing state and retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(IngestError::RaceConditionError(format!(
            "gave up aliasing prev={prev_distinct_id} new={new_distinct_id} after {MAX_MERGE_ATTEMPTS} attempts"
        )))
    }

    /// Attaches `distinct_id` to an existing person. A unique-violation means
    /// another worker attached it concurrently; the caller's retry loop
    /// re-observes state on the next attempt.
    async fn attach(
        &self,
        team_id: TeamId,
        person: &Person,
        distinct_id: &str,
    ) -> Result<Person, IngestError> {
        self.store
            .add_distinct_id(team_id, person.id, distinct_id)
            .await?;
        Ok(person.clone())
    }

    /// `merge_people(into=new_person, other=prev_person)`: `into` survives,
    /// absorbing `other`'s properties, cohort memberships, and distinct ids,
    /// then `other` is deleted. Not wrapped in a single database transaction:
    /// the steps are independently idempotent, so a crash partway through
    /// leaves recoverable state rather than a dangling reference.
    async fn merge_people(&self, into: &Person, other: &Person) -> Result<Person, IngestError> {
        let merged_properties = merge_properties(&into.properties, &other.properties);
        let first_seen = into.created_at.min(other.created_at);

        let mut merged = self
            .store
            .update_merged_person(into.id, merged_properties, first_seen, into.is_identified)
            .await?;
        self.store.reassign_cohorts(other.id, into.id).await?;

        for attempt in 1..=MAX_MERGE_ATTEMPTS {
            self.store.move_distinct_ids(other.id, into.id).await?;

            match self.store.delete(other.id).await {
                Ok(()) => {
                    metrics::counter!(PERSON_DELETED).increment(1);
                    return Ok(merged);
                }
                Err(e) if e.is_race_condition() && attempt < MAX_MERGE_ATTEMPTS => {
                    // A distinct id was added to `other` concurrently between
                    // the move and the delete (FK violation). Re-move and retry.
                    metrics::counter!(MERGE_RACE_RETRIES).increment(1);
                    merged = self.store.find_by_id(into.id).await?.unwrap_or(merged);
                }
                Err(e) => return Err(e),
            }
        }

        Err(IngestError::RaceConditionError(format!(
            "gave up deleting absorbed person {} after {MAX_MERGE_ATTEMPTS} attempts",
            other.id
        )))
    }

    async fn set_is_identified(&self, person: Person) -> Result<Person, IngestError> {
        if person.is_identified {
            return Ok(person);
        }
        self.store
            .update_properties(person.id, person.properties.clone(), true)
            .await
    }
}

/// `into`'s keys win on conflict; `other`'s keys fill in anything `into`
/// doesn't already have.
fn merge_properties(into: &Value, other: &Value) -> Value {
    let mut merged = other.as_object().cloned().unwrap_or_default();
    if let Some(into_obj) = into.as_object() {
        for (key, value) in into_obj {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_properties_prefers_into_on_conflict() {
        let into = json!({"a": 1, "b": 2});
        let other = json!({"b": 99, "c": 3});
        let merged = merge_properties(&into, &other);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
        assert_eq!(merged["c"], 3);
    }
}
