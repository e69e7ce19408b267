use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::IngestError;
use crate::person::{NewPerson, PersonStore};
use crate::types::{Person, TeamId};

/// The raw `$set`/`$set_once`/`$increment` payload carried by an event, kept
/// separate from the event's own analytics properties: this is what gets
/// merged into the *person's* properties, not the event's.
#[derive(Debug, Clone, Default)]
pub struct PersonPropertyUpdate {
    pub set: Option<Map<String, Value>>,
    pub set_once: Option<Map<String, Value>>,
    pub increment: Option<Map<String, Value>>,
}

impl PersonPropertyUpdate {
    pub fn is_empty(&self) -> bool {
        self.set.is_none() && self.set_once.is_none() && self.increment.is_none()
    }
}

/// Implements §4.5: `new_props = set_once ⊕ existing ⊕ set`, then a numeric
/// `$increment` pass applied atomically in postgres, skipping the write
/// entirely when nothing actually changed.
pub struct PersonPropertyUpdater {
    store: Arc<PersonStore>,
    use_log_sink: bool,
}

impl PersonPropertyUpdater {
    pub fn new(store: Arc<PersonStore>, use_log_sink: bool) -> Self {
        Self { store, use_log_sink }
    }

    pub async fn apply(
        &self,
        team_id: TeamId,
        distinct_id: &str,
        update: &PersonPropertyUpdate,
    ) -> Result<Option<Person>, IngestError> {
        if update.is_empty() {
            return Ok(None);
        }

        let mut person = self.fetch_or_create(team_id, distinct_id).await?;
        let mut new_props = merge(&person.properties, update.set_once.as_ref(), update.set.as_ref());

        let has_increments = update.increment.as_ref().is_some_and(|m| !m.is_empty());
        if has_increments {
            person = self
                .store
                .increment_properties(person.id, update.increment.as_ref().unwrap())
                .await?;
            new_props = merge(&person.properties, update.set_once.as_ref(), update.set.as_ref());
        }

        if new_props == person.properties && (!self.use_log_sink || !has_increments) {
            return Ok(None);
        }

        let updated = self
            .store
            .update_properties(person.id, new_props, person.is_identified)
            .await?;
        Ok(Some(updated))
    }

    /// Race-safe fetch-or-create, as in `set_is_identified`: a concurrent
    /// create from another worker surfaces as a race condition, which we
    /// resolve by re-fetching rather than erroring.
    async fn fetch_or_create(&self, team_id: TeamId, distinct_id: &str) -> Result<Person, IngestError> {
        if let Some(person) = self.store.find_by_distinct_id(team_id, distinct_id).await? {
            return Ok(person);
        }
        match self
            .store
            .create(NewPerson {
                team_id,
                distinct_ids: vec![distinct_id.to_string()],
                properties: Value::Object(Map::new()),
                is_identified: false,
            })
            .await
        {
            Ok(person) => Ok(person),
            Err(e) if e.is_race_condition() => self
                .store
                .find_by_distinct_id(team_id, distinct_id)
                .await?
                .ok_or(e),
            Err(e) => Err(e),
        }
    }
}

fn merge(existing: &Value, set_once: Option<&Map<String, Value>>, set: Option<&Map<String, Value>>) -> Value {
    let mut result = set_once.cloned().unwrap_or_default();
    if let Some(existing_obj) = existing.as_object() {
        for (key, value) in existing_obj {
            result.insert(key.clone(), value.clone());
        }
    }
    if let Some(set_obj) = set {
        for (key, value) in set_obj {
            result.insert(key.clone(), value.clone());
        }
    }
    Value::Object(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_once_only_fills_keys_absent_from_existing() {
        let existing = json!({"color": "red"});
        let set_once = Map::from_iter([
            ("color".to_string(), json!("blue")),
            ("size".to_string(), json!("L")),
        ]);
        let merged = merge(&existing, Some(&set_once), None);
        assert_eq!(merged, json!({"color": "red", "size": "L"}));
    }

    #[test]
    fn set_overrides_existing_and_set_once() {
        let existing = json!({"color": "red"});
        let set_once = Map::from_iter([("color".to_string(), json!("blue"))]);
        let set = Map::from_iter([("color".to_string(), json!("green"))]);
        let merged = merge(&existing, Some(&set_once), Some(&set));
        assert_eq!(merged, json!({"color": "green"}));
    }

    #[test]
    fn no_update_fields_is_empty() {
        assert!(PersonPropertyUpdate::default().is_empty());
    }
}
