use std::sync::Arc;

use chrono::{DateTime, Utc};
use common_kafka::kafka_producer::{send_keyed_iter_to_kafka, KafkaContext};
use once_cell::sync::Lazy;
use rdkafka::producer::FutureProducer;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::elements::{self, Element, ExtractedElements};
use crate::error::IngestError;
use crate::person::{NewPerson, PersonManager, PersonStore};
use crate::person_properties::{PersonPropertyUpdate, PersonPropertyUpdater};
use crate::teams::TeamCache;
use crate::types::{CanonicalEvent, SessionRecordingEvent, TeamId, EVENTS_WITHOUT_DEFINITION};
use crate::wire;

const MAX_EVENT_NAME_LEN: usize = 200;
static ILLEGAL_EVENT_NAME_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\-$. ]").unwrap());

pub struct CaptureInput {
    pub event_uuid: Uuid,
    pub team_id: TeamId,
    pub distinct_id: String,
    pub ip: Option<String>,
    pub event: String,
    pub properties: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub person_property_update: PersonPropertyUpdate,
}

/// Canonicalizes an event and publishes it to whichever sink this deployment
/// is configured for. Owns element extraction, definition bookkeeping, and
/// person lazy-creation, but delegates identity *resolution* (aliasing,
/// merges) entirely to the identity resolver — by the time capture runs, the
/// distinct id either already has a person or gets a bare one here.
pub struct EventEmitter {
    pool: PgPool,
    producer: FutureProducer<KafkaContext>,
    teams: Arc<TeamCache>,
    person_store: Arc<PersonStore>,
    person_manager: Arc<PersonManager>,
    person_properties: Arc<PersonPropertyUpdater>,
    events_topic: String,
    session_recording_topic: String,
    use_log_sink: bool,
}

impl EventEmitter {
    pub fn new(
        pool: PgPool,
        producer: FutureProducer<KafkaContext>,
        teams: Arc<TeamCache>,
        person_store: Arc<PersonStore>,
        person_manager: Arc<PersonManager>,
        person_properties: Arc<PersonPropertyUpdater>,
        events_topic: String,
        session_recording_topic: String,
        use_log_sink: bool,
    ) -> Self {
        Self {
            pool,
            producer,
            teams,
            person_store,
            person_manager,
            person_properties,
            events_topic,
            session_recording_topic,
            use_log_sink,
        }
    }

    pub async fn capture(&self, input: CaptureInput) -> Result<CanonicalEvent, IngestError> {
        let event_name = sanitize_event_name(&input.event);
        let mut properties = input.properties;

        let raw_elements: Vec<Element> = properties
            .remove("$elements")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let extracted = elements::extract(raw_elements);

        let team = self
            .teams
            .get_by_id(input.team_id)
            .await?
            .ok_or_else(|| IngestError::InvalidInput(format!("unknown team_id={}", input.team_id)))?;
        let anonymize_ips = team.anonymize_ips;

        if let Some(ip) = &input.ip {
            if !anonymize_ips && !properties.contains_key("$ip") {
                properties.insert("$ip".to_string(), Value::String(ip.clone()));
            }
        }

        if !EVENTS_WITHOUT_DEFINITION.contains(&event_name.as_str()) {
            self.upsert_definitions(input.team_id, &event_name, &properties)
                .await?;
        }

        self.ensure_person_exists(input.team_id, &input.distinct_id)
            .await?;

        inject_initial_properties(&mut properties);

        if !input.person_property_update.is_empty() {
            self.person_properties
                .apply(input.team_id, &input.distinct_id, &input.person_property_update)
                .await?;
        }

        let properties_json = serde_json::to_string(&Value::Object(properties))?;
        let formatted_ts = format_log_timestamp(input.timestamp);

        let canonical = CanonicalEvent {
            uuid: input.event_uuid,
            event: event_name,
            properties: properties_json,
            timestamp: formatted_ts.clone(),
            team_id: input.team_id as i64,
            distinct_id: input.distinct_id,
            elements_chain: extracted.chain.clone(),
            created_at: formatted_ts,
        };

        if self.use_log_sink {
            self.publish_to_log_sink(&canonical).await?;
        } else {
            self.ensure_element_group(input.team_id, &extracted).await?;
            self.insert_event_row(&canonical).await?;
        }

        Ok(canonical)
    }

    /// `$snapshot` events: no element extraction, no definition bookkeeping,
    /// published verbatim as JSON regardless of which sink events use. Per
    /// Open Question 3, applies the same `anonymize_ips` rule as ordinary
    /// `capture`: if the team doesn't anonymize IPs, `$ip` is injected into
    /// the snapshot payload when it's a JSON object and doesn't already
    /// carry one.
    pub async fn capture_session_recording(
        &self,
        team_id: TeamId,
        distinct_id: String,
        session_id: String,
        mut snapshot_data: Value,
        timestamp: DateTime<Utc>,
        ip: Option<String>,
    ) -> Result<(), IngestError> {
        self.ensure_person_exists(team_id, &distinct_id).await?;

        if let Some(ip) = ip {
            let team = self.teams.get_by_id(team_id).await?;
            let anonymize_ips = team.map(|t| t.anonymize_ips).unwrap_or(false);
            if !anonymize_ips {
                if let Some(obj) = snapshot_data.as_object_mut() {
                    obj.entry("$ip").or_insert_with(|| Value::String(ip));
                }
            }
        }

        let record = SessionRecordingEvent {
            uuid: Uuid::now_v7(),
            team_id,
            distinct_id,
            session_id,
            snapshot_data,
            timestamp,
            created_at: Utc::now(),
        };

        if self.use_log_sink {
            send_keyed_iter_to_kafka(
                &self.producer,
                &self.session_recording_topic,
                |r: &SessionRecordingEvent| Some(r.uuid.to_string()),
                [record],
            )
            .await?;
        } else {
            sqlx::query!(
                r#"
                INSERT INTO posthog_sessionrecordingevent
                    (uuid, team_id, distinct_id, session_id, snapshot_data, timestamp, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
                record.uuid,
                record.team_id,
                record.distinct_id,
                record.session_id,
                record.snapshot_data,
                record.timestamp,
                record.created_at,
            )
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn ensure_person_exists(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<(), IngestError> {
        if self.person_manager.is_new_distinct_id(team_id, distinct_id).await? {
            match self
                .person_store
                .create(NewPerson {
                    team_id,
                    distinct_ids: vec![distinct_id.to_string()],
                    properties: Value::Object(Default::default()),
                    is_identified: false,
                })
                .await
            {
                Ok(_) => {
                    self.person_manager.forget(team_id, distinct_id).await?;
                }
                Err(e) if e.is_race_condition() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn upsert_definitions(
        &self,
        team_id: TeamId,
        event_name: &str,
        properties: &Map<String, Value>,
    ) -> Result<(), IngestError> {
        sqlx::query!(
            r#"
            INSERT INTO posthog_eventdefinition (team_id, name, created_at, last_seen_at)
            VALUES ($1, $2, now(), now())
            ON CONFLICT (team_id, name) DO UPDATE SET last_seen_at = now()
            "#,
            team_id,
            event_name,
        )
        .execute(&self.pool)
        .await?;

        for key in properties.keys() {
            sqlx::query!(
                r#"
                INSERT INTO posthog_propertydefinition (team_id, name, is_numerical)
                VALUES ($1, $2, false)
                ON CONFLICT (team_id, name) DO NOTHING
                "#,
                team_id,
                key,
            )
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn publish_to_log_sink(&self, event: &CanonicalEvent) -> Result<(), IngestError> {
        let payload = wire::encode(event);
        let key = event.uuid.to_string();
        self.producer
            .send_result(rdkafka::producer::FutureRecord {
                topic: &self.events_topic,
                payload: Some(payload.as_ref()),
                partition: None,
                key: Some(key.as_str()),
                timestamp: None,
                headers: None,
            })
            .map_err(|(e, _)| {
                IngestError::from(common_kafka::kafka_producer::KafkaProduceError::KafkaProduceError {
                    error: e,
                })
            })?
            .await
            .map_err(|_| {
                IngestError::from(common_kafka::kafka_producer::KafkaProduceError::KafkaProduceCanceled)
            })?
            .map_err(|(e, _)| {
                IngestError::from(common_kafka::kafka_producer::KafkaProduceError::KafkaProduceError {
                    error: e,
                })
            })?;
        Ok(())
    }

    /// Hashes `$elements` into a content-addressed element group (step 9 of
    /// §4.4's row-sink path): inserts a `posthog_elementgroup` row keyed by
    /// `(team_id, hash)`, absorbing a unique-violation (code 23505) by
    /// re-fetching the group another worker already created, and inserts
    /// the element rows only the first time the group is created (a hash
    /// collision means the same ordered elements were already persisted).
    async fn ensure_element_group(
        &self,
        team_id: TeamId,
        extracted: &ExtractedElements,
    ) -> Result<(), IngestError> {
        if extracted.elements.is_empty() {
            return Ok(());
        }

        let (group_id, freshly_created) = match sqlx::query!(
            r#"
            INSERT INTO posthog_elementgroup (team_id, hash)
            VALUES ($1, $2)
            RETURNING id
            "#,
            team_id,
            extracted.hash,
        )
        .fetch_one(&self.pool)
        .await
        {
            Ok(row) => (row.id, true),
            Err(e) if common_database::is_unique_constraint_error(&e) => {
                let row = sqlx::query!(
                    r#"SELECT id FROM posthog_elementgroup WHERE team_id = $1 AND hash = $2"#,
                    team_id,
                    extracted.hash,
                )
                .fetch_one(&self.pool)
                .await?;
                (row.id, false)
            }
            Err(e) => return Err(e.into()),
        };

        // A hash collision means these exact elements were already
        // persisted by whoever created the group; only the creator inserts.
        if !freshly_created {
            return Ok(());
        }

        for (order, element) in extracted.elements.iter().enumerate() {
            sqlx::query!(
                r#"
                INSERT INTO posthog_element
                    (text, tag_name, href, attr_id, attr_class, nth_child, nth_of_type, attributes, "order", group_id, team_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
                element.text,
                element.tag_name,
                element.href,
                element.attr_id,
                &element.attr_class,
                element.nth_child.map(|n| n as i32),
                element.nth_of_type.map(|n| n as i32),
                serde_json::to_value(&element.attributes)?,
                order as i32,
                group_id,
                team_id,
            )
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn insert_event_row(&self, event: &CanonicalEvent) -> Result<(), IngestError> {
        sqlx::query!(
            r#"
            INSERT INTO posthog_event
                (uuid, event, properties, timestamp, team_id, distinct_id, elements_chain, created_at)
            VALUES ($1, $2, $3::jsonb, $4, $5, $6, $7, $8)
            "#,
            event.uuid,
            event.event,
            event.properties,
            event.timestamp,
            event.team_id as i32,
            event.distinct_id,
            event.elements_chain,
            event.created_at,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn sanitize_event_name(raw: &str) -> String {
    let stripped = ILLEGAL_EVENT_NAME_CHARS.replace_all(raw, "");
    stripped.chars().take(MAX_EVENT_NAME_LEN).collect()
}

/// Normalizes `$initial_*` first-touch properties from UTM/referrer fields,
/// if present, without overwriting an already-set `$initial_*` key.
fn inject_initial_properties(properties: &mut Map<String, Value>) {
    let sources = [
        ("$referrer", "$initial_referrer"),
        ("$referring_domain", "$initial_referring_domain"),
        ("utm_source", "$initial_utm_source"),
        ("utm_medium", "$initial_utm_medium"),
        ("utm_campaign", "$initial_utm_campaign"),
    ];
    for (source_key, initial_key) in sources {
        if properties.contains_key(initial_key) {
            continue;
        }
        if let Some(value) = properties.get(source_key).cloned() {
            properties.insert(initial_key.to_string(), value);
        }
    }
}

fn format_log_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_illegal_characters() {
        assert_eq!(sanitize_event_name("page view!!"), "page view");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a".repeat(300);
        assert_eq!(sanitize_event_name(&long).len(), MAX_EVENT_NAME_LEN);
    }

    #[test]
    fn initial_properties_filled_from_first_touch() {
        let mut props = Map::new();
        props.insert("utm_source".to_string(), Value::String("google".to_string()));
        inject_initial_properties(&mut props);
        assert_eq!(props["$initial_utm_source"], Value::String("google".to_string()));
    }

    #[test]
    fn initial_properties_do_not_overwrite_existing() {
        let mut props = Map::new();
        props.insert("utm_source".to_string(), Value::String("google".to_string()));
        props.insert(
            "$initial_utm_source".to_string(),
            Value::String("bing".to_string()),
        );
        inject_initial_properties(&mut props);
        assert_eq!(props["$initial_utm_source"], Value::String("bing".to_string()));
    }
}
