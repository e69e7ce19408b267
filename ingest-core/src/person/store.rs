use chrono::Utc;
use common_kafka::kafka_producer::{send_keyed_iter_to_kafka, KafkaContext};
use rdkafka::producer::FutureProducer;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::IngestError;
use crate::types::{Person, PersonId, TeamId};

/// Mirror of the `posthog_person` row, published to the log sink whenever the
/// relational write that produced it commits.
#[derive(Debug, Clone, Serialize)]
pub struct PersonLogRecord {
    pub id: PersonId,
    pub uuid: Uuid,
    pub team_id: TeamId,
    pub properties: Value,
    pub is_identified: bool,
    pub created_at: String,
}

impl From<&Person> for PersonLogRecord {
    fn from(p: &Person) -> Self {
        Self {
            id: p.id,
            uuid: p.uuid,
            team_id: p.team_id,
            properties: p.properties.clone(),
            is_identified: p.is_identified,
            created_at: p.created_at.to_rfc3339(),
        }
    }
}

pub struct NewPerson {
    pub team_id: TeamId,
    pub distinct_ids: Vec<String>,
    pub properties: Value,
    pub is_identified: bool,
}

/// Owns the relational representation of `Person` and `PersonDistinctId`, and
/// mirrors every committed mutation to the log sink afterwards. The two sinks
/// are never written inside the same transaction: if the log-sink publish
/// fails after a successful commit, the row store is already correct and the
/// caller surfaces a retryable emit error rather than re-running the write.
pub struct PersonStore {
    pool: PgPool,
    producer: FutureProducer<KafkaContext>,
    events_topic: String,
}

impl PersonStore {
    pub fn new(pool: PgPool, producer: FutureProducer<KafkaContext>, events_topic: String) -> Self {
        Self {
            pool,
            producer,
            events_topic,
        }
    }

    pub async fn find_by_distinct_id(
        &self,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, IngestError> {
        let person = sqlx::query_as!(
            Person,
            r#"
            SELECT p.id, p.created_at, p.team_id, p.uuid, p.properties, p.is_identified, p.is_user_id
            FROM posthog_person p
            INNER JOIN posthog_persondistinctid pd ON pd.person_id = p.id
            WHERE pd.team_id = $1 AND pd.distinct_id = $2
            "#,
            team_id,
            distinct_id
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(person)
    }

    pub async fn find_by_id(&self, person_id: PersonId) -> Result<Option<Person>, IngestError> {
        let person = sqlx::query_as!(
            Person,
            r#"
            SELECT id, created_at, team_id, uuid, properties, is_identified, is_user_id
            FROM posthog_person
            WHERE id = $1
            "#,
            person_id
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(person)
    }

    /// Creates a person row plus its distinct-id rows inside one transaction,
    /// then publishes the resulting row to the log sink. A unique-constraint
    /// violation on any distinct id surfaces as [IngestError::RaceConditionError]
    /// so the caller can re-fetch instead of retrying the create.
    pub async fn create(&self, new_person: NewPerson) -> Result<Person, IngestError> {
        let mut tx = self.pool.begin().await?;
        let uuid = Uuid::now_v7();
        let now = Utc::now();

        let person = sqlx::query_as!(
            Person,
            r#"
            INSERT INTO posthog_person (created_at, team_id, uuid, properties, is_identified, is_user_id)
            VALUES ($1, $2, $3, $4, $5, NULL)
            RETURNING id, created_at, team_id, uuid, properties, is_identified, is_user_id
            "#,
            now,
            new_person.team_id,
            uuid,
            new_person.properties,
            new_person.is_identified,
        )
        .fetch_one(&mut *tx)
        .await?;

        for distinct_id in &new_person.distinct_ids {
            sqlx::query!(
                r#"
                INSERT INTO posthog_persondistinctid (team_id, person_id, distinct_id)
                VALUES ($1, $2, $3)
                "#,
                new_person.team_id,
                person.id,
                distinct_id,
            )
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.publish(&person).await?;
        Ok(person)
    }

    /// Overwrites `properties`/`is_identified` and republishes. Callers are
    /// expected to have already merged the new properties into `properties`
    /// using the spec's set/set_once/increment semantics.
    pub async fn update_properties(
        &self,
        person_id: PersonId,
        properties: Value,
        is_identified: bool,
    ) -> Result<Person, IngestError> {
        let person = sqlx::query_as!(
            Person,
            r#"
            UPDATE posthog_person
            SET properties = $2, is_identified = $3
            WHERE id = $1
            RETURNING id, created_at, team_id, uuid, properties, is_identified, is_user_id
            "#,
            person_id,
            properties,
            is_identified,
        )
        .fetch_one(&self.pool)
        .await?;
        self.publish(&person).await?;
        Ok(person)
    }

    /// Updates properties, `created_at`, and `is_identified` in one statement;
    /// used by the merge protocol to fold an absorbed person's state into the
    /// survivor (`created_at` becomes the earlier of the two).
    pub async fn update_merged_person(
        &self,
        person_id: PersonId,
        properties: Value,
        created_at: chrono::DateTime<Utc>,
        is_identified: bool,
    ) -> Result<Person, IngestError> {
        let person = sqlx::query_as!(
            Person,
            r#"
            UPDATE posthog_person
            SET properties = $2, created_at = $3, is_identified = $4
            WHERE id = $1
            RETURNING id, created_at, team_id, uuid, properties, is_identified, is_user_id
            "#,
            person_id,
            properties,
            created_at,
            is_identified,
        )
        .fetch_one(&self.pool)
        .await?;
        self.publish(&person).await?;
        Ok(person)
    }

    /// Reassigns cohort memberships from the absorbed person to the
    /// survivor, part of step 4 of `merge_people`.
    pub async fn reassign_cohorts(
        &self,
        from_person: PersonId,
        into_person: PersonId,
    ) -> Result<(), IngestError> {
        sqlx::query!(
            r#"
            UPDATE posthog_cohortpeople
            SET person_id = $2
            WHERE person_id = $1
            "#,
            from_person,
            into_person,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Applies a per-key atomic `jsonb` increment, one key at a time, keeping
    /// each increment race-safe under concurrent writers. Non-numeric values
    /// are rejected by the caller before this is invoked. Publishes once with
    /// the final state.
    pub async fn increment_properties(
        &self,
        person_id: PersonId,
        increments: &serde_json::Map<String, Value>,
    ) -> Result<Person, IngestError> {
        let mut person = self
            .find_by_id(person_id)
            .await?
            .ok_or_else(|| IngestError::Fatal(format!("person {person_id} vanished mid-increment")))?;

        for (key, value) in increments {
            let Some(amount) = value.as_f64() else {
                continue;
            };
            let path = vec![key.clone()];
            person = sqlx::query_as!(
                Person,
                r#"
                UPDATE posthog_person
                SET properties = jsonb_set(
                    properties,
                    $2::text[],
                    to_jsonb(COALESCE((properties #>> $2::text[])::numeric, 0) + $3::numeric)
                )
                WHERE id = $1
                RETURNING id, created_at, team_id, uuid, properties, is_identified, is_user_id
                "#,
                person_id,
                &path,
                amount,
            )
            .fetch_one(&self.pool)
            .await?;
        }

        self.publish(&person).await?;
        Ok(person)
    }

    pub async fn delete(&self, person_id: PersonId) -> Result<(), IngestError> {
        sqlx::query!("DELETE FROM posthog_person WHERE id = $1", person_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_distinct_id(
        &self,
        team_id: TeamId,
        person_id: PersonId,
        distinct_id: &str,
    ) -> Result<(), IngestError> {
        sqlx::query!(
            r#"
            INSERT INTO posthog_persondistinctid (team_id, person_id, distinct_id)
            VALUES ($1, $2, $3)
            "#,
            team_id,
            person_id,
            distinct_id,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Repoints every distinct id owned by `from_person` to `into_person`.
    /// Called under the merge protocol's transaction; a unique-constraint
    /// violation here means a concurrent merge already moved a row and
    /// surfaces as [IngestError::RaceConditionError].
    pub async fn move_distinct_ids(
        &self,
        from_person: PersonId,
        into_person: PersonId,
    ) -> Result<(), IngestError> {
        sqlx::query!(
            r#"
            UPDATE posthog_persondistinctid
            SET person_id = $2
            WHERE person_id = $1
            "#,
            from_person,
            into_person,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn publish(&self, person: &Person) -> Result<(), IngestError> {
        let record = PersonLogRecord::from(person);
        send_keyed_iter_to_kafka(
            &self.producer,
            &self.events_topic,
            |p: &PersonLogRecord| Some(p.uuid.to_string()),
            [record],
        )
        .await?;
        Ok(())
    }
}
