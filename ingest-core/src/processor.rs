use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::emitter::{CaptureInput, EventEmitter};
use crate::error::IngestError;
use crate::identity::IdentityResolver;
use crate::metric_consts::PROCESS_EVENT_TIME;
use crate::person_properties::PersonPropertyUpdate;
use crate::timestamp::{self, TimestampInputs};
use crate::types::{PluginEvent, TeamId};

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);

/// Top-level per-event orchestration: sanitize, resolve the timestamp,
/// resolve identity (best-effort), then capture or snapshot. Identity
/// failures never fail the event; capture/emit failures propagate to the
/// worker pool.
pub struct EventProcessor {
    identity: Arc<IdentityResolver>,
    emitter: Arc<EventEmitter>,
}

impl EventProcessor {
    pub fn new(identity: Arc<IdentityResolver>, emitter: Arc<EventEmitter>) -> Self {
        Self { identity, emitter }
    }

    pub async fn process_event(
        &self,
        team_id: TeamId,
        now: DateTime<Utc>,
        event_uuid: Uuid,
        mut data: PluginEvent,
    ) -> Result<Option<crate::types::CanonicalEvent>, IngestError> {
        let started = std::time::Instant::now();

        let person_property_update = PersonPropertyUpdate {
            set: data.set.clone(),
            set_once: data.set_once.clone(),
            increment: data.increment.clone(),
        };
        merge_top_level_set_properties(&mut data);

        let canonical_ts = timestamp::reconcile(
            &TimestampInputs {
                client_timestamp: data.timestamp.as_deref(),
                sent_at: data.sent_at.as_deref(),
                offset: data.offset,
            },
            now,
        )?;

        let identity_result = watchdog(
            self.dispatch_identity(team_id, &data),
            "identity resolution",
        )
        .await;
        if let Err(e) = identity_result {
            warn!(team_id, distinct_id = %data.distinct_id, error = %e, "identity resolution failed, continuing without it");
        }

        let result = if data.event == "$snapshot" {
            self.process_snapshot(team_id, &data, canonical_ts).await?;
            None
        } else {
            let canonical = self
                .emitter
                .capture(CaptureInput {
                    event_uuid,
                    team_id,
                    distinct_id: data.distinct_id.clone(),
                    ip: data.ip.clone(),
                    event: data.event.clone(),
                    properties: data.properties.clone(),
                    timestamp: canonical_ts,
                    person_property_update,
                })
                .await?;
            Some(canonical)
        };

        metrics::histogram!(PROCESS_EVENT_TIME, "team_id" => team_id.to_string())
            .record(started.elapsed().as_secs_f64());

        Ok(result)
    }

    async fn process_snapshot(
        &self,
        team_id: TeamId,
        data: &PluginEvent,
        timestamp: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        let session_id = data
            .properties
            .get("$session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| IngestError::InvalidInput("$snapshot event missing $session_id".to_string()))?
            .to_string();
        let snapshot_data = data
            .properties
            .get("$snapshot_data")
            .cloned()
            .unwrap_or(Value::Null);

        self.emitter
            .capture_session_recording(
                team_id,
                data.distinct_id.clone(),
                session_id,
                snapshot_data,
                timestamp,
                data.ip.clone(),
            )
            .await
    }

    /// Implements `handle_identify_or_alias`: `$create_alias` links
    /// `properties.alias` to `distinct_id`; `$identify` links
    /// `properties.$anon_distinct_id` (if present) to `distinct_id` and then
    /// marks it identified. Any other event just resolves-or-creates.
    async fn dispatch_identity(&self, team_id: TeamId, data: &PluginEvent) -> Result<(), IngestError> {
        match data.event.as_str() {
            "$create_alias" => {
                let prev = data
                    .properties
                    .get("alias")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        IngestError::InvalidInput("$create_alias missing alias property".to_string())
                    })?;
                self.identity.merge(team_id, prev, &data.distinct_id).await?;
            }
            "$identify" => {
                if let Some(anon_distinct_id) =
                    data.properties.get("$anon_distinct_id").and_then(Value::as_str)
                {
                    self.identity
                        .merge(team_id, anon_distinct_id, &data.distinct_id)
                        .await?;
                }
                self.identity.identify(team_id, &data.distinct_id).await?;
            }
            _ => {
                self.identity.resolve_or_create(team_id, &data.distinct_id).await?;
            }
        }
        Ok(())
    }
}

fn merge_top_level_set_properties(event: &mut PluginEvent) {
    if let Some(set) = event.set.take() {
        for (key, value) in set {
            event.properties.insert(key, value);
        }
    }
    if let Some(set_once) = event.set_once.take() {
        for (key, value) in set_once {
            event.properties.entry(key).or_insert(value);
        }
    }
}

/// Logs (but never cancels) work that runs past the watchdog window. The
/// inner future always runs to completion; this only changes when we notice.
async fn watchdog<F, T>(fut: F, label: &str) -> Result<T, IngestError>
where
    F: std::future::Future<Output = Result<T, IngestError>>,
{
    tokio::pin!(fut);
    match tokio::time::timeout(WATCHDOG_TIMEOUT, &mut fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(label, "watchdog timeout exceeded, still waiting for completion");
            fut.await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_set_once_does_not_override_existing() {
        let mut event = PluginEvent {
            distinct_id: "d1".to_string(),
            ip: None,
            site_url: String::new(),
            team_id: 1,
            now: "2024-01-01T00:00:00Z".to_string(),
            sent_at: None,
            timestamp: None,
            offset: None,
            event: "pageview".to_string(),
            properties: Map::new(),
            set: None,
            set_once: Some({
                let mut m = Map::new();
                m.insert("color".to_string(), json!("blue"));
                m
            }),
            increment: None,
        };
        event.properties.insert("color".to_string(), json!("red"));
        merge_top_level_set_properties(&mut event);
        assert_eq!(event.properties["color"], json!("red"));
    }

    #[test]
    fn merge_set_overrides_existing() {
        let mut event = PluginEvent {
            distinct_id: "d1".to_string(),
            ip: None,
            site_url: String::new(),
            team_id: 1,
            now: "2024-01-01T00:00:00Z".to_string(),
            sent_at: None,
            timestamp: None,
            offset: None,
            event: "pageview".to_string(),
            properties: Map::new(),
            set: Some({
                let mut m = Map::new();
                m.insert("color".to_string(), json!("blue"));
                m
            }),
            set_once: None,
            increment: None,
        };
        event.properties.insert("color".to_string(), json!("red"));
        merge_top_level_set_properties(&mut event);
        assert_eq!(event.properties["color"], json!("blue"));
    }
}
