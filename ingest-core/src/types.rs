use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type TeamId = i32;
pub type PersonId = i64;

/// Read-only replica of the team config the core needs. Loaded through the
/// team cache; the core never writes this table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Team {
    pub id: TeamId,
    pub uuid: Uuid,
    pub organization_id: Uuid,
    pub api_token: String,
    pub name: String,
    pub anonymize_ips: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Person {
    pub id: PersonId,
    pub created_at: DateTime<Utc>,
    pub team_id: TeamId,
    pub uuid: Uuid,
    pub properties: Value,
    pub is_identified: bool,
    pub is_user_id: Option<i32>,
}

/// A raw event as received from the intake layer, before identity resolution
/// or canonicalization. Untrusted: every field may be absent or malformed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEvent {
    pub distinct_id: String,
    pub ip: Option<String>,
    pub site_url: String,
    pub team_id: TeamId,
    pub now: String,
    pub sent_at: Option<String>,
    pub timestamp: Option<String>,
    pub offset: Option<i64>,
    pub event: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, Value>,
    #[serde(rename = "$set", default, skip_serializing_if = "Option::is_none")]
    pub set: Option<serde_json::Map<String, Value>>,
    #[serde(rename = "$set_once", default, skip_serializing_if = "Option::is_none")]
    pub set_once: Option<serde_json::Map<String, Value>>,
    #[serde(rename = "$increment", default, skip_serializing_if = "Option::is_none")]
    pub increment: Option<serde_json::Map<String, Value>>,
}

/// The post-processing event representation written to a sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanonicalEvent {
    pub uuid: Uuid,
    pub event: String,
    /// JSON-encoded properties, matching the wire format's string field.
    pub properties: String,
    pub timestamp: String,
    pub team_id: i64,
    pub distinct_id: String,
    pub elements_chain: String,
    pub created_at: String,
}

/// A session-recording ("$snapshot") event, emitted verbatim with no
/// element extraction or definition bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecordingEvent {
    pub uuid: Uuid,
    pub team_id: TeamId,
    pub distinct_id: String,
    pub session_id: String,
    pub snapshot_data: Value,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Event names exempt from event/property definition bookkeeping.
pub const EVENTS_WITHOUT_DEFINITION: &[&str] = &["$$plugin_metrics"];
