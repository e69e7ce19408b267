pub const EVENTS_RECEIVED: &str = "ingest_events_received";
pub const EVENTS_PROCESSED: &str = "ingest_events_processed";
pub const EVENTS_DROPPED: &str = "ingest_events_dropped";
pub const PROCESS_EVENT_TIME: &str = "ingest_process_event_time";
pub const IDENTITY_RESOLUTION_TIME: &str = "ingest_identity_resolution_time";
pub const IDENTITY_RESOLUTION_ERRORS: &str = "ingest_identity_resolution_errors";
pub const MERGE_ATTEMPTS: &str = "ingest_merge_attempts";
pub const MERGE_RACE_RETRIES: &str = "ingest_merge_race_retries";
pub const PERSON_CREATED: &str = "ingest_person_created";
pub const PERSON_DELETED: &str = "ingest_person_deleted";
pub const TEAM_CACHE_HITS: &str = "ingest_team_cache_hits";
pub const TEAM_CACHE_MISSES: &str = "ingest_team_cache_misses";
pub const PERSON_MANAGER_CACHE_HITS: &str = "ingest_person_manager_cache_hits";
pub const PERSON_MANAGER_CACHE_MISSES: &str = "ingest_person_manager_cache_misses";
pub const EVENT_EMIT_TIME: &str = "ingest_event_emit_time";
pub const WORKER_POOL_INFLIGHT: &str = "ingest_worker_pool_inflight";
pub const WORKER_CRASHED: &str = "ingest_worker_crashed";
