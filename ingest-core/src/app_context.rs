use std::sync::Arc;

use common_kafka::kafka_producer::{create_kafka_producer, KafkaContext};
use health::{HealthHandle, HealthRegistry};
use rdkafka::producer::FutureProducer;
use sqlx::postgres::PgPoolOptions;

use crate::config::Config;
use crate::emitter::EventEmitter;
use crate::error::IngestError;
use crate::identity::IdentityResolver;
use crate::person::{PersonManager, PersonStore};
use crate::person_properties::PersonPropertyUpdater;
use crate::processor::EventProcessor;
use crate::teams::TeamCache;
use crate::worker_pool::WorkerPool;

/// Everything the worker pool needs to process an event, wired once at
/// startup. The Event Processor and Identity Resolver don't own each other;
/// both hold references into this context instead.
pub struct AppContext {
    pub health_registry: HealthRegistry,
    pub worker_liveness: HealthHandle,
    pub processor: Arc<EventProcessor>,
    pub worker_pool: Arc<WorkerPool>,
    pub config: Config,
}

impl AppContext {
    pub async fn new(config: Config) -> Result<Self, IngestError> {
        let health_registry = HealthRegistry::new("liveness");
        let worker_liveness = health_registry
            .register("ingest-worker".to_string(), std::time::Duration::from_secs(60))
            .await;

        let producer: FutureProducer<KafkaContext> =
            create_kafka_producer(&config.kafka, worker_liveness.clone())
                .await
                .map_err(|e| IngestError::Fatal(format!("failed to create kafka producer: {e}")))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_pg_connections)
            .connect(&config.database_url)
            .await?;

        let redis = Arc::new(common_redis::RedisClient::new(config.redis_url.clone()).await?)
            as Arc<dyn common_redis::Client + Send + Sync>;

        let teams = Arc::new(TeamCache::new(
            pool.clone(),
            config.team_cache_max_size,
            config.team_cache_ttl_secs,
        ));

        let person_store = Arc::new(PersonStore::new(
            pool.clone(),
            producer.clone(),
            config.events_topic.clone(),
        ));
        let person_manager = Arc::new(PersonManager::new(
            person_store.clone(),
            redis,
            config.person_negative_cache_ttl_secs,
        ));

        let identity = Arc::new(IdentityResolver::new(person_store.clone(), person_manager.clone()));
        let person_properties = Arc::new(PersonPropertyUpdater::new(
            person_store.clone(),
            config.use_log_sink,
        ));
        let emitter = Arc::new(EventEmitter::new(
            pool.clone(),
            producer.clone(),
            teams.clone(),
            person_store.clone(),
            person_manager.clone(),
            person_properties,
            config.events_topic.clone(),
            config.session_recording_topic.clone(),
            config.use_log_sink,
        ));

        let processor = Arc::new(EventProcessor::new(identity, emitter));
        let worker_pool = Arc::new(WorkerPool::new(
            config.worker_concurrency,
            config.tasks_per_worker,
        ));

        Ok(Self {
            health_registry,
            worker_liveness,
            processor,
            worker_pool,
            config,
        })
    }
}
