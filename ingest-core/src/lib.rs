pub mod app_context;
pub mod config;
pub mod elements;
pub mod emitter;
pub mod error;
pub mod identity;
pub mod ids;
pub mod metric_consts;
pub mod person;
pub mod person_properties;
pub mod processor;
pub mod server;
pub mod teams;
pub mod timestamp;
pub mod types;
pub mod wire;
pub mod worker_pool;
