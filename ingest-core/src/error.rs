use common_kafka::kafka_producer::KafkaProduceError;
use common_redis::CustomRedisError;
use thiserror::Error;

/// An unhandled failure at some infrastructure boundary: config, kafka, redis,
/// serialization. Always fatal for the event in progress.
#[derive(Debug, Error)]
pub enum UnhandledError {
    #[error("config error: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("kafka produce error: {0}")]
    KafkaProduceError(#[from] KafkaProduceError),
    #[error("redis error: {0}")]
    RedisError(#[from] CustomRedisError),
    #[error("serde error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("unhandled error: {0}")]
    Other(String),
}

/// The error taxonomy the ingestion core distinguishes (see error handling design).
/// Every `sqlx::Error` crossing a component boundary is classified into one of
/// these at the `From` impl below, so call sites never need to re-inspect SQLSTATE.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Expected; drives the merge loop and create-or-refetch retries.
    #[error("race condition: {0}")]
    RaceConditionError(String),

    /// Propagated to the worker pool; the delivery layer decides whether to replay.
    #[error("transient storage error: {0}")]
    TransientStorageError(String),

    /// Caught and reported by the event processor; the event continues regardless.
    #[error("plugin error: {0}")]
    PluginError(String),

    #[error(transparent)]
    Unhandled(#[from] UnhandledError),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl From<sqlx::Error> for IngestError {
    fn from(e: sqlx::Error) -> Self {
        if common_database::is_unique_constraint_error(&e)
            || common_database::is_foreign_key_constraint_error(&e)
        {
            IngestError::RaceConditionError(e.to_string())
        } else if common_database::is_transient_error(&e) {
            IngestError::TransientStorageError(e.to_string())
        } else {
            IngestError::Fatal(e.to_string())
        }
    }
}

impl From<KafkaProduceError> for IngestError {
    fn from(e: KafkaProduceError) -> Self {
        IngestError::Unhandled(UnhandledError::KafkaProduceError(e))
    }
}

impl From<CustomRedisError> for IngestError {
    fn from(e: CustomRedisError) -> Self {
        IngestError::Unhandled(UnhandledError::RedisError(e))
    }
}

impl IngestError {
    /// True for the merge loop's recognized retry trigger: a peer worker raced
    /// us on a foreign key or unique constraint.
    pub fn is_race_condition(&self) -> bool {
        matches!(self, IngestError::RaceConditionError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::{borrow::Cow, error::Error as StdError, fmt};

    #[derive(Debug)]
    struct MockDbError {
        msg: &'static str,
        code: Option<&'static str>,
        kind: ErrorKind,
    }

    impl fmt::Display for MockDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.msg)
        }
    }

    impl StdError for MockDbError {}

    impl DatabaseError for MockDbError {
        fn message(&self) -> &str {
            self.msg
        }
        fn kind(&self) -> ErrorKind {
            match self.kind {
                ErrorKind::UniqueViolation => ErrorKind::UniqueViolation,
                ErrorKind::ForeignKeyViolation => ErrorKind::ForeignKeyViolation,
                _ => ErrorKind::Other,
            }
        }
        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::from)
        }
        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }
        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }
        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }
    }

    fn fk_violation() -> sqlx::Error {
        sqlx::Error::from(MockDbError {
            msg: "insert or update on table violates foreign key constraint",
            code: Some("23503"),
            kind: ErrorKind::ForeignKeyViolation,
        })
    }

    #[test]
    fn foreign_key_violation_classifies_as_race_condition() {
        // Mirrors S5: a concurrent add_distinct_id races merge_people's
        // delete(other), which fails with an FK violation the merge loop
        // must recognize and retry rather than treat as fatal.
        let err: IngestError = fk_violation().into();
        assert!(err.is_race_condition());
    }

    #[test]
    fn unique_violation_still_classifies_as_race_condition() {
        let err: IngestError = sqlx::Error::from(MockDbError {
            msg: "duplicate key value violates unique constraint",
            code: Some("23505"),
            kind: ErrorKind::UniqueViolation,
        })
        .into();
        assert!(err.is_race_condition());
    }
}
