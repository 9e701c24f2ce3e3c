/// Saga primary keys are time-ordered UUIDs (v7).
pub type SagaId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Allocate a fresh saga id.
pub fn new_saga_id() -> SagaId {
    uuid::Uuid::now_v7()
}
