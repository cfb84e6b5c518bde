//! Conjure Store - Durable records of generations and spell casts
//!
//! Each domain gets its own store trait; the engine, spell runner, and
//! dispatcher consume the traits and never a concrete backend. The
//! in-memory implementation here is the reference: it enforces the same
//! contract a database-backed implementation must (optimistic concurrency
//! on a version field, append-only cast step lists, cursor pagination).
//!
//! Required indexes: `(user, created_at desc)`, `(parent_cast_id,
//! step_index)`, `(status, delivery_strategy)`, `(backend_job_id)`.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use conjure_types::{
    BackendJobId, CastId, DeliveryStrategy, GenerationId, GenerationRecord, GenerationStatus,
    SpellCast, UserId,
};

pub use memory::{InMemoryCastStore, InMemoryGenerationStore};

/// Errors from store operations
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Record not found: {id}")]
    NotFound { id: String },

    #[error("Record already exists: {id}")]
    AlreadyExists { id: String },

    #[error("Version conflict on {id}: expected {expected}, found {found}")]
    VersionConflict {
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("Invalid cursor: {cursor}")]
    InvalidCursor { cursor: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One page of a cursor-paginated query.
///
/// Cursors are opaque server-side tokens; callers never paginate by offset,
/// so large histories cannot degenerate into full scans.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// Durable store of generation records
#[async_trait]
pub trait GenerationStore: Send + Sync {
    /// Insert a fresh record. Fails if the id already exists.
    async fn create(&self, record: GenerationRecord) -> Result<()>;

    async fn get(&self, id: &GenerationId) -> Result<GenerationRecord>;

    /// Persist `record` if its `version` matches the stored version; the
    /// stored copy gets `version + 1`. Returns the new version.
    async fn update(&self, record: GenerationRecord) -> Result<u64>;

    /// A user's generations, newest first, cursor-paginated.
    async fn query_by_user(
        &self,
        user: &UserId,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<GenerationRecord>>;

    /// Step generations of a cast, ordered by step index.
    async fn query_by_cast(&self, cast_id: &CastId) -> Result<Vec<GenerationRecord>>;

    /// Records in a status with a delivery strategy; used by the dispatcher
    /// and the stale-sweeper.
    async fn query_by_status(
        &self,
        status: GenerationStatus,
        strategy: Option<DeliveryStrategy>,
    ) -> Result<Vec<GenerationRecord>>;

    /// Webhook correlation: the record a backend job id belongs to.
    async fn find_by_backend_job(&self, job_id: &BackendJobId)
        -> Result<Option<GenerationRecord>>;
}

/// Durable store of spell casts
#[async_trait]
pub trait CastStore: Send + Sync {
    async fn create(&self, cast: SpellCast) -> Result<()>;

    async fn get(&self, id: &CastId) -> Result<SpellCast>;

    /// Replace the stored cast. The step generation-id list must only grow;
    /// shrinking it is a contract violation the store rejects.
    async fn update(&self, cast: SpellCast) -> Result<()>;

    async fn query_by_user(&self, user: &UserId, limit: usize) -> Result<Vec<SpellCast>>;
}
