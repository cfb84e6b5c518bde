//! In-memory reference implementation of the store traits

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::RwLock;

use conjure_types::{
    BackendJobId, CastId, DeliveryStrategy, GenerationId, GenerationRecord, GenerationStatus,
    SpellCast, UserId,
};

use crate::{CastStore, GenerationStore, Page, Result, StoreError};

/// Cursor format: `<created_at_millis>:<generation_uuid>`, opaque to callers.
fn encode_cursor(record: &GenerationRecord) -> String {
    format!("{}:{}", record.queued_at.timestamp_millis(), record.id.0)
}

fn decode_cursor(cursor: &str) -> Result<(DateTime<Utc>, String)> {
    let (millis, id) = cursor.split_once(':').ok_or_else(|| StoreError::InvalidCursor {
        cursor: cursor.to_string(),
    })?;
    let millis: i64 = millis.parse().map_err(|_| StoreError::InvalidCursor {
        cursor: cursor.to_string(),
    })?;
    let at = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::InvalidCursor {
            cursor: cursor.to_string(),
        })?;
    Ok((at, id.to_string()))
}

/// In-memory generation store with the required secondary indexes
#[derive(Clone, Default)]
pub struct InMemoryGenerationStore {
    inner: Arc<RwLock<GenerationState>>,
}

#[derive(Default)]
struct GenerationState {
    records: HashMap<GenerationId, GenerationRecord>,
    by_job: HashMap<BackendJobId, GenerationId>,
}

impl InMemoryGenerationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }
}

#[async_trait]
impl GenerationStore for InMemoryGenerationStore {
    async fn create(&self, record: GenerationRecord) -> Result<()> {
        let mut state = self.inner.write().await;
        if state.records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists {
                id: record.id.to_string(),
            });
        }
        if let Some(job) = &record.backend_job_id {
            state.by_job.insert(job.clone(), record.id.clone());
        }
        state.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &GenerationId) -> Result<GenerationRecord> {
        self.inner
            .read()
            .await
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn update(&self, mut record: GenerationRecord) -> Result<u64> {
        let mut state = self.inner.write().await;
        let stored = state
            .records
            .get(&record.id)
            .ok_or_else(|| StoreError::NotFound {
                id: record.id.to_string(),
            })?;
        if stored.version != record.version {
            return Err(StoreError::VersionConflict {
                id: record.id.to_string(),
                expected: record.version,
                found: stored.version,
            });
        }
        record.version += 1;
        let new_version = record.version;
        if let Some(job) = &record.backend_job_id {
            state.by_job.insert(job.clone(), record.id.clone());
        }
        state.records.insert(record.id.clone(), record);
        Ok(new_version)
    }

    async fn query_by_user(
        &self,
        user: &UserId,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<GenerationRecord>> {
        let boundary = cursor.map(decode_cursor).transpose()?;
        let state = self.inner.read().await;

        let mut matches: Vec<&GenerationRecord> = state
            .records
            .values()
            .filter(|r| &r.user == user)
            .collect();
        // (user, created_at desc), id as tiebreak for a stable order
        matches.sort_by(|a, b| {
            b.queued_at
                .cmp(&a.queued_at)
                .then_with(|| b.id.0.cmp(&a.id.0))
        });

        let start = match &boundary {
            None => 0,
            Some((at, id)) => matches
                .iter()
                .position(|r| {
                    r.queued_at < *at || (r.queued_at == *at && r.id.0.to_string() < *id)
                })
                .unwrap_or(matches.len()),
        };

        let items: Vec<GenerationRecord> = matches
            .into_iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect();
        let next_cursor = if items.len() == limit {
            items.last().map(encode_cursor)
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn query_by_cast(&self, cast_id: &CastId) -> Result<Vec<GenerationRecord>> {
        let state = self.inner.read().await;
        let mut matches: Vec<GenerationRecord> = state
            .records
            .values()
            .filter(|r| r.parent_cast_id.as_ref() == Some(cast_id))
            .cloned()
            .collect();
        matches.sort_by_key(|r| r.step_index);
        Ok(matches)
    }

    async fn query_by_status(
        &self,
        status: GenerationStatus,
        strategy: Option<DeliveryStrategy>,
    ) -> Result<Vec<GenerationRecord>> {
        let state = self.inner.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.status == status)
            .filter(|r| strategy.map(|s| r.delivery_strategy == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn find_by_backend_job(
        &self,
        job_id: &BackendJobId,
    ) -> Result<Option<GenerationRecord>> {
        let state = self.inner.read().await;
        Ok(state
            .by_job
            .get(job_id)
            .and_then(|id| state.records.get(id))
            .cloned())
    }
}

/// In-memory spell cast store
#[derive(Clone, Default)]
pub struct InMemoryCastStore {
    casts: Arc<RwLock<HashMap<CastId, SpellCast>>>,
}

impl InMemoryCastStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CastStore for InMemoryCastStore {
    async fn create(&self, cast: SpellCast) -> Result<()> {
        let mut casts = self.casts.write().await;
        if casts.contains_key(&cast.id) {
            return Err(StoreError::AlreadyExists {
                id: cast.id.to_string(),
            });
        }
        casts.insert(cast.id.clone(), cast);
        Ok(())
    }

    async fn get(&self, id: &CastId) -> Result<SpellCast> {
        self.casts
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn update(&self, cast: SpellCast) -> Result<()> {
        let mut casts = self.casts.write().await;
        let stored = casts.get(&cast.id).ok_or_else(|| StoreError::NotFound {
            id: cast.id.to_string(),
        })?;
        // generation_ids grows append-only
        if cast.generation_ids.len() < stored.generation_ids.len()
            || !cast.generation_ids[..stored.generation_ids.len()]
                .iter()
                .zip(&stored.generation_ids)
                .all(|(a, b)| a == b)
        {
            return Err(StoreError::VersionConflict {
                id: cast.id.to_string(),
                expected: stored.generation_ids.len() as u64,
                found: cast.generation_ids.len() as u64,
            });
        }
        casts.insert(cast.id.clone(), cast);
        Ok(())
    }

    async fn query_by_user(&self, user: &UserId, limit: usize) -> Result<Vec<SpellCast>> {
        let casts = self.casts.read().await;
        let mut matches: Vec<SpellCast> = casts
            .values()
            .filter(|c| &c.user == user)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matches.truncate(limit);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conjure_types::{CreditAmount, NormalizedInputs, Platform, ToolId};

    fn record(user: &UserId) -> GenerationRecord {
        GenerationRecord::queued(
            user.clone(),
            ToolId::from("t1"),
            NormalizedInputs::new(),
            DeliveryStrategy::Direct,
            CreditAmount::new(10),
            Platform::Api,
        )
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryGenerationStore::new();
        let user = UserId::new();
        let r = record(&user);
        let id = r.id.clone();
        store.create(r).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().user, user);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = InMemoryGenerationStore::new();
        let r = record(&UserId::new());
        store.create(r.clone()).await.unwrap();
        assert!(matches!(
            store.create(r).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_optimistic_concurrency() {
        let store = InMemoryGenerationStore::new();
        let r = record(&UserId::new());
        let id = r.id.clone();
        store.create(r).await.unwrap();

        let mut first = store.get(&id).await.unwrap();
        let second = store.get(&id).await.unwrap();

        first.status = GenerationStatus::Running;
        assert_eq!(store.update(first).await.unwrap(), 1);

        // The stale copy must be rejected
        let mut stale = second;
        stale.status = GenerationStatus::Cancelled;
        assert!(matches!(
            store.update(stale).await,
            Err(StoreError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_backend_job_index() {
        let store = InMemoryGenerationStore::new();
        let mut r = record(&UserId::new());
        let id = r.id.clone();
        store.create(r.clone()).await.unwrap();

        r = store.get(&id).await.unwrap();
        r.backend_job_id = Some(BackendJobId::new("job-9"));
        store.update(r).await.unwrap();

        let found = store
            .find_by_backend_job(&BackendJobId::new("job-9"))
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_user_query_pagination() {
        let store = InMemoryGenerationStore::new();
        let user = UserId::new();
        for _ in 0..5 {
            store.create(record(&user)).await.unwrap();
        }
        store.create(record(&UserId::new())).await.unwrap();

        let first = store.query_by_user(&user, 2, None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.expect("more pages");

        let mut seen: Vec<GenerationId> = first.items.iter().map(|r| r.id.clone()).collect();
        let mut cursor = Some(cursor);
        while let Some(c) = cursor {
            let page = store.query_by_user(&user, 2, Some(&c)).await.unwrap();
            seen.extend(page.items.iter().map(|r| r.id.clone()));
            cursor = page.next_cursor;
        }
        assert_eq!(seen.len(), 5);
        // No duplicates across pages
        let unique: std::collections::HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn test_query_by_status_and_strategy() {
        let store = InMemoryGenerationStore::new();
        let user = UserId::new();
        let mut a = record(&user);
        a.status = GenerationStatus::Running;
        a.delivery_strategy = DeliveryStrategy::Webhook;
        let mut b = record(&user);
        b.status = GenerationStatus::Running;
        b.delivery_strategy = DeliveryStrategy::Direct;
        store.create(a).await.unwrap();
        store.create(b).await.unwrap();

        let running_webhooks = store
            .query_by_status(GenerationStatus::Running, Some(DeliveryStrategy::Webhook))
            .await
            .unwrap();
        assert_eq!(running_webhooks.len(), 1);

        let all_running = store
            .query_by_status(GenerationStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(all_running.len(), 2);
    }

    #[tokio::test]
    async fn test_cast_store_append_only() {
        let store = InMemoryCastStore::new();
        let user = UserId::new();
        let cast = SpellCast {
            id: CastId::new(),
            spell_id: conjure_types::SpellId::new(),
            spell_version: 1,
            user: user.clone(),
            parameters: Default::default(),
            generation_ids: vec![GenerationId::new()],
            status: conjure_types::CastStatus::Running,
            current_step: 0,
            final_output: None,
            failed_step: None,
            accumulated_cost: CreditAmount::zero(),
            delivery: conjure_types::DeliveryIntent::api(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.create(cast.clone()).await.unwrap();

        // Growing is fine
        let mut grown = cast.clone();
        grown.generation_ids.push(GenerationId::new());
        store.update(grown.clone()).await.unwrap();

        // Shrinking is rejected
        let mut shrunk = grown;
        shrunk.generation_ids.pop();
        shrunk.generation_ids.pop();
        assert!(store.update(shrunk).await.is_err());
    }
}
