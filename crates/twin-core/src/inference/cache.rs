use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::error::Result;
use crate::models::Prediction;
use crate::store::MetadataStore;
use crate::twin::KeyedLocks;

/// Invalidation generation of one entity.
///
/// Observed before the entity is read; a prediction computed from that read
/// is only kept if no invalidation happened in between.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityEpoch(u64);

/// TTL prediction cache over the metadata store.
///
/// Entries are ordinary persisted predictions; the cache adds per
/// (model, entity) critical sections so concurrent misses for the same pair
/// compute once.
pub struct PredictionCache {
    store: Arc<dyn MetadataStore>,
    key_locks: KeyedLocks<(String, String)>,
    epochs: DashMap<String, u64>,
}

impl PredictionCache {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            key_locks: KeyedLocks::new(),
            epochs: DashMap::new(),
        }
    }

    pub fn entity_epoch(&self, entity_id: &str) -> EntityEpoch {
        EntityEpoch(self.epochs.get(entity_id).map(|e| *e).unwrap_or(0))
    }

    /// Enter the critical section for a (model, entity) pair
    pub async fn lock_key(&self, model_id: &str, entity_id: &str) -> OwnedMutexGuard<()> {
        self.key_locks
            .lock((model_id.to_string(), entity_id.to_string()))
            .await
    }

    /// Unexpired prediction for the exact pair, returned unchanged
    pub async fn lookup(
        &self,
        twin_id: &str,
        model_id: &str,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Prediction>> {
        let hit = self
            .store
            .find_cached_prediction(twin_id, model_id, Some(entity_id), now)
            .await?;
        if let Some(prediction) = &hit {
            debug!(
                prediction_id = %prediction.id,
                model_id = %model_id,
                entity_id = %entity_id,
                expires_at = %prediction.expires_at,
                "Prediction cache hit"
            );
        }
        Ok(hit)
    }

    pub async fn insert(&self, prediction: &Prediction) -> Result<()> {
        self.store.put_prediction(prediction).await
    }

    /// Store a prediction computed from an entity read at `observed`.
    ///
    /// If the entity was invalidated since, the prediction is removed again
    /// and `false` is returned. The epoch is checked after the write, so an
    /// invalidation racing the write either sees the row or is seen here.
    pub async fn insert_if_current(
        &self,
        prediction: &Prediction,
        entity_id: &str,
        observed: EntityEpoch,
    ) -> Result<bool> {
        self.store.put_prediction(prediction).await?;
        if self.entity_epoch(entity_id) == observed {
            return Ok(true);
        }
        self.store.delete_prediction(&prediction.id).await?;
        debug!(
            prediction_id = %prediction.id,
            entity_id = %entity_id,
            "Entity changed while predicting, result not cached"
        );
        Ok(false)
    }

    /// Drop every cached prediction keyed to `entity_id`
    pub async fn invalidate_entity(&self, entity_id: &str) -> Result<usize> {
        *self.epochs.entry(entity_id.to_string()).or_insert(0) += 1;
        let removed = self.store.delete_predictions_for_entity(entity_id).await?;
        debug!(entity_id = %entity_id, removed, "Entity predictions invalidated");
        Ok(removed)
    }

    /// Remove expired predictions and idle key locks
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.delete_expired_predictions(now).await?;
        self.key_locks.prune_idle();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{new_id, AttributeMap, PredictionKind};
    use crate::store::InMemoryMetadataStore;
    use chrono::Duration;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn prediction(entity_id: &str, ttl_secs: i64) -> Prediction {
        let now = Utc::now();
        Prediction {
            id: new_id(),
            twin_id: "t1".into(),
            model_id: "m1".into(),
            entity_id: Some(entity_id.into()),
            entity_type: Some("pump".into()),
            kind: PredictionKind::Point,
            input: AttributeMap::new(),
            output: json!(3.0),
            confidence: 1.0,
            cached_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
        }
    }

    #[tokio::test]
    async fn test_lookup_insert_invalidate() {
        let cache = PredictionCache::new(Arc::new(InMemoryMetadataStore::new()));
        let p = prediction("e1", 60);
        cache.insert(&p).await.unwrap();
        cache.insert(&prediction("e2", 60)).await.unwrap();

        let hit = cache.lookup("t1", "m1", "e1", Utc::now()).await.unwrap();
        assert_eq!(hit.unwrap().id, p.id);

        assert_eq!(cache.invalidate_entity("e1").await.unwrap(), 1);
        assert!(cache.lookup("t1", "m1", "e1", Utc::now()).await.unwrap().is_none());
        assert!(cache.lookup("t1", "m1", "e2", Utc::now()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_insert_after_invalidation_is_discarded() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let cache = PredictionCache::new(store.clone());

        let observed = cache.entity_epoch("e1");
        cache.invalidate_entity("e1").await.unwrap();
        assert_ne!(cache.entity_epoch("e1"), observed);

        let stale = prediction("e1", 60);
        assert!(!cache.insert_if_current(&stale, "e1", observed).await.unwrap());
        assert!(store.get_prediction(&stale.id).await.unwrap().is_none());

        let current = cache.entity_epoch("e1");
        let fresh = prediction("e1", 60);
        assert!(cache.insert_if_current(&fresh, "e1", current).await.unwrap());
        let hit = cache.lookup("t1", "m1", "e1", Utc::now()).await.unwrap();
        assert_eq!(hit.unwrap().id, fresh.id);

        // Other entities keep their epoch
        assert_eq!(cache.entity_epoch("e2"), EntityEpoch::default());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_and_idle_locks() {
        let cache = PredictionCache::new(Arc::new(InMemoryMetadataStore::new()));
        cache.insert(&prediction("e1", 0)).await.unwrap();
        drop(cache.lock_key("m1", "e1").await);
        assert_eq!(cache.key_locks.len(), 1);

        let removed = cache.sweep(Utc::now() + Duration::seconds(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.key_locks.is_empty());
    }

    #[tokio::test]
    async fn test_key_lock_serializes_same_pair() {
        let cache = Arc::new(PredictionCache::new(Arc::new(InMemoryMetadataStore::new())));
        let guard = cache.lock_key("m1", "e1").await;

        let contender = {
            let cache = cache.clone();
            tokio::spawn(async move {
                let _guard = cache.lock_key("m1", "e1").await;
            })
        };
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // A different pair is not blocked
        let _other = cache.lock_key("m1", "e2").await;

        drop(guard);
        contender.await.unwrap();
    }
}
