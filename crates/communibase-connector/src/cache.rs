//! Process-local read-through caches.
//!
//! There are three independent stores, all partitioned by entity type:
//!
//! - the object cache, holding the in-flight or settled [`Completion`] of every point lookup,
//! - the id-list cache, holding the ids matched by a search, keyed by a [`QueryHash`],
//! - the aggregate cache, holding aggregation results, keyed by a [`QueryHash`].
//!
//! The query stores are size bounded LRU caches. Results are only stored once the remote call
//! succeeded, and only if the entity type was not invalidated while the call was in flight,
//! which is tracked through per entity type generations captured in a [`QueryTicket`].

use std::collections::HashMap;
use std::fmt;

use moka::policy::EvictionPolicy;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::completion::Completion;
use crate::config::CacheConfig;
use crate::types::{Document, EntityType, ObjectId, Params};

/// A deterministic SHA-256 digest of an entity type, a selector or pipeline, and parameters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryHash([u8; 32]);

impl QueryHash {
    pub fn new(entity_type: &EntityType, query: &Value, params: Option<&Params>) -> Self {
        // serde_json keeps object keys sorted, so equal queries serialize identically
        let key = serde_json::json!([entity_type, query, params]);
        let hash = Sha256::digest(key.to_string().as_bytes());
        Self(hash.into())
    }
}

impl fmt::Debug for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Permission to store the result of a query issued at a given generation.
#[derive(Debug, Clone)]
pub struct QueryTicket {
    entity_type: EntityType,
    hash: QueryHash,
    generation: u64,
}

impl QueryTicket {
    pub fn hash(&self) -> QueryHash {
        self.hash
    }
}

type Store<V> = moka::sync::Cache<QueryHash, V>;

/// Per entity type LRU stores of query results.
struct QueryStore<V> {
    name: &'static str,
    capacity: u64,
    inner: Mutex<QueryStoreInner<V>>,
}

struct QueryStoreInner<V> {
    stores: HashMap<EntityType, Store<V>>,
    generations: HashMap<EntityType, u64>,
}

impl<V> QueryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn new(name: &'static str, capacity: u64) -> Self {
        Self {
            name,
            capacity,
            inner: Mutex::new(QueryStoreInner {
                stores: HashMap::new(),
                generations: HashMap::new(),
            }),
        }
    }

    fn get(&self, entity_type: &EntityType, hash: &QueryHash) -> Option<V> {
        let inner = self.inner.lock();
        let value = inner.stores.get(entity_type)?.get(hash);
        if value.is_some() {
            tracing::trace!(store = self.name, %entity_type, ?hash, "Cache hit");
        }
        value
    }

    fn ticket(&self, entity_type: &EntityType, hash: QueryHash) -> QueryTicket {
        let inner = self.inner.lock();
        QueryTicket {
            entity_type: entity_type.clone(),
            hash,
            generation: inner.generations.get(entity_type).copied().unwrap_or(0),
        }
    }

    /// Stores `value`, unless the entity type was invalidated since `ticket` was issued.
    fn put(&self, ticket: &QueryTicket, value: V) -> bool {
        let mut inner = self.inner.lock();
        let generation = inner
            .generations
            .get(&ticket.entity_type)
            .copied()
            .unwrap_or(0);
        if generation != ticket.generation {
            tracing::trace!(
                store = self.name,
                entity_type = %ticket.entity_type,
                "Discarding query result invalidated while in flight"
            );
            return false;
        }

        let capacity = self.capacity;
        inner
            .stores
            .entry(ticket.entity_type.clone())
            .or_insert_with(|| {
                Store::builder()
                    .max_capacity(capacity)
                    .eviction_policy(EvictionPolicy::lru())
                    .build()
            })
            .insert(ticket.hash, value);
        true
    }

    fn invalidate(&self, entity_type: &EntityType) {
        let mut inner = self.inner.lock();
        inner.stores.remove(entity_type);
        *inner.generations.entry(entity_type.clone()).or_insert(0) += 1;
    }

    #[cfg(test)]
    fn len(&self, entity_type: &EntityType) -> u64 {
        let inner = self.inner.lock();
        inner.stores.get(entity_type).map_or(0, |store| {
            store.run_pending_tasks();
            store.entry_count()
        })
    }
}

/// The object, id-list and aggregate caches of one connector.
pub struct ReadThroughCache {
    objects: Mutex<HashMap<EntityType, HashMap<ObjectId, Completion<Document>>>>,
    ids: QueryStore<Vec<String>>,
    aggregates: QueryStore<Value>,
}

impl fmt::Debug for ReadThroughCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("ids_capacity", &self.ids.capacity)
            .field("aggregate_capacity", &self.aggregates.capacity)
            .finish_non_exhaustive()
    }
}

impl ReadThroughCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            ids: QueryStore::new("ids", config.ids_capacity),
            aggregates: QueryStore::new("aggregate", config.aggregate_capacity),
        }
    }

    /// Returns the cached completion of a point lookup.
    ///
    /// A rejected completion counts as absent and is dropped.
    pub fn get_object(
        &self,
        entity_type: &EntityType,
        object_id: &ObjectId,
    ) -> Option<Completion<Document>> {
        let mut objects = self.objects.lock();
        let entries = objects.get_mut(entity_type)?;
        let completion = entries.get(object_id)?;
        if completion.is_rejected() {
            entries.remove(object_id);
            return None;
        }
        metric!(counter("cache.object.hit") += 1);
        Some(completion.clone())
    }

    /// Stores the (possibly still in-flight) completion of a point lookup.
    pub fn put_object(
        &self,
        entity_type: &EntityType,
        object_id: &ObjectId,
        completion: Completion<Document>,
    ) {
        self.objects
            .lock()
            .entry(entity_type.clone())
            .or_default()
            .insert(object_id.clone(), completion);
    }

    pub fn invalidate_object(&self, entity_type: &EntityType, object_id: &str) {
        let mut objects = self.objects.lock();
        if let Some(entries) = objects.get_mut(entity_type) {
            entries.remove(object_id);
        }
    }

    /// Drops everything cached for `entity_type`, in all three stores.
    pub fn invalidate_type(&self, entity_type: &EntityType) {
        self.objects.lock().remove(entity_type);
        self.invalidate_queries(entity_type);
    }

    /// Drops the id-list and aggregate stores of `entity_type`.
    pub fn invalidate_queries(&self, entity_type: &EntityType) {
        self.ids.invalidate(entity_type);
        self.aggregates.invalidate(entity_type);
    }

    pub fn get_ids_for_query(
        &self,
        entity_type: &EntityType,
        hash: &QueryHash,
    ) -> Option<Vec<String>> {
        let ids = self.ids.get(entity_type, hash);
        if ids.is_some() {
            metric!(counter("cache.ids.hit") += 1);
        }
        ids
    }

    /// Captures the current generation of the id-list store before a search is issued.
    pub fn ids_ticket(&self, entity_type: &EntityType, hash: QueryHash) -> QueryTicket {
        self.ids.ticket(entity_type, hash)
    }

    pub fn put_ids_for_query(&self, ticket: &QueryTicket, ids: Vec<String>) -> bool {
        self.ids.put(ticket, ids)
    }

    pub fn get_aggregate(&self, entity_type: &EntityType, hash: &QueryHash) -> Option<Value> {
        let result = self.aggregates.get(entity_type, hash);
        if result.is_some() {
            metric!(counter("cache.aggregate.hit") += 1);
        }
        result
    }

    /// Captures the current generation of the aggregate store before a pipeline is issued.
    pub fn aggregate_ticket(&self, entity_type: &EntityType, hash: QueryHash) -> QueryTicket {
        self.aggregates.ticket(entity_type, hash)
    }

    pub fn put_aggregate(&self, ticket: &QueryTicket, result: Value) -> bool {
        self.aggregates.put(ticket, result)
    }
}
