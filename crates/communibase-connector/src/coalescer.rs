//! Merges point lookups of one scheduling turn into batched searches.
//!
//! Every lookup registered while the current task runs lands in the window of its entity type.
//! The first registration into empty windows arms a flush: a spawned task that yields once to
//! the scheduler and then swaps out all windows, issuing one `{"_id": {"$in": [..]}}` search per
//! entity type and fanning the results back out to the waiting lookups.
//!
//! On a multi-threaded runtime the flush may run on another worker while the caller is still
//! registering lookups. Lists of ids are therefore registered under a single lock through
//! [`Coalescer::request_by_ids`], which keeps them in one batch on any runtime.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime;

use crate::cache::ReadThroughCache;
use crate::completion::{Completer, Completion};
use crate::dispatcher::Dispatcher;
use crate::error::ConnectorError;
use crate::remote::RemoteRequest;
use crate::types::{Document, EntityType, ObjectId, document_id};

/// A point lookup waiting for the next flush.
struct PendingLookup {
    completer: Completer<Document>,
    completion: Completion<Document>,
}

/// The pending lookups of one entity type, accumulated since the last flush.
type Window = HashMap<ObjectId, PendingLookup>;

enum Lookup {
    /// Rejected right away, or answered from the cache.
    Settled(Completion<Document>),
    Unregistered(ObjectId),
}

#[derive(Default)]
struct CoalescerState {
    windows: HashMap<EntityType, Window>,
    flush_armed: bool,
}

/// Batches concurrent point lookups.
#[derive(Clone)]
pub struct Coalescer {
    dispatcher: Arc<Dispatcher>,
    state: Arc<Mutex<CoalescerState>>,
    runtime: runtime::Handle,
}

impl std::fmt::Debug for Coalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Coalescer")
            .field("pending_types", &state.windows.len())
            .field("flush_armed", &state.flush_armed)
            .finish()
    }
}

impl Coalescer {
    pub fn new(dispatcher: Arc<Dispatcher>, runtime: runtime::Handle) -> Self {
        Self {
            dispatcher,
            state: Arc::default(),
            runtime,
        }
    }

    /// Looks up a single object, sharing the remote call with every other lookup of this turn.
    ///
    /// When `cache` is given, a cached completion is returned as is, and a new lookup is
    /// recorded in the cache right away so that later callers share it.
    pub fn request_by_id(
        &self,
        entity_type: &EntityType,
        object_id: &str,
        cache: Option<&ReadThroughCache>,
    ) -> Completion<Document> {
        match self.lookup(entity_type, object_id, cache) {
            Lookup::Settled(completion) => completion,
            Lookup::Unregistered(object_id) => {
                let mut state = self.state.lock();
                self.register(&mut state, entity_type, object_id, cache)
            }
        }
    }

    /// Looks up a list of objects, returning one completion per id in the same order.
    ///
    /// All ids are registered at once, so ids that are not cached always end up in the same
    /// batch, no matter when the flush runs.
    pub fn request_by_ids<I: AsRef<str>>(
        &self,
        entity_type: &EntityType,
        object_ids: &[I],
        cache: Option<&ReadThroughCache>,
    ) -> Vec<Completion<Document>> {
        let lookups: Vec<_> = object_ids
            .iter()
            .map(|object_id| self.lookup(entity_type, object_id.as_ref(), cache))
            .collect();

        let mut state = self.state.lock();
        lookups
            .into_iter()
            .map(|lookup| match lookup {
                Lookup::Settled(completion) => completion,
                Lookup::Unregistered(object_id) => {
                    self.register(&mut state, entity_type, object_id, cache)
                }
            })
            .collect()
    }

    /// Validates the id and consults the cache, without touching the windows.
    fn lookup(
        &self,
        entity_type: &EntityType,
        object_id: &str,
        cache: Option<&ReadThroughCache>,
    ) -> Lookup {
        let object_id = match ObjectId::parse(object_id) {
            Ok(object_id) => object_id,
            Err(error) => return Lookup::Settled(Completion::ready(Err(error))),
        };
        metric!(counter("coalescer.lookup") += 1);

        match cache.and_then(|cache| cache.get_object(entity_type, &object_id)) {
            Some(completion) => Lookup::Settled(completion),
            None => Lookup::Unregistered(object_id),
        }
    }

    fn register(
        &self,
        state: &mut CoalescerState,
        entity_type: &EntityType,
        object_id: ObjectId,
        cache: Option<&ReadThroughCache>,
    ) -> Completion<Document> {
        let window = state.windows.entry(entity_type.clone()).or_default();
        if let Some(pending) = window.get(&object_id) {
            metric!(counter("coalescer.deduplicated") += 1);
            return pending.completion.clone();
        }

        let (completer, completion) = Completion::pending();
        if let Some(cache) = cache {
            cache.put_object(entity_type, &object_id, completion.clone());
        }
        window.insert(
            object_id,
            PendingLookup {
                completer,
                completion: completion.clone(),
            },
        );

        if !state.flush_armed {
            state.flush_armed = true;
            self.arm_flush();
        }
        completion
    }

    fn arm_flush(&self) {
        let coalescer = self.clone();
        let flush = async move {
            tokio::task::yield_now().await;
            coalescer.flush().await;
        };
        self.runtime
            .spawn(flush.bind_hub(Hub::new_from_top(Hub::current())));
    }

    async fn flush(&self) {
        let windows = {
            let mut state = self.state.lock();
            state.flush_armed = false;
            mem::take(&mut state.windows)
        };

        let batches = windows
            .into_iter()
            .filter(|(_, window)| !window.is_empty())
            .map(|(entity_type, window)| {
                let ids: Vec<&str> = window.keys().map(ObjectId::as_str).collect();
                tracing::debug!(%entity_type, count = ids.len(), "Flushing batched lookups");
                metric!(histogram("coalescer.batch_size") = ids.len() as u64);

                let selector = json!({"_id": {"$in": ids}});
                let response = self
                    .dispatcher
                    .submit(RemoteRequest::search(&entity_type, selector));
                async move {
                    let documents = response.await.and_then(|response| response.into_documents());
                    fan_out(&entity_type, window, documents);
                }
            });

        futures::future::join_all(batches).await;
    }
}

fn fan_out(
    entity_type: &EntityType,
    window: Window,
    documents: Result<Vec<Document>, ConnectorError>,
) {
    let documents = match documents {
        Ok(documents) => documents,
        Err(error) => {
            for lookup in window.into_values() {
                lookup.completer.reject(error.clone());
            }
            return;
        }
    };

    let mut by_id: HashMap<String, Document> = documents
        .into_iter()
        .filter_map(|document| Some((document_id(&document)?.to_owned(), document)))
        .collect();

    for (object_id, lookup) in window {
        match by_id.remove(object_id.as_str()) {
            Some(document) => lookup.completer.resolve(document),
            None => lookup.completer.reject(ConnectorError::NotFound {
                entity_type: entity_type.to_string(),
                object_id: object_id.to_string(),
            }),
        }
    }
}
