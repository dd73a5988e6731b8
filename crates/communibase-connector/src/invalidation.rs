//! Cache invalidation driven by the server's dirty notifications.
//!
//! The server publishes an `entityType|objectId` message on the `<administrationId>_dirty`
//! channel whenever an object changes. The [`InvalidationListener`] consumes those messages from
//! a [`DirtyFeed`] and evicts everything that might depend on the changed object.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::cache::ReadThroughCache;
use crate::types::EntityType;

/// A notification that cached data may be stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtyEvent {
    /// A single object changed.
    Object {
        entity_type: EntityType,
        object_id: String,
    },
    /// Anything of the entity type may have changed.
    EntityType(EntityType),
}

impl DirtyEvent {
    /// Parses an `entityType|objectId` message.
    pub fn parse(message: &str) -> Option<Self> {
        let mut fields = message.split('|');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(entity_type), Some(object_id), None) => Some(Self::Object {
                entity_type: EntityType::new(entity_type),
                object_id: object_id.to_owned(),
            }),
            _ => None,
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        match self {
            Self::Object { entity_type, .. } => entity_type,
            Self::EntityType(entity_type) => entity_type,
        }
    }

    /// Evicts the affected entries. Applying an event more than once has no further effect.
    pub fn apply(&self, cache: &ReadThroughCache) {
        match self {
            Self::Object {
                entity_type,
                object_id,
            } => {
                cache.invalidate_queries(entity_type);
                cache.invalidate_object(entity_type, object_id);
            }
            Self::EntityType(entity_type) => cache.invalidate_type(entity_type),
        }
    }
}

/// Something happening on a subscribed pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Connected,
    Message(String),
    Disconnected,
}

/// A pub/sub transport delivering dirty notifications.
pub trait DirtyFeed: Send + Sync + fmt::Debug {
    /// Joins `channel`, yielding its events until the subscription ends.
    fn subscribe(&self, channel: &str) -> BoxStream<'static, FeedEvent>;
}

/// The state of the connection to the dirty channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Returns the name of the dirty channel of an administration.
pub fn dirty_channel(administration_id: &str) -> String {
    format!("{administration_id}_dirty")
}

/// A background task applying dirty notifications to a cache.
///
/// Lost connections are not re-established; the state is observable through
/// [`InvalidationListener::subscribe_state`]. The task stops when the listener is dropped.
#[derive(Debug)]
pub struct InvalidationListener {
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl InvalidationListener {
    pub fn spawn(
        administration_id: &str,
        feed: &dyn DirtyFeed,
        cache: Arc<ReadThroughCache>,
        runtime: &runtime::Handle,
    ) -> Self {
        let channel = dirty_channel(administration_id);
        tracing::debug!(%channel, "Subscribing to dirty notifications");

        let events = feed.subscribe(&channel);
        let (sender, state) = watch::channel(ConnectionState::Connecting);
        let task = runtime.spawn(
            listen(channel, events, cache, sender).bind_hub(Hub::new_from_top(Hub::current())),
        );

        Self { state, task }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

impl Drop for InvalidationListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn listen(
    channel: String,
    mut events: BoxStream<'static, FeedEvent>,
    cache: Arc<ReadThroughCache>,
    state: watch::Sender<ConnectionState>,
) {
    while let Some(event) = events.next().await {
        match event {
            FeedEvent::Connected => {
                tracing::info!(%channel, "Listening for dirty notifications");
                state.send_replace(ConnectionState::Connected);
            }
            FeedEvent::Disconnected => {
                tracing::warn!(%channel, "Lost connection to the dirty channel");
                state.send_replace(ConnectionState::Disconnected);
            }
            FeedEvent::Message(message) => handle_message(&cache, &message),
        }
    }

    tracing::warn!(%channel, "Dirty notification feed ended");
    state.send_replace(ConnectionState::Disconnected);
}

fn handle_message(cache: &ReadThroughCache, message: &str) {
    metric!(counter("invalidation.message") += 1);
    match DirtyEvent::parse(message) {
        Some(event) => {
            tracing::trace!(?event, "Invalidating cache");
            event.apply(cache);
        }
        None => {
            metric!(counter("invalidation.ignored") += 1);
            tracing::warn!(dirty_message = message, "Ignoring malformed dirty notification");
        }
    }
}

const LOCAL_CHANNEL_CAPACITY: usize = 1024;

/// An in-process [`DirtyFeed`] backed by broadcast channels.
#[derive(Debug, Default)]
pub struct LocalDirtyFeed {
    channels: Mutex<HashMap<String, broadcast::Sender<FeedEvent>>>,
}

impl LocalDirtyFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<FeedEvent> {
        self.channels
            .lock()
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(LOCAL_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publishes `message` on `channel`, returning the number of subscribers reached.
    pub fn publish(&self, channel: &str, message: impl Into<String>) -> usize {
        self.sender(channel)
            .send(FeedEvent::Message(message.into()))
            .unwrap_or(0)
    }

    /// Tells every subscriber of `channel` that the connection was lost.
    pub fn disconnect(&self, channel: &str) {
        self.sender(channel).send(FeedEvent::Disconnected).ok();
    }
}

impl DirtyFeed for LocalDirtyFeed {
    fn subscribe(&self, channel: &str) -> BoxStream<'static, FeedEvent> {
        let receiver = self.sender(channel).subscribe();

        let events = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Dirty notifications were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::once(async { FeedEvent::Connected })
            .chain(events)
            .boxed()
    }
}
