//! A client for the Communibase API.
//!
//! The [`Connector`] queues every API request on a bounded-concurrency [`Dispatcher`], merges
//! point lookups issued in the same scheduling turn into batched searches, and optionally serves
//! results from a [`ReadThroughCache`] that is kept fresh by the server's dirty notifications.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod coalescer;
pub mod completion;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod invalidation;
pub mod reference;
pub mod remote;
pub mod types;


pub use cache::ReadThroughCache;
pub use completion::{Completer, Completion};
pub use config::Config;
pub use connector::{Connector, SearchPage};
pub use dispatcher::Dispatcher;
pub use error::ConnectorError;
pub use http::HttpTransport;
pub use invalidation::{
    ConnectionState, DirtyEvent, DirtyFeed, FeedEvent, InvalidationListener, LocalDirtyFeed,
};
pub use reference::{DocumentReference, PathStep};
pub use remote::{Credentials, RemoteRequest, RemoteResponse, Transport};
pub use types::{Document, EntityType, ObjectId, Params};
