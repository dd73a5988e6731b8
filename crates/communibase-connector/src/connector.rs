use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde_json::{Value, json};
use tokio::runtime;
use tokio::sync::watch;

use crate::cache::{QueryHash, ReadThroughCache};
use crate::coalescer::Coalescer;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::ConnectorError;
use crate::http::HttpTransport;
use crate::invalidation::{ConnectionState, DirtyEvent, DirtyFeed, InvalidationListener};
use crate::reference::DocumentReference;
use crate::remote::{Credentials, RemoteRequest, RemoteResponse, Transport};
use crate::types::{Document, EntityType, ObjectId, Params, document_id, is_narrowing_selector};

/// One page of search results, together with the paging metadata the API returned.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub records: Vec<Document>,
    pub metadata: Option<Value>,
}

struct CacheState {
    cache: Arc<ReadThroughCache>,
    listener: InvalidationListener,
}

struct ConnectorInner {
    config: Config,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    coalescer: Coalescer,
    cache: OnceLock<CacheState>,
    runtime: runtime::Handle,
}

/// A client of the Communibase API.
///
/// All operations are queued on a shared dispatcher, which bounds the number of concurrent API
/// requests. Point lookups issued in the same scheduling turn are merged into one search, and
/// once [`enable_cache`](Self::enable_cache) was called, results are cached until the server
/// signals that they are stale.
///
/// Cloning a connector is cheap, all clones share their queue and cache.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("service_url", &self.inner.config.service_url.as_str())
            .field("cache_enabled", &self.inner.cache.get().is_some())
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Creates a connector talking HTTP to the configured service URL.
    ///
    /// Background work is spawned onto `runtime`.
    pub fn new(config: Config, runtime: runtime::Handle) -> Result<Self, ConnectorError> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::with_transport(config, transport, runtime))
    }

    /// Creates a connector executing its requests on `transport`.
    pub fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        runtime: runtime::Handle,
    ) -> Self {
        let credentials = Credentials {
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&transport),
            credentials,
            config.concurrency,
            &runtime,
        ));
        let coalescer = Coalescer::new(Arc::clone(&dispatcher), runtime.clone());

        Self {
            inner: Arc::new(ConnectorInner {
                config,
                transport,
                dispatcher,
                coalescer,
                cache: OnceLock::new(),
                runtime,
            }),
        }
    }

    /// Creates an independent connector authenticating with another API key.
    ///
    /// The new connector has its own queue, and starts without a cache.
    pub fn with_credentials(&self, api_key: impl Into<String>) -> Self {
        let config = Config {
            api_key: Some(api_key.into()),
            access_token: None,
            ..self.inner.config.clone()
        };
        Self::with_transport(
            config,
            Arc::clone(&self.inner.transport),
            self.inner.runtime.clone(),
        )
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Sets the access token sent along with every request started from now on.
    pub fn set_access_token(&self, access_token: Option<String>) {
        self.inner.dispatcher.set_access_token(access_token);
    }

    /// Enables the read-through caches, invalidated through the administration's dirty channel.
    ///
    /// Caching can only be enabled once per connector.
    pub fn enable_cache(
        &self,
        administration_id: &str,
        feed: &dyn DirtyFeed,
    ) -> Result<(), ConnectorError> {
        if self.inner.cache.get().is_some() {
            return Err(Self::cache_already_enabled());
        }

        let cache = Arc::new(ReadThroughCache::new(&self.inner.config.cache));
        let listener = InvalidationListener::spawn(
            administration_id,
            feed,
            Arc::clone(&cache),
            &self.inner.runtime,
        );
        self.inner
            .cache
            .set(CacheState { cache, listener })
            .map_err(|_| Self::cache_already_enabled())?;

        tracing::debug!(administration_id, "Enabled read-through cache");
        Ok(())
    }

    fn cache_already_enabled() -> ConnectorError {
        ConnectorError::Configuration("caching is already enabled for this connector".into())
    }

    fn cache(&self) -> Option<&ReadThroughCache> {
        self.inner.cache.get().map(|state| &*state.cache)
    }

    /// The state of the dirty channel connection, if caching is enabled.
    pub fn connection_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.inner
            .cache
            .get()
            .map(|state| state.listener.subscribe_state())
    }

    /// Evicts cached data as if `event` had been received on the dirty channel.
    pub fn invalidate(&self, event: &DirtyEvent) {
        if let Some(cache) = self.cache() {
            event.apply(cache);
        }
    }

    async fn call(&self, request: RemoteRequest) -> Result<RemoteResponse, ConnectorError> {
        self.inner.dispatcher.submit(request).await
    }

    async fn call_documents(&self, request: RemoteRequest) -> Result<Vec<Document>, ConnectorError> {
        self.call(request).await?.into_documents()
    }

    /// Fetches a single object.
    ///
    /// Without a field projection or version, lookups are coalesced and cached. A malformed id
    /// fails without any remote call.
    pub async fn get_by_id(
        &self,
        entity_type: impl Into<EntityType>,
        object_id: &str,
        params: Option<&Params>,
        version_id: Option<&str>,
    ) -> Result<Document, ConnectorError> {
        let entity_type = entity_type.into();
        let object_id = ObjectId::parse(object_id)?;

        if let Some(version_id) = version_id.filter(|version| !version.is_empty()) {
            let request = RemoteRequest::fetch_version(&entity_type, &object_id, version_id)
                .with_query(params);
            return Ok(self.call(request).await?.records);
        }
        if params.is_some_and(Params::has_projection) {
            let request = RemoteRequest::fetch(&entity_type, &object_id).with_query(params);
            return Ok(self.call(request).await?.records);
        }

        self.inner
            .coalescer
            .request_by_id(&entity_type, object_id.as_str(), self.cache())
            .await
    }

    /// Fetches a list of objects.
    ///
    /// Objects that cannot be fetched are left out of the result. Only if all lookups fail,
    /// the last error is returned.
    pub async fn get_by_ids<I>(
        &self,
        entity_type: impl Into<EntityType>,
        object_ids: &[I],
        params: Option<&Params>,
    ) -> Result<Vec<Document>, ConnectorError>
    where
        I: AsRef<str> + Sync,
    {
        let entity_type = entity_type.into();
        if object_ids.is_empty() {
            return Ok(Vec::new());
        }

        if params.is_some_and(Params::has_projection) {
            let ids: Vec<&str> = object_ids.iter().map(AsRef::as_ref).collect();
            let selector = json!({"_id": {"$in": ids}});
            let request = RemoteRequest::search(&entity_type, selector).with_query(params);
            return self.call_documents(request).await;
        }

        let lookups = self
            .inner
            .coalescer
            .request_by_ids(&entity_type, object_ids, self.cache());
        let results = futures::future::join_all(lookups).await;

        let mut documents = Vec::with_capacity(results.len());
        let mut last_error = None;
        for result in results {
            match result {
                Ok(document) => documents.push(document),
                Err(error) => last_error = Some(error),
            }
        }

        match last_error {
            Some(error) if documents.is_empty() => Err(error),
            _ => Ok(documents),
        }
    }

    /// Fetches every object of a type.
    pub async fn get_all(
        &self,
        entity_type: impl Into<EntityType>,
        params: Option<&Params>,
    ) -> Result<Vec<Document>, ConnectorError> {
        let entity_type = entity_type.into();
        if self.cache().is_some() && !params.is_some_and(Params::has_projection) {
            return self.search_cached(&entity_type, &json!({}), params).await;
        }
        self.call_documents(RemoteRequest::list(&entity_type).with_query(params))
            .await
    }

    /// Returns the ids of all objects matching `selector`.
    ///
    /// Only `_id` is requested, unless `params` asks for other fields.
    pub async fn get_ids(
        &self,
        entity_type: impl Into<EntityType>,
        selector: &Value,
        params: Option<&Params>,
    ) -> Result<Vec<String>, ConnectorError> {
        self.get_ids_of(&entity_type.into(), selector, params).await
    }

    async fn get_ids_of(
        &self,
        entity_type: &EntityType,
        selector: &Value,
        params: Option<&Params>,
    ) -> Result<Vec<String>, ConnectorError> {
        let hash = QueryHash::new(entity_type, selector, params);
        let ticket = match self.cache() {
            Some(cache) => {
                if let Some(ids) = cache.get_ids_for_query(entity_type, &hash) {
                    return Ok(ids);
                }
                Some(cache.ids_ticket(entity_type, hash))
            }
            None => None,
        };

        let query = Params::new().with("fields", "_id").merged(params);
        let ids: Vec<String> = self
            .search_direct(entity_type, selector, Some(&query))
            .await?
            .iter()
            .filter_map(|document| document_id(document).map(str::to_owned))
            .collect();

        if let (Some(cache), Some(ticket)) = (self.cache(), ticket) {
            cache.put_ids_for_query(&ticket, ids.clone());
        }
        Ok(ids)
    }

    /// Returns the id of an object matching `selector`, if there is one.
    pub async fn get_id(
        &self,
        entity_type: impl Into<EntityType>,
        selector: &Value,
    ) -> Result<Option<String>, ConnectorError> {
        let params = Params::new().with("limit", 1);
        let mut ids = self
            .get_ids_of(&entity_type.into(), selector, Some(&params))
            .await?;
        Ok(ids.pop())
    }

    /// Searches objects using a MongoDB style `selector`.
    ///
    /// With caching enabled and no field projection, the matching ids are looked up first and
    /// the objects are then fetched through the object cache.
    pub async fn search(
        &self,
        entity_type: impl Into<EntityType>,
        selector: &Value,
        params: Option<&Params>,
    ) -> Result<Vec<Document>, ConnectorError> {
        let entity_type = entity_type.into();
        if self.cache().is_some() && !params.is_some_and(Params::has_projection) {
            return self.search_cached(&entity_type, selector, params).await;
        }
        self.search_direct(&entity_type, selector, params).await
    }

    async fn search_cached(
        &self,
        entity_type: &EntityType,
        selector: &Value,
        params: Option<&Params>,
    ) -> Result<Vec<Document>, ConnectorError> {
        let ids = self.get_ids_of(entity_type, selector, params).await?;
        self.get_by_ids(entity_type.clone(), &ids, None).await
    }

    async fn search_direct(
        &self,
        entity_type: &EntityType,
        selector: &Value,
        params: Option<&Params>,
    ) -> Result<Vec<Document>, ConnectorError> {
        let request = if is_narrowing_selector(Some(selector)) {
            RemoteRequest::search(entity_type, selector.clone())
        } else {
            RemoteRequest::list(entity_type)
        };
        self.call_documents(request.with_query(params)).await
    }

    /// Searches objects without any caching, returning the paging metadata as well.
    pub async fn search_page(
        &self,
        entity_type: impl Into<EntityType>,
        selector: &Value,
        params: Option<&Params>,
    ) -> Result<SearchPage, ConnectorError> {
        let entity_type = entity_type.into();
        let request = RemoteRequest::search(&entity_type, selector.clone()).with_query(params);
        let response = self.call(request).await?;
        let metadata = response.metadata.clone();
        Ok(SearchPage {
            records: response.into_documents()?,
            metadata,
        })
    }

    /// Saves a document: updated in place if it has an `_id`, created otherwise.
    #[tracing::instrument(skip_all)]
    pub async fn update(
        &self,
        entity_type: impl Into<EntityType>,
        document: Document,
    ) -> Result<Document, ConnectorError> {
        let entity_type = entity_type.into();
        if !document.is_object() {
            return Err(ConnectorError::Validation(
                "only JSON objects can be saved".into(),
            ));
        }

        let object_id = document_id(&document)
            .filter(|id| !id.is_empty())
            .map(str::to_owned);
        let Some(object_id) = object_id else {
            let response = self
                .call(RemoteRequest::create(&entity_type, document))
                .await?;
            return Ok(response.records);
        };

        self.invalidate_object(&entity_type, &object_id);
        let result = self
            .call(RemoteRequest::update(&entity_type, &object_id, document))
            .await;
        // lookups started while the write was in flight may have cached the old version
        self.invalidate_object(&entity_type, &object_id);
        Ok(result?.records)
    }

    /// Deletes an object.
    #[tracing::instrument(skip_all)]
    pub async fn destroy(
        &self,
        entity_type: impl Into<EntityType>,
        object_id: &str,
    ) -> Result<Value, ConnectorError> {
        let entity_type = entity_type.into();
        self.invalidate_object(&entity_type, object_id);
        let result = self
            .call(RemoteRequest::delete(&entity_type, object_id))
            .await;
        self.invalidate_object(&entity_type, object_id);
        Ok(result?.records)
    }

    fn invalidate_object(&self, entity_type: &EntityType, object_id: &str) {
        if let Some(cache) = self.cache() {
            cache.invalidate_object(entity_type, object_id);
        }
    }

    /// Restores a deleted object.
    pub async fn undelete(
        &self,
        entity_type: impl Into<EntityType>,
        object_id: &str,
    ) -> Result<Document, ConnectorError> {
        let entity_type = entity_type.into();
        let response = self
            .call(RemoteRequest::undelete(&entity_type, object_id))
            .await?;
        Ok(response.records)
    }

    /// Lists the version information of an object.
    pub async fn get_history(
        &self,
        entity_type: impl Into<EntityType>,
        object_id: &str,
    ) -> Result<Vec<Value>, ConnectorError> {
        let entity_type = entity_type.into();
        self.call_documents(RemoteRequest::history(&entity_type, object_id))
            .await
    }

    /// Searches the version information of a type.
    pub async fn history_search(
        &self,
        entity_type: impl Into<EntityType>,
        selector: &Value,
    ) -> Result<Vec<Value>, ConnectorError> {
        let entity_type = entity_type.into();
        self.call_documents(RemoteRequest::history_search(&entity_type, selector.clone()))
            .await
    }

    /// Resolves a [`DocumentReference`].
    ///
    /// References rooted in `parent.*` are resolved against `parent` instead of a stored object.
    pub async fn get_by_ref(
        &self,
        reference: &DocumentReference,
        parent: Option<&Document>,
    ) -> Result<Document, ConnectorError> {
        reference.validate(parent.is_some())?;

        let root = if reference.refers_to_parent() {
            parent.cloned().ok_or_else(|| {
                ConnectorError::Validation("a parent document is required".into())
            })?
        } else {
            let root_id = reference.root_document_id.as_deref().unwrap_or_default();
            self.get_by_id(
                reference.root_document_entity_type.as_str(),
                root_id,
                None,
                None,
            )
            .await?
        };

        reference.resolve(root)
    }

    /// Runs an aggregation pipeline.
    ///
    /// Results are cached per pipeline until the entity type is invalidated.
    pub async fn aggregate(
        &self,
        entity_type: impl Into<EntityType>,
        pipeline: &Value,
    ) -> Result<Value, ConnectorError> {
        let entity_type = entity_type.into();
        if !pipeline.as_array().is_some_and(|stages| !stages.is_empty()) {
            return Err(ConnectorError::Validation(
                "please provide a valid aggregation pipeline".into(),
            ));
        }

        let hash = QueryHash::new(&entity_type, pipeline, None);
        let ticket = match self.cache() {
            Some(cache) => {
                if let Some(result) = cache.get_aggregate(&entity_type, &hash) {
                    return Ok(result);
                }
                Some(cache.aggregate_ticket(&entity_type, hash))
            }
            None => None,
        };

        let result = self
            .call(RemoteRequest::aggregate(&entity_type, pipeline.clone()))
            .await?
            .records;

        if let (Some(cache), Some(ticket)) = (self.cache(), ticket) {
            cache.put_aggregate(&ticket, result.clone());
        }
        Ok(result)
    }

    /// Finalizes an invoice.
    pub async fn finalize_invoice(&self, invoice_id: &str) -> Result<Document, ConnectorError> {
        let response = self
            .call(RemoteRequest::finalize_invoice(invoice_id))
            .await?;
        Ok(response.records)
    }

    /// Streams the contents of a stored file.
    ///
    /// Failures, including a non-success status, are reported as an error item of the stream.
    pub fn read_file(&self, file_id: &str) -> BoxStream<'static, Result<Bytes, ConnectorError>> {
        let credentials = self.inner.dispatcher.credentials();
        let api_key = credentials
            .api_key
            .filter(|api_key| !api_key.is_empty());
        match api_key {
            Some(api_key) => self
                .inner
                .transport
                .stream(RemoteRequest::binary(file_id, &api_key)),
            None => {
                let error = ConnectorError::Configuration(
                    "reading files requires an API key for the Communibase connector".into(),
                );
                stream::once(async move { Err(error) }).boxed()
            }
        }
    }
}
