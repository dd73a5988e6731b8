//! Identifiers and request parameters shared by all connector operations.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConnectorError;

/// A document as returned by the remote API.
///
/// Documents are schemaless JSON objects carrying at least an `_id` field.
pub type Document = Value;

/// Returns the `_id` field of a document, if any.
pub fn document_id(document: &Document) -> Option<&str> {
    document.get("_id").and_then(Value::as_str)
}

/// The name of a remote entity type, such as `Person` or `Invoice`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(Arc<str>);

impl EntityType {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EntityType {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl AsRef<str> for EntityType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated object identifier.
///
/// Object ids are the 24 character string form of the remote store's ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ObjectId(Arc<str>);

impl ObjectId {
    /// The exact length of a well-formed object id.
    pub const LENGTH: usize = 24;

    /// Parses an object id, failing with a validation error on malformed input.
    pub fn parse(id: &str) -> Result<Self, ConnectorError> {
        if id.chars().count() != Self::LENGTH {
            return Err(ConnectorError::Validation(format!("Invalid objectId: {id:?}")));
        }
        Ok(Self(Arc::from(id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ObjectId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Extra query parameters, like `fields`, `limit`, `page` or `sort`.
///
/// Parameters are kept ordered so that they serialize, and hash, deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter, returning the updated set.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The requested field projection, if any.
    pub fn fields(&self) -> Option<&str> {
        self.get("fields").filter(|fields| !fields.is_empty())
    }

    /// Whether a field projection is requested.
    ///
    /// Projected results have a caller-specific shape and can never be coalesced or cached.
    pub fn has_projection(&self) -> bool {
        self.fields().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `self` with every parameter of `other` layered on top.
    pub fn merged(mut self, other: Option<&Params>) -> Self {
        if let Some(other) = other {
            for (key, value) in &other.0 {
                self.0.insert(key.clone(), value.clone());
            }
        }
        self
    }

    /// Serializes the parameters into a URL-encoded query string.
    pub fn to_query_string(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.0 {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (key, value) in iter {
            params.insert(key, value);
        }
        params
    }
}

/// Returns `true` for a selector that narrows a search, i.e. a non-empty JSON object.
pub fn is_narrowing_selector(selector: Option<&Value>) -> bool {
    selector
        .and_then(Value::as_object)
        .is_some_and(|selector| !selector.is_empty())
}
