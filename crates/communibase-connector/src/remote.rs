//! The contract with the remote Communibase API.
//!
//! A [`RemoteRequest`] describes exactly one HTTP round trip. Requests are executed by a
//! [`Transport`], which is the reqwest based [`HttpTransport`](crate::HttpTransport) outside of
//! tests.

use std::fmt;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use reqwest::Method;
use serde_json::Value;

use crate::error::ConnectorError;
use crate::types::{Document, EntityType, ObjectId, Params};

/// One remote operation: method, path relative to the service URL, query and JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<Params>,
    pub body: Option<Value>,
}

impl RemoteRequest {
    fn new(method: Method, path: String) -> Self {
        Self {
            method,
            path,
            query: None,
            body: None,
        }
    }

    /// Attaches query parameters; empty parameters are dropped.
    pub fn with_query(mut self, params: Option<&Params>) -> Self {
        self.query = params.filter(|params| !params.is_empty()).cloned();
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// `GET {T}.json/crud/{id}`
    pub fn fetch(entity_type: &EntityType, object_id: &ObjectId) -> Self {
        Self::new(Method::GET, format!("{entity_type}.json/crud/{object_id}"))
    }

    /// `GET {T}.json/history/{id}/{version}`
    pub fn fetch_version(entity_type: &EntityType, object_id: &ObjectId, version: &str) -> Self {
        Self::new(
            Method::GET,
            format!("{entity_type}.json/history/{object_id}/{version}"),
        )
    }

    /// `GET {T}.json/crud`
    pub fn list(entity_type: &EntityType) -> Self {
        Self::new(Method::GET, format!("{entity_type}.json/crud"))
    }

    /// `POST {T}.json/search`
    pub fn search(entity_type: &EntityType, selector: Value) -> Self {
        Self::new(Method::POST, format!("{entity_type}.json/search")).with_body(selector)
    }

    /// `POST {T}.json/crud`
    pub fn create(entity_type: &EntityType, document: Document) -> Self {
        Self::new(Method::POST, format!("{entity_type}.json/crud")).with_body(document)
    }

    /// `PUT {T}.json/crud/{id}`
    pub fn update(entity_type: &EntityType, object_id: &str, document: Document) -> Self {
        Self::new(Method::PUT, format!("{entity_type}.json/crud/{object_id}")).with_body(document)
    }

    /// `DELETE {T}.json/crud/{id}`
    pub fn delete(entity_type: &EntityType, object_id: &str) -> Self {
        Self::new(Method::DELETE, format!("{entity_type}.json/crud/{object_id}"))
    }

    /// `POST {T}.json/history/undelete/{id}`
    pub fn undelete(entity_type: &EntityType, object_id: &str) -> Self {
        Self::new(
            Method::POST,
            format!("{entity_type}.json/history/undelete/{object_id}"),
        )
    }

    /// `GET {T}.json/history/{id}`
    pub fn history(entity_type: &EntityType, object_id: &str) -> Self {
        Self::new(Method::GET, format!("{entity_type}.json/history/{object_id}"))
    }

    /// `POST {T}.json/history/search`
    pub fn history_search(entity_type: &EntityType, selector: Value) -> Self {
        Self::new(Method::POST, format!("{entity_type}.json/history/search")).with_body(selector)
    }

    /// `POST {T}.json/aggregate`
    pub fn aggregate(entity_type: &EntityType, pipeline: Value) -> Self {
        Self::new(Method::POST, format!("{entity_type}.json/aggregate")).with_body(pipeline)
    }

    /// `POST Invoice.json/finalize/{id}`
    pub fn finalize_invoice(invoice_id: &str) -> Self {
        Self::new(Method::POST, format!("Invoice.json/finalize/{invoice_id}"))
    }

    /// `GET File.json/binary/{id}`, authenticated through the `api_key` query parameter.
    pub fn binary(file_id: &str, api_key: &str) -> Self {
        Self::new(Method::GET, format!("File.json/binary/{file_id}"))
            .with_query(Some(&Params::new().with("api_key", api_key)))
    }
}

/// A successful response, normalized from either shape the API answers with.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    /// The logical result.
    pub records: Value,
    /// Out-of-band context, like paging totals, if the API wrapped the result in an envelope.
    pub metadata: Option<Value>,
}

impl RemoteResponse {
    pub fn new(records: Value) -> Self {
        Self {
            records,
            metadata: None,
        }
    }

    /// Decodes a success body, unwrapping a `{metadata, records}` envelope.
    ///
    /// A body is only treated as an envelope if both fields are set to a truthy value, anything
    /// else is returned as is.
    pub fn from_body(body: &[u8]) -> Result<Self, ConnectorError> {
        let body: Value = serde_json::from_slice(body)?;
        let is_envelope = is_truthy(body.get("metadata")) && is_truthy(body.get("records"));
        Ok(match body {
            Value::Object(mut fields) if is_envelope => Self {
                records: fields.remove("records").unwrap_or_default(),
                metadata: fields.remove("metadata"),
            },
            records => Self::new(records),
        })
    }

    /// Interprets the records as a list of documents.
    pub fn into_documents(self) -> Result<Vec<Document>, ConnectorError> {
        match self.records {
            Value::Array(documents) => Ok(documents),
            other => Err(ConnectorError::Transport(format!(
                "expected a list of documents, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|number| number != 0.0),
        Some(Value::String(string)) => !string.is_empty(),
        Some(Value::Bool(true) | Value::Array(_) | Value::Object(_)) => true,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// The authentication material attached to every request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub access_token: Option<String>,
}

impl Credentials {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            access_token: None,
        }
    }

    /// Returns `true` if neither an API key nor an access token is available.
    pub fn is_missing(&self) -> bool {
        let blank = |value: &Option<String>| value.as_deref().is_none_or(str::is_empty);
        blank(&self.api_key) && blank(&self.access_token)
    }

    /// Fails with a configuration error if no credentials are available.
    pub fn ensure_present(&self) -> Result<(), ConnectorError> {
        if self.is_missing() {
            return Err(ConnectorError::Configuration(
                "missing key or token for the Communibase connector: set `api_key` or \
                 `COMMUNIBASE_KEY`, or create a connector using `Connector::with_credentials`"
                    .into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Executes [`RemoteRequest`]s against the remote API.
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// Performs one request and decodes its JSON response.
    ///
    /// Non-success statuses must be turned into [`ConnectorError::Remote`].
    fn execute<'a>(
        &'a self,
        request: &'a RemoteRequest,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<RemoteResponse, ConnectorError>>;

    /// Performs one request and streams the raw response body.
    ///
    /// A non-success status is reported as a single error item instead of body chunks.
    fn stream(&self, request: RemoteRequest) -> BoxStream<'static, Result<Bytes, ConnectorError>>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_plain_body() {
        let response = RemoteResponse::from_body(br#"[{"_id": "a"}]"#).unwrap();
        assert_eq!(response.records, json!([{"_id": "a"}]));
        assert_eq!(response.metadata, None);
    }

    #[test]
    fn test_envelope_body() {
        let body = br#"{"metadata": {"total": 12}, "records": [{"_id": "a"}]}"#;
        let response = RemoteResponse::from_body(body).unwrap();
        assert_eq!(response.records, json!([{"_id": "a"}]));
        assert_eq!(response.metadata, Some(json!({"total": 12})));
    }

    #[test]
    fn test_object_without_envelope() {
        // a document which happens to have a `records` field, but no `metadata`
        let body = br#"{"_id": "a", "records": []}"#;
        let response = RemoteResponse::from_body(body).unwrap();
        assert_eq!(response.records, json!({"_id": "a", "records": []}));
        assert_eq!(response.metadata, None);
    }

    #[test]
    fn test_envelope_without_metadata() {
        let body = br#"{"metadata": null, "records": [{"_id": "a"}]}"#;
        let response = RemoteResponse::from_body(body).unwrap();
        assert_eq!(
            response.records,
            json!({"metadata": null, "records": [{"_id": "a"}]})
        );
        assert_eq!(response.metadata, None);

        let body = br#"{"metadata": {"total": 0}, "records": ""}"#;
        let response = RemoteResponse::from_body(body).unwrap();
        assert_eq!(response.records, json!({"metadata": {"total": 0}, "records": ""}));
        assert_eq!(response.metadata, None);
    }

    #[test]
    fn test_invalid_body() {
        let err = RemoteResponse::from_body(b"<html>").unwrap_err();
        assert!(matches!(err, ConnectorError::Transport(_)));
    }

    #[test]
    fn test_into_documents() {
        let documents = RemoteResponse::new(json!([{"_id": "a"}]))
            .into_documents()
            .unwrap();
        assert_eq!(documents.len(), 1);

        assert!(RemoteResponse::new(json!({})).into_documents().is_err());
    }

    #[test]
    fn test_request_paths() {
        let person = EntityType::new("Person");
        let id = ObjectId::parse("52259f95dafd757b06002221").unwrap();

        let request = RemoteRequest::fetch(&person, &id);
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.path, "Person.json/crud/52259f95dafd757b06002221");

        let request = RemoteRequest::fetch_version(&person, &id, "v1");
        assert_eq!(
            request.path,
            "Person.json/history/52259f95dafd757b06002221/v1"
        );

        let request = RemoteRequest::search(&person, json!({"firstName": "Henk"}))
            .with_query(Some(&Params::new()));
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.path, "Person.json/search");
        assert_eq!(request.query, None);
        assert_eq!(request.body, Some(json!({"firstName": "Henk"})));

        let request = RemoteRequest::finalize_invoice("52259f95dafd757b06002222");
        assert_eq!(request.path, "Invoice.json/finalize/52259f95dafd757b06002222");

        let request = RemoteRequest::binary("52259f95dafd757b06002223", "key");
        assert_eq!(request.path, "File.json/binary/52259f95dafd757b06002223");
        assert_eq!(request.query.unwrap().get("api_key"), Some("key"));
    }

    #[test]
    fn test_missing_credentials() {
        assert!(Credentials::default().is_missing());
        assert!(
            Credentials {
                api_key: Some(String::new()),
                access_token: None,
            }
            .is_missing()
        );
        assert!(!Credentials::api_key("key").is_missing());
        assert!(matches!(
            Credentials::default().ensure_present(),
            Err(ConnectorError::Configuration(_))
        ));
    }
}
