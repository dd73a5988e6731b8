use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HOST};
use serde_json::Value;
use url::Url;

use crate::config::Config;
use crate::error::ConnectorError;
use crate::remote::{Credentials, RemoteRequest, RemoteResponse, Transport};

/// Creates a [`reqwest::Client`] using the configured timeouts.
pub fn create_client(config: &Config) -> Result<reqwest::Client, ConnectorError> {
    let client = reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()?;
    Ok(client)
}

/// A [`Transport`] talking JSON to the Communibase REST API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    service_url: Url,
    host: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, ConnectorError> {
        Ok(Self {
            client: create_client(config)?,
            service_url: config.service_url.clone(),
            host: config.host.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, ConnectorError> {
        self.service_url
            .join(path)
            .map_err(|err| ConnectorError::Transport(format!("invalid request url: {err}")))
    }

    fn build(&self, request: &RemoteRequest) -> Result<reqwest::RequestBuilder, ConnectorError> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path)?)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json");

        if let Some(host) = &self.host {
            builder = builder.header(HOST, host);
        }
        if let Some(query) = &request.query {
            builder = builder.query(query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder)
    }

    #[tracing::instrument(skip_all, fields(method = %request.method, path = %request.path))]
    async fn execute_request(
        &self,
        request: &RemoteRequest,
        credentials: &Credentials,
    ) -> Result<RemoteResponse, ConnectorError> {
        let mut builder = self.build(request)?;
        if let Some(api_key) = &credentials.api_key {
            builder = builder.header("x-api-key", api_key);
        }
        if let Some(access_token) = &credentials.access_token {
            builder = builder.header("x-access-token", access_token);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if status == StatusCode::OK {
            tracing::trace!("Success calling the Communibase API");
            RemoteResponse::from_body(&body)
        } else {
            tracing::warn!("Communibase API returned status code {}", status);
            Err(ConnectorError::from_error_body(&body))
        }
    }
}

impl Transport for HttpTransport {
    fn execute<'a>(
        &'a self,
        request: &'a RemoteRequest,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<RemoteResponse, ConnectorError>> {
        Box::pin(self.execute_request(request, credentials))
    }

    fn stream(&self, request: RemoteRequest) -> BoxStream<'static, Result<Bytes, ConnectorError>> {
        let builder = self.build(&request);

        let response = async move {
            let response = builder?.send().await?;
            let status = response.status();
            if status != StatusCode::OK {
                tracing::warn!("Communibase API returned status code {}", status);
                return Err(ConnectorError::Remote {
                    code: status.as_u16(),
                    message: status.canonical_reason().unwrap_or_default().to_owned(),
                    errors: Value::Object(Default::default()),
                });
            }
            Ok(response.bytes_stream().map_err(ConnectorError::from))
        };

        stream::once(response).try_flatten().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_service_url;

    #[test]
    fn test_request_url() {
        let config = Config {
            service_url: parse_service_url("http://localhost:1234/0.1").unwrap(),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();

        let url = transport.url("Person.json/crud").unwrap();
        assert_eq!(url.as_str(), "http://localhost:1234/0.1/Person.json/crud");
    }
}
