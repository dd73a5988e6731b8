use std::error::Error;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// An error returned by any of the connector operations.
///
/// Errors are handed to every caller awaiting a shared [`Completion`](crate::Completion),
/// which is why this type is [`Clone`] and carries only owned, printable details.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectorError {
    /// The request was rejected before any cache or network interaction, for instance
    /// because of a malformed object id or a missing selector.
    #[error("invalid request: {0}")]
    Validation(String),
    /// No credentials are available to authenticate against the remote API.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The remote API answered with a non-success status.
    ///
    /// `code`, `message` and `errors` are taken from the JSON error body and default to
    /// `500`, an empty message and an empty object respectively.
    #[error("remote error {code}: {message}")]
    Remote {
        code: u16,
        message: String,
        errors: Value,
    },
    /// A batched lookup did not contain the requested object.
    #[error("{object_id} is not found")]
    NotFound {
        entity_type: String,
        object_id: String,
    },
    /// A document reference path did not lead to a sub-document.
    #[error("the referred object within its parent could not be found")]
    ReferenceResolution,
    /// The request failed before a usable response was obtained, like connection loss,
    /// DNS resolution, or an unparseable response body.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectorError {
    /// Creates a [`Remote`](Self::Remote) error from a (possibly empty) JSON error body.
    pub fn from_error_body(body: &[u8]) -> Self {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct ErrorBody {
            code: Option<Value>,
            message: Option<String>,
            errors: Option<Value>,
        }

        let body: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
        let code = body
            .code
            .as_ref()
            .and_then(|code| match code {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(500);

        Self::Remote {
            code,
            message: body.message.unwrap_or_default(),
            errors: body
                .errors
                .unwrap_or_else(|| Value::Object(Default::default())),
        }
    }

    fn transport_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        Self::Transport(error_string)
    }

    /// Returns `true` if this error was produced without talking to the remote API.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Configuration(_))
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(error: reqwest::Error) -> Self {
        Self::transport_error(&error)
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(error: serde_json::Error) -> Self {
        Self::Transport(format!("invalid response body: {error}"))
    }
}
