//! Transport collaborator and the operations built on top of it.
//!
//! The engine never talks HTTP directly. Configured operations resolve to a
//! verb and a path template; a [`Transport`] turns that into a request. Caching
//! and request de-duplication belong to the transport implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use quoteflow_types::{HttpVerb, OperationDefinition, ProductConfiguration};
use reqwest::{Client, Method, header};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::{Operation, OperationError, OperationFactory, OperationRequest};

/// Bytes kept as-is in path placeholder values; everything else is percent-encoded.
const PATH_PLACEHOLDER_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a transport call failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode response: {0}")]
    Decode(String),
}

/// Sends operation requests to the backend.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, verb: HttpVerb, path: &str, body: Option<Value>) -> Result<Value, TransportError>;
}

/// [`Transport`] backed by a `reqwest` client and a base URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: Url,
    http: Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let base_url = Url::parse(base_url).map_err(|error| TransportError::InvalidUrl {
            url: base_url.to_string(),
            reason: error.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl {
                url: base_url.to_string(),
                reason: "url cannot be used as a base".to_string(),
            });
        }

        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        let http = Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| TransportError::Request(error.to_string()))?;

        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn resolve(&self, path: &str) -> Result<Url, TransportError> {
        let joined = format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path.trim_start_matches('/'));
        Url::parse(&joined).map_err(|error| TransportError::InvalidUrl {
            url: joined.clone(),
            reason: error.to_string(),
        })
    }
}

fn method_for(verb: HttpVerb) -> Method {
    match verb {
        HttpVerb::Get => Method::GET,
        HttpVerb::Post => Method::POST,
        HttpVerb::Put => Method::PUT,
        HttpVerb::Patch => Method::PATCH,
        HttpVerb::Delete => Method::DELETE,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, verb: HttpVerb, path: &str, body: Option<Value>) -> Result<Value, TransportError> {
        let start = Instant::now();
        let url = self.resolve(path)?;
        debug!(method = verb.as_str(), %url, has_body = body.is_some(), "http request started");

        let mut request = self.http.request(method_for(verb), url.clone());
        if let Some(body) = &body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|error| TransportError::Request(error.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| TransportError::Request(error.to_string()))?;

        if !status.is_success() {
            warn!(
                method = verb.as_str(),
                %url,
                status = %status,
                duration_ms = start.elapsed().as_millis(),
                "http request failed"
            );
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        debug!(
            method = verb.as_str(),
            %url,
            status = %status,
            duration_ms = start.elapsed().as_millis(),
            "http request completed"
        );
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|error| TransportError::Decode(error.to_string()))
    }
}

/// Fills `{name}` placeholders from the top-level keys of `arguments`.
///
/// Strings are inserted verbatim before encoding; other values use their JSON
/// text. Placeholders without a matching argument are left untouched.
pub fn build_operation_path(template: &str, arguments: &Value) -> String {
    let Some(arguments) = arguments.as_object() else {
        return template.to_string();
    };
    let mut path = template.to_string();
    for (key, value) in arguments {
        let needle = format!("{{{key}}}");
        if !path.contains(&needle) {
            continue;
        }
        let raw = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let encoded = utf8_percent_encode(&raw, PATH_PLACEHOLDER_ENCODE_SET).to_string();
        path = path.replace(&needle, &encoded);
    }
    path
}

struct TransportOperation {
    definition: OperationDefinition,
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl Operation for TransportOperation {
    async fn execute(&self, request: OperationRequest) -> Result<Value, OperationError> {
        let path = build_operation_path(&self.definition.path, &request.arguments);
        let body = match self.definition.verb {
            HttpVerb::Get => None,
            _ if request.arguments.is_null() => None,
            _ => Some(request.arguments),
        };
        debug!(operation = %request.name, operation_id = request.operation_id, %path, "sending operation");
        Ok(self.transport.send(self.definition.verb, &path, body).await?)
    }
}

/// Builds operations from a configuration's `operations` table.
#[derive(Clone)]
pub struct TransportOperationFactory {
    definitions: IndexMap<String, OperationDefinition>,
    transport: Arc<dyn Transport>,
}

impl TransportOperationFactory {
    pub fn new(definitions: IndexMap<String, OperationDefinition>, transport: Arc<dyn Transport>) -> Self {
        Self { definitions, transport }
    }

    pub fn from_configuration(configuration: &ProductConfiguration, transport: Arc<dyn Transport>) -> Self {
        Self::new(configuration.operations.clone(), transport)
    }

    pub fn definition(&self, name: &str) -> Option<&OperationDefinition> {
        self.definitions.get(name)
    }
}

impl OperationFactory for TransportOperationFactory {
    fn create(&self, name: &str) -> Option<Arc<dyn Operation>> {
        let definition = self.definitions.get(name)?.clone();
        Some(Arc::new(TransportOperation {
            definition,
            transport: Arc::clone(&self.transport),
        }))
    }
}

impl std::fmt::Debug for TransportOperationFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOperationFactory")
            .field("operations", &self.definitions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Side-effect-free factory: every name resolves to an operation that echoes its request.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoOperationFactory;

struct EchoOperation;

#[async_trait]
impl Operation for EchoOperation {
    async fn execute(&self, request: OperationRequest) -> Result<Value, OperationError> {
        let mut payload = serde_json::Map::new();
        payload.insert("operation".into(), Value::String(request.name));
        payload.insert("arguments".into(), request.arguments);
        Ok(Value::Object(payload))
    }
}

impl OperationFactory for EchoOperationFactory {
    fn create(&self, _name: &str) -> Option<Arc<dyn Operation>> {
        Some(Arc::new(EchoOperation))
    }
}
