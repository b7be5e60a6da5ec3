//! HTTP plumbing underneath the gateway.
//!
//! The [`Transport`] trait is the seam between the gateway's credential logic and the network.
//! [`HttpTransport`] is the reqwest-backed implementation; tests substitute scripted ones.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client as ReqwestClient, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// Raw body chunks of a streamed response, in arrival order.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// An outbound API call, described independently of any HTTP client.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Endpoint path relative to the API prefix, e.g. `chat/abc`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Attach a JSON body.
    pub fn json<T: serde::Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    /// Append one query pair.  Repeated keys are kept as separate pairs.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Append many query pairs.
    pub fn query_pairs<I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.query.extend(pairs);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether the gateway already replayed this request once after an authorization failure.
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub(crate) fn mark_retried(&mut self) {
        self.retried = true;
    }

    /// The bearer token this request carries, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }

    pub(crate) fn set_bearer(&mut self, token: &str) -> Result<()> {
        let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
            Error::validation(
                format!("access token is not a valid header value: {e}"),
                Some("Authorization".to_string()),
            )
        })?;
        self.headers.insert(header::AUTHORIZATION, value);
        Ok(())
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Build a response whose body is the given JSON value.
    pub fn json_body(status: StatusCode, body: &serde_json::Value) -> Self {
        let mut response = Self::new(status, body.to_string());
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    /// Deserialize the body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            Error::serialization(
                format!("Failed to parse response: {e}"),
                Some(Box::new(e)),
            )
        })
    }

    /// Turn a non-success response into the matching [`Error`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(error_for_status(self.status, &self.headers, &self.body))
        }
    }
}

/// The head of a streamed response.  The body has not been read yet.
pub struct StreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl StreamResponse {
    pub fn new(status: StatusCode, body: ByteStream) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    /// Turn a non-success response into the matching [`Error`], draining its body for the
    /// message.
    pub async fn error_for_status(self) -> Result<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        let StreamResponse {
            status,
            headers,
            mut body,
        } = self;
        let mut buffer = Vec::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => buffer.extend_from_slice(&chunk),
                Err(_) => break,
            }
        }
        Err(error_for_status(status, &headers, &buffer))
    }
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Map an HTTP error status and body onto the error taxonomy.
pub fn error_for_status(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Error {
    #[derive(Deserialize)]
    struct ErrorResponse {
        message: Option<String>,
        error: Option<String>,
    }

    let retry_after = headers
        .get(header::RETRY_AFTER)
        .and_then(|val| val.to_str().ok())
        .and_then(|val| val.parse::<u64>().ok());

    let raw = String::from_utf8_lossy(body).into_owned();
    let message = serde_json::from_slice::<ErrorResponse>(body)
        .ok()
        .and_then(|e| e.message.or(e.error))
        .unwrap_or_else(|| {
            if raw.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                raw
            }
        });

    match status.as_u16() {
        400 => Error::bad_request(message),
        401 => Error::authentication(message),
        403 => Error::permission(message),
        404 => Error::not_found(message, None, None),
        408 => Error::timeout(message, None),
        429 => Error::rate_limit(message, retry_after),
        500 => Error::internal_server(message),
        502..=504 => Error::service_unavailable(message, retry_after),
        code => Error::api(code, message),
    }
}

/// Sends [`ApiRequest`]s somewhere and reports what came back.
///
/// Implementations return every HTTP status as a response; only failures to talk to the
/// server at all are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and buffer the whole response.
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse>;

    /// Send a request and hand back the body as a chunk stream.
    async fn open_stream(&self, request: &ApiRequest) -> Result<StreamResponse>;
}

/// reqwest-backed [`Transport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: ReqwestClient,
    api_root: Url,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for the API described by `config`.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = ReqwestClient::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;
        Ok(Self {
            client,
            api_root: config.api_root()?,
            timeout: config.timeout,
        })
    }

    /// Resolve a request's path and query against the API root.
    pub fn url_for(&self, request: &ApiRequest) -> Result<Url> {
        let mut url = self.api_root.join(request.path.trim_start_matches('/'))?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn builder(&self, request: &ApiRequest, accept: &'static str) -> Result<reqwest::RequestBuilder> {
        let mut headers = request.headers.clone();
        headers
            .entry(header::ACCEPT)
            .or_insert(HeaderValue::from_static(accept));
        let mut builder = self
            .client
            .request(request.method.clone(), self.url_for(request)?)
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder)
    }

    fn send_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::timeout(
                format!("Request timed out: {e}"),
                Some(self.timeout.as_secs_f64()),
            )
        } else if e.is_connect() {
            Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
        } else {
            Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let response = self
            .builder(request, "application/json")?
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| {
            Error::http_client(format!("Failed to read response: {e}"), Some(Box::new(e)))
        })?;
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    async fn open_stream(&self, request: &ApiRequest) -> Result<StreamResponse> {
        let response = self
            .builder(request, "text/event-stream")?
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| {
                Error::streaming(format!("Error in HTTP stream: {e}"), Some(Box::new(e)))
            })
        });
        Ok(StreamResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}
