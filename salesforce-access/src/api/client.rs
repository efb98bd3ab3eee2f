//! Authenticated REST client with session-expiry recovery.

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use oauth2::AccessToken;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::{ApiError, PayloadFormat, RequestSpec};
use crate::session::{self, SessionManager};
use crate::ErrorKind;

/// Streaming body of a successful response.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Errors that can occur while executing a REST call.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Acquiring or refreshing the session failed.
    #[error("Session error: {source}")]
    Session {
        #[source]
        source: session::Error,
    },
    /// The server answered with a non-2xx status.
    #[error("Remote API error: {0}")]
    Remote(ApiError),
    /// Network or I/O failure.
    #[error("Transport error: {source}")]
    Transport {
        #[source]
        source: reqwest::Error,
    },
    /// The session expired and the request body could not be sent again.
    #[error("Session expired and the request body cannot be replayed")]
    BodyNotReplayable,
    /// The access token cannot be used as a header value.
    #[error("Invalid header value: {source}")]
    InvalidHeader {
        #[source]
        source: reqwest::header::InvalidHeaderValue,
    },
    /// The request path does not form a valid URL.
    #[error("Invalid request URL: {source}")]
    ParseUrl {
        #[source]
        source: url::ParseError,
    },
    /// The session manager holds no session after a successful login.
    #[error("No active session")]
    NotConnected,
    /// Failed to construct the HTTP client.
    #[error("Failed to build HTTP client: {source}")]
    HttpClientBuild {
        #[source]
        source: reqwest::Error,
    },
    /// Cached session lock was poisoned.
    #[error("Lock error")]
    LockError,
    /// The caller cancelled the call.
    #[error("Request cancelled")]
    Cancelled,
}

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Session { source } => source.kind(),
            Error::Remote(error) => error.kind(),
            Error::Transport { .. } => ErrorKind::Transient,
            Error::BodyNotReplayable | Error::InvalidHeader { .. } | Error::ParseUrl { .. } => {
                ErrorKind::BadInput
            }
            Error::NotConnected => ErrorKind::NotAuthorized,
            Error::HttpClientBuild { .. } | Error::LockError | Error::Cancelled => ErrorKind::Other,
        }
    }

    /// Returns the decoded provider error, if the server sent one.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Error::Remote(error) => Some(error),
            _ => None,
        }
    }
}

/// Settings for a REST [`Client`].
#[derive(Debug, Clone)]
pub struct Config {
    /// API version used by [`Client::data_path`], e.g. `65.0`.
    pub api_version: String,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout.
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_version: crate::DEFAULT_API_VERSION.to_string(),
            connect_timeout: Duration::from_secs(crate::DEFAULT_CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(crate::DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl Config {
    /// Sets the API version.
    pub fn api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
struct CachedSession {
    token: AccessToken,
    instance_url: String,
}

/// REST client that survives session expiry.
///
/// Every request is stamped with a locally cached copy of the session token. The cache
/// is not authoritative: when a response comes back `401`, the client asks the shared
/// [`SessionManager`] for a fresh token (presenting the one that failed), updates its
/// cache and replays the request exactly once. Any other failure, including a second
/// `401`, is returned to the caller as a decoded [`ApiError`].
///
/// Several clients may share one manager; concurrent refreshes collapse into a single
/// login.
#[derive(Debug)]
pub struct Client {
    session: Arc<SessionManager>,
    http_client: reqwest::Client,
    api_version: String,
    cached: RwLock<Option<CachedSession>>,
}

impl Client {
    /// Creates a client with an HTTP client built from `config`.
    ///
    /// The manager's current session, if any, is cached. No network call is made; a
    /// client created before the first login acquires a session on its first call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HttpClientBuild`] if the HTTP client cannot be constructed.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn new(session: Arc<SessionManager>, config: Config) -> Result<Self, Error> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| Error::HttpClientBuild { source })?;

        Ok(Self::with_http_client(session, http_client, config.api_version).await)
    }

    /// Creates a client around a caller-supplied HTTP client.
    pub async fn with_http_client(
        session: Arc<SessionManager>,
        http_client: reqwest::Client,
        api_version: impl Into<String>,
    ) -> Self {
        let cached = session
            .snapshot()
            .await
            .map(|(token, instance_url)| CachedSession {
                token: AccessToken::new(token),
                instance_url,
            });

        Self {
            session,
            http_client,
            api_version: api_version.into(),
            cached: RwLock::new(cached),
        }
    }

    /// Returns the shared session manager.
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Returns the API version being used.
    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Returns `/services/data/v{version}{suffix}`.
    ///
    /// ```no_run
    /// # async fn run(client: salesforce_access::api::Client) {
    /// assert_eq!(client.data_path("/limits"), "/services/data/v65.0/limits");
    /// # }
    /// ```
    pub fn data_path(&self, suffix: &str) -> String {
        format!("/services/data/v{}{suffix}", self.api_version)
    }

    /// Returns the token currently used to stamp requests.
    pub fn cached_token(&self) -> Option<String> {
        self.cached
            .read()
            .ok()
            .and_then(|cached| cached.as_ref().map(|c| c.token.secret().clone()))
    }

    /// Executes `request`.
    ///
    /// Returns `Ok(None)` for a 2xx response without content and `Ok(Some(stream))`
    /// otherwise; drain the stream with [`collect`] or consume it incrementally.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The session cannot be acquired or refreshed ([`Error::Session`])
    /// - The server answers with a non-2xx status, including a `401` after the replay
    ///   ([`Error::Remote`])
    /// - The session expired and the body is one-shot ([`Error::BodyNotReplayable`])
    /// - The network fails ([`Error::Transport`])
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn execute(&self, request: RequestSpec) -> Result<Option<ByteStream>, Error> {
        self.execute_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Executes `request`, abandoning it with [`Error::Cancelled`] when `cancel` fires.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn execute_with_cancel(
        &self,
        request: RequestSpec,
        cancel: &CancellationToken,
    ) -> Result<Option<ByteStream>, Error> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.run(request) => result,
        }
    }

    async fn run(&self, mut request: RequestSpec) -> Result<Option<ByteStream>, Error> {
        let current = self.current_session().await?;
        let response = self.send(&mut request, &current).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return finish(response, request.format).await;
        }

        debug!(path = %request.path, "session expired, refreshing before replay");
        // Drain so the connection returns to the pool.
        let _ = response.bytes().await;

        let refreshed = self.refresh(current.token.secret()).await?;
        let response = self.send(&mut request, &refreshed).await?;
        finish(response, request.format).await
    }

    /// Returns the cached session, logging in when nothing is cached yet.
    async fn current_session(&self) -> Result<CachedSession, Error> {
        let cached = self.cached.read().map_err(|_| Error::LockError)?.clone();
        match cached {
            Some(cached) => Ok(cached),
            None => {
                self.session
                    .login(None)
                    .await
                    .map_err(|source| Error::Session { source })?;
                self.store_snapshot().await
            }
        }
    }

    /// Asks the manager to replace `stale` and caches the result.
    async fn refresh(&self, stale: &str) -> Result<CachedSession, Error> {
        self.session
            .login(Some(stale))
            .await
            .map_err(|source| Error::Session { source })?;
        self.store_snapshot().await
    }

    async fn store_snapshot(&self) -> Result<CachedSession, Error> {
        let (token, instance_url) = self.session.snapshot().await.ok_or(Error::NotConnected)?;
        let fresh = CachedSession {
            token: AccessToken::new(token),
            instance_url,
        };
        *self.cached.write().map_err(|_| Error::LockError)? = Some(fresh.clone());
        Ok(fresh)
    }

    async fn send(
        &self,
        request: &mut RequestSpec,
        session: &CachedSession,
    ) -> Result<reqwest::Response, Error> {
        let body = request
            .body
            .next_attempt()
            .map_err(|()| Error::BodyNotReplayable)?;
        let url = resolve_url(&session.instance_url, &request.path)?;

        let mut headers = request.headers.clone();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", session.token.secret()))
            .map_err(|source| Error::InvalidHeader { source })?;
        headers.insert(AUTHORIZATION, bearer);
        let media_type = HeaderValue::from_static(request.format.media_type());
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, media_type.clone());
        }

        let mut builder = self
            .http_client
            .request(request.method.clone(), url)
            .query(&request.query);
        if let Some(body) = body {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, media_type);
            }
            builder = builder.body(body);
        }

        builder
            .headers(headers)
            .send()
            .await
            .map_err(|source| Error::Transport { source })
    }
}

/// Joins a relative request path onto the instance URL; absolute URLs pass through.
fn resolve_url(instance_url: &str, path: &str) -> Result<Url, Error> {
    let raw = if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else {
        format!(
            "{}/{}",
            instance_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    };
    Url::parse(&raw).map_err(|source| Error::ParseUrl { source })
}

async fn finish(
    response: reqwest::Response,
    format: PayloadFormat,
) -> Result<Option<ByteStream>, Error> {
    let status = response.status();

    if status.is_success() {
        if status == StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            let _ = response.bytes().await;
            return Ok(None);
        }
        return Ok(Some(Box::pin(response.bytes_stream())));
    }

    let reason = status.canonical_reason().unwrap_or("Unknown");
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            warn!(status = status.as_u16(), error = %e, "failed to read error body");
            Bytes::new()
        }
    };

    Err(Error::Remote(ApiError::decode(
        status.as_u16(),
        reason,
        &body,
        format,
    )))
}

/// Drains a response body into memory; `None` yields an empty buffer.
///
/// # Errors
///
/// Returns [`Error::Transport`] if the stream fails part-way.
pub async fn collect(body: Option<ByteStream>) -> Result<Bytes, Error> {
    let Some(mut stream) = body else {
        return Ok(Bytes::new());
    };

    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk.map_err(|source| Error::Transport { source })?);
    }
    Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RequestBody;
    use crate::session::testing::manager;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ACCOUNT_PATH: &str = "/services/data/v65.0/sobjects/Account/001";

    async fn mount_login(server: &MockServer, token: &str) {
        Mock::given(method("GET"))
            .and(path("/services/oauth2/revoke"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": token,
                "instance_url": server.uri(),
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn seeded_client(server: &MockServer) -> Client {
        let session = Arc::new(manager(&server.uri()));
        session.seed("T1", &server.uri()).await;
        Client::new(session, Config::default()).await.unwrap()
    }

    #[test]
    fn test_resolve_url() {
        let url = resolve_url("https://x.my.salesforce.com/", "/services/data").unwrap();
        assert_eq!(url.as_str(), "https://x.my.salesforce.com/services/data");

        let url = resolve_url("https://x", "https://y/absolute").unwrap();
        assert_eq!(url.as_str(), "https://y/absolute");
    }

    #[test]
    fn test_config_setters() {
        let config = Config::default()
            .api_version("59.0")
            .request_timeout(Duration::from_secs(5));
        assert_eq!(config.api_version, "59.0");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(
            config.connect_timeout,
            Duration::from_secs(crate::DEFAULT_CONNECT_TIMEOUT_SECS)
        );
    }

    #[tokio::test]
    async fn test_data_path_and_cached_token() {
        let server = MockServer::start().await;
        let client = seeded_client(&server).await;
        assert_eq!(client.data_path("/limits"), "/services/data/v65.0/limits");
        assert_eq!(client.cached_token().as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn test_debug_redacts_cached_token() {
        let server = MockServer::start().await;
        let session = Arc::new(manager(&server.uri()));
        session.seed("SECRET_TOKEN_T1", &server.uri()).await;
        let client = Client::new(session, Config::default()).await.unwrap();

        let debug = format!("{client:?}");
        assert!(!debug.contains("SECRET_TOKEN_T1"));
        assert_eq!(client.cached_token().as_deref(), Some("SECRET_TOKEN_T1"));
    }

    #[tokio::test]
    async fn test_execute_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(ACCOUNT_PATH))
            .and(header("Authorization", "Bearer T1"))
            .and(header("Accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Id":"001"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let client = seeded_client(&server).await;
        let body = client.execute(RequestSpec::get(ACCOUNT_PATH)).await.unwrap();
        assert_eq!(collect(body).await.unwrap().as_ref(), br#"{"Id":"001"}"#);
    }

    #[tokio::test]
    async fn test_execute_logs_in_when_no_session() {
        let server = MockServer::start().await;
        mount_login(&server, "T1").await;
        Mock::given(method("GET"))
            .and(path(ACCOUNT_PATH))
            .and(header("Authorization", "Bearer T1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let session = Arc::new(manager(&server.uri()));
        let client = Client::new(session, Config::default()).await.unwrap();
        assert!(client.cached_token().is_none());

        client.execute(RequestSpec::get(ACCOUNT_PATH)).await.unwrap();
        assert_eq!(client.cached_token().as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn test_execute_replays_after_401() {
        let server = MockServer::start().await;
        mount_login(&server, "T2").await;
        Mock::given(method("GET"))
            .and(path(ACCOUNT_PATH))
            .and(header("Authorization", "Bearer T1"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!([
                {"message": "Session expired or invalid", "errorCode": "INVALID_SESSION_ID"}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(ACCOUNT_PATH))
            .and(header("Authorization", "Bearer T2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"Id":"001"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let client = seeded_client(&server).await;
        let body = client.execute(RequestSpec::get(ACCOUNT_PATH)).await.unwrap();

        assert_eq!(collect(body).await.unwrap().as_ref(), br#"{"Id":"001"}"#);
        assert_eq!(client.cached_token().as_deref(), Some("T2"));
        assert_eq!(client.session().current_token().await.as_deref(), Some("T2"));
    }

    #[tokio::test]
    async fn test_execute_replays_only_once() {
        let server = MockServer::start().await;
        mount_login(&server, "T2").await;
        Mock::given(method("GET"))
            .and(path(ACCOUNT_PATH))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let client = seeded_client(&server).await;
        let result = client.execute(RequestSpec::get(ACCOUNT_PATH)).await;

        let error = result.err().unwrap();
        assert_eq!(error.api_error().map(|e| e.status), Some(401));
        assert_eq!(error.kind(), ErrorKind::NotAuthorized);
    }

    #[tokio::test]
    async fn test_buffered_body_is_replayed() {
        let server = MockServer::start().await;
        mount_login(&server, "T2").await;
        Mock::given(method("POST"))
            .and(path("/services/data/v65.0/sobjects/Account"))
            .and(header("Authorization", "Bearer T1"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/services/data/v65.0/sobjects/Account"))
            .and(header("Authorization", "Bearer T2"))
            .and(header("Content-Type", "application/json"))
            .and(wiremock::matchers::body_string(r#"{"Name":"Acme"}"#))
            .respond_with(ResponseTemplate::new(201).set_body_string(r#"{"id":"001"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let client = seeded_client(&server).await;
        let request = RequestSpec::post("/services/data/v65.0/sobjects/Account")
            .json(&serde_json::json!({"Name": "Acme"}))
            .unwrap();
        let body = client.execute(request).await.unwrap();
        assert!(body.is_some());
    }

    #[tokio::test]
    async fn test_one_shot_body_is_not_replayed() {
        let server = MockServer::start().await;
        mount_login(&server, "T2").await;
        Mock::given(method("POST"))
            .and(path("/services/data/v65.0/sobjects/Account"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = seeded_client(&server).await;
        let request = RequestSpec::post("/services/data/v65.0/sobjects/Account")
            .body(RequestBody::one_shot("payload"));
        let result = client.execute(request).await;

        assert!(matches!(result, Err(Error::BodyNotReplayable)));
    }

    #[tokio::test]
    async fn test_json_error_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/data/v65.0/query"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!([
                {"message": "unexpected token: FORM", "errorCode": "MALFORMED_QUERY"}
            ])))
            .mount(&server)
            .await;

        let client = seeded_client(&server).await;
        let request =
            RequestSpec::get("/services/data/v65.0/query").query("q", "SELECT Id FORM Account");
        let error = client.execute(request).await.err().unwrap();

        let api_error = error.api_error().unwrap();
        assert_eq!(api_error.status, 400);
        assert!(api_error.has_code("MALFORMED_QUERY"));
        assert_eq!(error.kind(), ErrorKind::BadInput);
    }

    #[tokio::test]
    async fn test_xml_error_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(ACCOUNT_PATH))
            .and(header("Accept", "application/xml"))
            .respond_with(ResponseTemplate::new(404).set_body_raw(
                concat!(
                    "<Errors><Error><errorCode>NOT_FOUND</errorCode>",
                    "<message>gone</message></Error></Errors>"
                ),
                "application/xml",
            ))
            .mount(&server)
            .await;

        let client = seeded_client(&server).await;
        let request = RequestSpec::get(ACCOUNT_PATH).format(PayloadFormat::Xml);
        let error = client.execute(request).await.err().unwrap();

        assert!(error.api_error().unwrap().has_code("NOT_FOUND"));
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_undecodable_error_falls_back_to_reason() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(ACCOUNT_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("<html>boom</html>"))
            .mount(&server)
            .await;

        let client = seeded_client(&server).await;
        let error = client.execute(RequestSpec::get(ACCOUNT_PATH)).await.err().unwrap();

        let api_error = error.api_error().unwrap();
        assert_eq!(api_error.entries[0].code, "500");
        assert_eq!(api_error.entries[0].message, "Internal Server Error");
        assert_eq!(error.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_no_content_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path(ACCOUNT_PATH))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = seeded_client(&server).await;
        let body = client.execute(RequestSpec::delete(ACCOUNT_PATH)).await.unwrap();
        assert!(body.is_none());
        assert!(collect(body).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execute_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(ACCOUNT_PATH))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let client = seeded_client(&server).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = client
            .execute_with_cancel(RequestSpec::get(ACCOUNT_PATH), &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_login_failure_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "authentication failure"
            })))
            .mount(&server)
            .await;

        let session = Arc::new(manager(&server.uri()));
        let client = Client::new(session, Config::default()).await.unwrap();
        let error = client.execute(RequestSpec::get(ACCOUNT_PATH)).await.err().unwrap();

        assert!(matches!(error, Error::Session { source: session::Error::Authentication { .. } }));
        assert_eq!(error.kind(), ErrorKind::NotAuthorized);
    }
}
