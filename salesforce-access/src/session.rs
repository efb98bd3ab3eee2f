use oauth2::basic::BasicErrorResponse;
use oauth2::AccessToken;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::ErrorKind;

/// OAuth2 token endpoint path.
const TOKEN_PATH: &str = "/services/oauth2/token";

/// OAuth2 revocation endpoint path.
const REVOKE_PATH: &str = "/services/oauth2/revoke";

/// Errors that can occur during session operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read credentials file from disk.
    #[error("Failed to read credentials file at {path}: {source}")]
    ReadCredentials {
        /// Path to the credentials file that failed to read.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Failed to parse credentials JSON.
    #[error("Failed to parse credentials JSON: {source}")]
    ParseCredentials {
        #[source]
        source: serde_json::Error,
    },
    /// Invalid URL format in credentials.
    #[error("Invalid URL format: {source}")]
    ParseUrl {
        #[source]
        source: url::ParseError,
    },
    /// Required builder parameter was not provided.
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
    /// A required credential field is empty.
    #[error("Invalid credentials: {message}")]
    InvalidCredentials {
        /// Description of what's missing or invalid.
        message: String,
    },
    /// Failed to construct the HTTP client.
    #[error("Failed to build HTTP client: {source}")]
    HttpClientBuild {
        #[source]
        source: reqwest::Error,
    },
    /// The token endpoint rejected the grant with a structured OAuth2 error.
    #[error("Authentication failed: {code}: {description}")]
    Authentication {
        /// Provider error code, e.g. `invalid_grant`.
        code: String,
        /// Provider error description.
        description: String,
    },
    /// The token endpoint answered with an unexpected status.
    #[error("Token endpoint returned {status} {reason}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Reason phrase for the status.
        reason: String,
    },
    /// The token endpoint answered 200 with a body that is not a token response.
    #[error("Invalid token response: {source}")]
    InvalidTokenResponse {
        #[source]
        source: serde_json::Error,
    },
    /// Token revocation was refused.
    #[error("Token revocation failed: {status} {reason}")]
    Revoke {
        /// HTTP status code.
        status: u16,
        /// Reason phrase for the status.
        reason: String,
    },
    /// Network or I/O failure talking to the login server.
    #[error("Login transport error: {source}")]
    Transport {
        #[source]
        source: reqwest::Error,
    },
}

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Authentication { .. } => ErrorKind::NotAuthorized,
            Error::Http { status, .. } | Error::Revoke { status, .. } => {
                ErrorKind::from_status(*status)
            }
            Error::Transport { .. } => ErrorKind::Transient,
            Error::ReadCredentials { .. }
            | Error::ParseCredentials { .. }
            | Error::ParseUrl { .. }
            | Error::MissingRequiredAttribute(_)
            | Error::InvalidCredentials { .. } => ErrorKind::BadInput,
            Error::HttpClientBuild { .. } | Error::InvalidTokenResponse { .. } => ErrorKind::Other,
        }
    }
}

/// Salesforce OAuth2 password-grant credentials.
///
/// Obtained from a Salesforce Connected App. Immutable once handed to a [`Builder`].
///
/// # Examples
///
/// ```
/// use salesforce_access::session::Credentials;
///
/// let creds = Credentials {
///     login_url: "https://login.salesforce.com".to_string(),
///     client_id: "your_client_id".to_string(),
///     client_secret: "your_client_secret".to_string(),
///     username: "user@example.com".to_string(),
///     password: "your_password".to_string(),
/// };
/// ```
#[derive(Serialize, Deserialize, Clone)]
pub struct Credentials {
    /// Login server base URL.
    ///
    /// For production orgs, use `https://login.salesforce.com`.
    /// For sandbox orgs, use `https://test.salesforce.com`.
    pub login_url: String,
    /// Client ID from the Connected App (Consumer Key).
    pub client_id: String,
    /// Client Secret from the Connected App (Consumer Secret).
    pub client_secret: String,
    /// Username for authentication (email address).
    pub username: String,
    /// Password for authentication.
    ///
    /// **Note:** If your org requires a security token, append it to the password.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login_url", &self.login_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// Source for loading credentials.
#[derive(Debug, Clone)]
pub enum CredentialsFrom {
    /// Load credentials from a JSON file.
    Path(PathBuf),
    /// Use credentials provided directly.
    Value(Credentials),
}

/// Current session as held by a [`SessionManager`].
#[derive(Debug, Default)]
pub(crate) struct Session {
    pub(crate) access_token: Option<AccessToken>,
    pub(crate) instance_url: Option<String>,
}

impl Session {
    fn clear(&mut self) {
        self.access_token = None;
        self.instance_url = None;
    }
}

/// Successful token endpoint payload; other fields are ignored.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: String,
}

/// Owner of the OAuth2 session shared by every API and streaming client.
///
/// All reads and writes of the session happen under one async mutex, and the network round
/// trip that acquires a new token is performed while holding it. Concurrent callers that
/// detect the same expired token therefore queue behind a single acquisition and then
/// observe its result.
///
/// Use [`Builder`] to construct an instance and share it behind an [`Arc`](std::sync::Arc).
#[derive(Debug)]
pub struct SessionManager {
    credentials: Credentials,
    login_url: Url,
    http_client: reqwest::Client,
    pub(crate) session: Mutex<Session>,
}

impl SessionManager {
    /// Returns a valid access token, acquiring a new one when required.
    ///
    /// `presented` is the token the caller last used. A new session is acquired only when
    /// no token is held or the held token equals `presented` (the caller saw it fail).
    /// Otherwise someone else already refreshed it and the current token is returned
    /// without a network call.
    ///
    /// Before acquiring, a held token is revoked and forgotten; a revocation failure is
    /// logged and does not prevent the new acquisition.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The token endpoint rejects the grant ([`Error::Authentication`])
    /// - The token endpoint answers with any other failure status ([`Error::Http`])
    /// - The login server cannot be reached ([`Error::Transport`])
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn login(&self, presented: Option<&str>) -> Result<String, Error> {
        let mut session = self.session.lock().await;

        if let Some(current) = &session.access_token {
            if presented != Some(current.secret().as_str()) {
                debug!("session already refreshed by another caller");
                return Ok(current.secret().clone());
            }
        }

        if let Some(stale) = session.access_token.take() {
            session.instance_url = None;
            if let Err(e) = self.revoke(&stale).await {
                warn!(error = %e, "failed to revoke previous session, continuing with login");
            }
        }

        let acquired = self.acquire().await?;
        let token = acquired.access_token.clone();
        session.access_token = Some(AccessToken::new(acquired.access_token));
        session.instance_url = Some(acquired.instance_url);
        info!("session acquired");

        Ok(token)
    }

    /// Revokes the current session and forgets it.
    ///
    /// The held token and instance URL are cleared even when revocation fails, so the
    /// manager never keeps using a token whose state is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Revoke`] for a refused revocation and [`Error::Transport`] when the
    /// login server cannot be reached.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn logout(&self) -> Result<(), Error> {
        let mut session = self.session.lock().await;
        let result = match &session.access_token {
            Some(token) => self.revoke(token).await,
            None => Ok(()),
        };
        session.clear();
        result
    }

    /// Returns the current access token without contacting the server.
    pub async fn current_token(&self) -> Option<String> {
        let session = self.session.lock().await;
        session.access_token.as_ref().map(|t| t.secret().clone())
    }

    /// Returns the instance URL of the current session.
    pub async fn instance_url(&self) -> Option<String> {
        self.session.lock().await.instance_url.clone()
    }

    /// Returns the current token and instance URL as one consistent snapshot.
    pub(crate) async fn snapshot(&self) -> Option<(String, String)> {
        let session = self.session.lock().await;
        match (&session.access_token, &session.instance_url) {
            (Some(token), Some(url)) => Some((token.secret().clone(), url.clone())),
            _ => None,
        }
    }

    /// Returns the login server base URL.
    pub fn login_url(&self) -> &Url {
        &self.login_url
    }

    /// Performs the password grant against the token endpoint.
    async fn acquire(&self) -> Result<TokenResponse, Error> {
        let url = self
            .login_url
            .join(TOKEN_PATH)
            .map_err(|source| Error::ParseUrl { source })?;

        let form = [
            ("grant_type", "password"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
            ("format", "json"),
        ];

        let response = self
            .http_client
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|source| Error::Transport { source })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|source| Error::Transport { source })?;

        match status {
            StatusCode::OK => serde_json::from_slice::<TokenResponse>(&body)
                .map_err(|source| Error::InvalidTokenResponse { source }),
            StatusCode::BAD_REQUEST => match serde_json::from_slice::<BasicErrorResponse>(&body) {
                Ok(error) => Err(Error::Authentication {
                    code: error.error().to_string(),
                    description: error.error_description().cloned().unwrap_or_default(),
                }),
                Err(_) => Err(http_error(status)),
            },
            _ => Err(http_error(status)),
        }
    }

    /// Revokes `token` at the revocation endpoint.
    async fn revoke(&self, token: &AccessToken) -> Result<(), Error> {
        let url = self
            .login_url
            .join(REVOKE_PATH)
            .map_err(|source| Error::ParseUrl { source })?;

        let response = self
            .http_client
            .get(url)
            .query(&[("token", token.secret().as_str())])
            .send()
            .await
            .map_err(|source| Error::Transport { source })?;

        let status = response.status();
        // Drain so the connection returns to the pool.
        let _ = response.bytes().await;

        if status == StatusCode::OK {
            debug!("session revoked");
            Ok(())
        } else {
            Err(Error::Revoke {
                status: status.as_u16(),
                reason: reason_phrase(status),
            })
        }
    }
}

fn reason_phrase(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or("Unknown").to_string()
}

fn http_error(status: StatusCode) -> Error {
    Error::Http {
        status: status.as_u16(),
        reason: reason_phrase(status),
    }
}

/// Builder for constructing a [`SessionManager`].
///
/// # Examples
///
/// ## Direct credentials
///
/// ```
/// use salesforce_access::session::{self, Credentials};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = session::Builder::new()
///     .credentials(Credentials {
///         login_url: "https://login.salesforce.com".to_string(),
///         client_id: "your_client_id".to_string(),
///         client_secret: "your_client_secret".to_string(),
///         username: "user@example.com".to_string(),
///         password: "your_password".to_string(),
///     })
///     .build()?;
/// # Ok(())
/// # }
/// ```
///
/// ## Loading from File
///
/// ```no_run
/// use salesforce_access::session;
/// use std::path::PathBuf;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = session::Builder::new()
///     .credentials_path(PathBuf::from("credentials.json"))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Builder {
    credentials_from: Option<CredentialsFrom>,
    http_client: Option<reqwest::Client>,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets credentials to load from a JSON file.
    ///
    /// ```json
    /// {
    ///   "login_url": "https://login.salesforce.com",
    ///   "client_id": "your_client_id",
    ///   "client_secret": "your_client_secret",
    ///   "username": "user@example.com",
    ///   "password": "your_password"
    /// }
    /// ```
    pub fn credentials_path(mut self, path: PathBuf) -> Self {
        self.credentials_from = Some(CredentialsFrom::Path(path));
        self
    }

    /// Sets credentials directly.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials_from = Some(CredentialsFrom::Value(credentials));
        self
    }

    /// Uses a caller-supplied HTTP client for login and revocation calls.
    ///
    /// Defaults to a client with the crate's authentication timeouts and redirects disabled.
    pub fn http_client(mut self, http_client: reqwest::Client) -> Self {
        self.http_client = Some(http_client);
        self
    }

    /// Builds the session manager. No network call is made.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Credentials were not provided ([`Error::MissingRequiredAttribute`])
    /// - Credentials file cannot be read ([`Error::ReadCredentials`])
    /// - Credentials JSON is invalid ([`Error::ParseCredentials`])
    /// - A required field is empty ([`Error::InvalidCredentials`])
    /// - The login URL is malformed ([`Error::ParseUrl`])
    pub fn build(self) -> Result<SessionManager, Error> {
        let credentials = match self.credentials_from.ok_or_else(|| {
            Error::MissingRequiredAttribute("credentials or credentials_path".to_string())
        })? {
            CredentialsFrom::Value(creds) => creds,
            CredentialsFrom::Path(path) => {
                let credentials_string =
                    fs::read_to_string(&path).map_err(|e| Error::ReadCredentials {
                        path: path.clone(),
                        source: e,
                    })?;
                serde_json::from_str(&credentials_string)
                    .map_err(|e| Error::ParseCredentials { source: e })?
            }
        };

        validate_credentials(&credentials)?;

        let login_url =
            Url::parse(&credentials.login_url).map_err(|e| Error::ParseUrl { source: e })?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .connect_timeout(Duration::from_secs(crate::DEFAULT_AUTH_CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(crate::DEFAULT_AUTH_REQUEST_TIMEOUT_SECS))
                .build()
                .map_err(|source| Error::HttpClientBuild { source })?,
        };

        Ok(SessionManager {
            credentials,
            login_url,
            http_client,
            session: Mutex::new(Session::default()),
        })
    }
}

/// Validates that every credential field needed by the password grant is present.
fn validate_credentials(credentials: &Credentials) -> Result<(), Error> {
    let required = [
        ("login_url", &credentials.login_url),
        ("client_id", &credentials.client_id),
        ("client_secret", &credentials.client_secret),
        ("username", &credentials.username),
        ("password", &credentials.password),
    ];

    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(Error::InvalidCredentials {
                message: format!("{name} is required"),
            });
        }
    }

    Ok(())
}
