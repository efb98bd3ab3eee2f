//! Request description handed to [`Client::execute`](super::Client::execute).

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::Serialize;

/// Payload format negotiated for a call.
///
/// Selects the `Accept`/`Content-Type` media type and the decoder used for error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    /// `application/json`.
    #[default]
    Json,
    /// `application/xml`.
    Xml,
}

impl PayloadFormat {
    /// Returns the media type for this format.
    pub fn media_type(self) -> &'static str {
        match self {
            PayloadFormat::Json => "application/json",
            PayloadFormat::Xml => "application/xml",
        }
    }
}

/// Request body.
///
/// A call may have to be sent twice when the first attempt finds the session expired.
/// [`RequestBody::Buffered`] bodies are resent from their buffer; a
/// [`RequestBody::OneShot`] body can be sent once and makes the replay fail instead of
/// resending a consumed stream.
#[derive(Debug, Default)]
pub enum RequestBody {
    /// No body.
    #[default]
    Empty,
    /// In-memory body that can be sent any number of times.
    Buffered(Bytes),
    /// Streaming body that can be sent once.
    OneShot(Option<reqwest::Body>),
}

impl RequestBody {
    /// Wraps a body that cannot be rewound.
    pub fn one_shot(body: impl Into<reqwest::Body>) -> Self {
        RequestBody::OneShot(Some(body.into()))
    }

    /// Returns `true` if the body can be sent again after a first attempt.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, RequestBody::OneShot(_))
    }

    /// Produces the body for the next send attempt.
    ///
    /// Returns `Err(())` once a one-shot body has been consumed.
    pub(crate) fn next_attempt(&mut self) -> Result<Option<reqwest::Body>, ()> {
        match self {
            RequestBody::Empty => Ok(None),
            RequestBody::Buffered(bytes) => Ok(Some(reqwest::Body::from(bytes.clone()))),
            RequestBody::OneShot(slot) => slot.take().map(Some).ok_or(()),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Buffered(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Buffered(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        RequestBody::Buffered(Bytes::from(text))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        RequestBody::Buffered(Bytes::from_static(text.as_bytes()))
    }
}

/// A single REST call with already-resolved parameters.
///
/// `path` is either relative to the session's instance URL (e.g.
/// `/services/data/v65.0/sobjects/Account`) or an absolute URL.
///
/// # Example
///
/// ```
/// use salesforce_access::api::{PayloadFormat, RequestSpec};
///
/// let request = RequestSpec::get("/services/data/v65.0/query")
///     .query("q", "SELECT Id FROM Account")
///     .format(PayloadFormat::Json);
/// assert_eq!(request.path, "/services/data/v65.0/query");
/// ```
#[derive(Debug)]
pub struct RequestSpec {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the instance URL, or an absolute URL.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// Extra headers; `Authorization` is always overwritten.
    pub headers: HeaderMap,
    /// Request body.
    pub body: RequestBody,
    /// Negotiated payload format.
    pub format: PayloadFormat,
}

impl RequestSpec {
    /// Creates a request without body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            format: PayloadFormat::default(),
        }
    }

    /// Creates a `GET` request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Creates a `POST` request.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Creates a `PATCH` request.
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    /// Creates a `DELETE` request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Appends a query parameter.
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Sets a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Serializes `value` as a buffered JSON body and selects [`PayloadFormat::Json`].
    ///
    /// # Errors
    ///
    /// Returns the serialization error if `value` cannot be encoded.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.body = RequestBody::Buffered(Bytes::from(serde_json::to_vec(value)?));
        self.format = PayloadFormat::Json;
        Ok(self)
    }

    /// Sets the negotiated payload format.
    pub fn format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }
}
