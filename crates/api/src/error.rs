//! Error types for the API client.

use kitebroker_store::StoreError;

/// Prefix of the synthetic code registered for non-2xx responses that carry
/// no structured error.
pub const STATUS_CODE_PREFIX: &str = "HTTP_STATUS_";

/// One `(code, message)` pair from a vendor error envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    pub code: String,
    pub message: String,
}

/// Structured API error: a registry of every code the server reported.
///
/// A single failure may carry several codes (partial success).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiError {
    entries: Vec<ErrorEntry>,
}

impl ApiError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an error with a single entry.
    pub fn single(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new();
        err.register(code, message);
        err
    }

    /// Generic error for an HTTP status with no structured body.
    pub fn http_status(status: u16) -> Self {
        Self::single(
            format!("{STATUS_CODE_PREFIX}{status}"),
            format!("HTTP status {status}"),
        )
    }

    /// Adds a code; duplicate codes are kept once.
    pub fn register(&mut self, code: impl Into<String>, message: impl Into<String>) {
        let code = code.into();
        if !self.has_code(&code) {
            self.entries.push(ErrorEntry {
                code,
                message: message.into(),
            });
        }
    }

    pub fn entries(&self) -> &[ErrorEntry] {
        &self.entries
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.code.as_str())
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.entries.iter().any(|e| e.code.eq_ignore_ascii_case(code))
    }

    /// True if any of `codes` was reported.
    pub fn has_any<S: AsRef<str>>(&self, codes: &[S]) -> bool {
        codes.iter().any(|c| self.has_code(c.as_ref()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for entry in &self.entries {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            if entry.message.is_empty() {
                write!(f, "{}", entry.code)?;
            } else {
                write!(f, "{}: {}", entry.code, entry.message)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

/// Errors produced by the API client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error: {0}")]
    Api(ApiError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid request: {0}")]
    Request(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("token for {0} could not be refreshed; sign in again")]
    Reauthenticate(String),

    #[error("no credential available for {0}")]
    NoCredential(String),
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        Error::Api(err)
    }
}

impl Error {
    /// Returns the structured API error, if this is one.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Error::Api(e) => Some(e),
            _ => None,
        }
    }

    /// True for network-level failures (connect, TLS, timeouts, resets).
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Http(e) => !e.is_builder(),
            Error::Transport(_) => true,
            _ => false,
        }
    }

    /// True if this is an API error carrying any of `codes`.
    pub fn has_code<S: AsRef<str>>(&self, codes: &[S]) -> bool {
        self.api_error().is_some_and(|e| e.has_any(codes))
    }
}
