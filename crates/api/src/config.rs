//! Client configuration.

use std::time::Duration;

use kitebroker_store::Cipher;

use crate::Error;

/// Lower bound for upload chunks (1 MiB).
pub const MIN_CHUNK_SIZE: u64 = 1 << 20;

/// Upper bound for upload chunks (68 MiB).
pub const MAX_CHUNK_SIZE: u64 = 68 << 20;

/// Error codes that mean the credential itself must be renewed.
pub const DEFAULT_TOKEN_ERROR_CODES: &[&str] = &[
    "ERR_AUTH_PROFILE_CHANGED",
    "ERR_INVALID_GRANT",
    "INVALID_GRANT",
    "ERR_AUTH_UNAUTHORIZED",
    "HTTP_STATUS_401",
];

/// Error codes that are worth another attempt after a backoff.
pub const DEFAULT_RETRY_ERROR_CODES: &[&str] = &[
    "ERR_INTERNAL_SERVER_ERROR",
    "HTTP_STATUS_500",
    "HTTP_STATUS_502",
    "HTTP_STATUS_503",
    "HTTP_STATUS_504",
];

/// Connection and policy settings shared by every session of a client.
///
/// Secrets are held encrypted under a process-local key and only decrypted
/// when a token request is built.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server hostname (no scheme).
    pub server: String,
    /// OAuth application (client) id.
    pub application_id: String,
    pub redirect_uri: String,
    /// Optional proxy URI applied to all requests.
    pub proxy: Option<String>,
    pub verify_ssl: bool,
    pub connect_timeout: Duration,
    /// Total timeout for API calls; per-read timeout for transfer bodies.
    pub request_timeout: Duration,
    /// Retry ceiling for one logical call.
    pub retries: u32,
    /// Backoff sleeps are `(attempt + 1)^2` multiples of this unit.
    pub backoff_unit: Duration,
    pub token_error_codes: Vec<String>,
    pub retry_error_codes: Vec<String>,
    /// Value of the API version header.
    pub api_version: String,
    pub token_path: String,
    pub scope: String,
    pub user_agent: String,
    max_chunk_size: u64,
    client_secret: String,
    signature_secret: Option<String>,
    cipher: Cipher,
}

impl ClientConfig {
    pub fn new(
        server: impl Into<String>,
        application_id: impl Into<String>,
        client_secret: &str,
    ) -> Result<Self, Error> {
        let server = server.into();
        let cipher = Cipher::generate();
        let client_secret = cipher.encrypt(client_secret.as_bytes())?;
        Ok(Self {
            redirect_uri: format!("https://{server}/rest/callback.html"),
            server,
            application_id: application_id.into(),
            proxy: None,
            verify_ssl: true,
            connect_timeout: Duration::from_secs(12),
            request_timeout: Duration::from_secs(300),
            retries: 3,
            backoff_unit: Duration::from_secs(1),
            token_error_codes: DEFAULT_TOKEN_ERROR_CODES.iter().map(|c| c.to_string()).collect(),
            retry_error_codes: DEFAULT_RETRY_ERROR_CODES.iter().map(|c| c.to_string()).collect(),
            api_version: "28".into(),
            token_path: "/oauth/token".into(),
            scope: "*/*/*".into(),
            user_agent: format!("kitebroker/{}", env!("CARGO_PKG_VERSION")),
            max_chunk_size: MAX_CHUNK_SIZE,
            client_secret,
            signature_secret: None,
            cipher,
        })
    }

    /// Sets the signature secret used for unattended (assertion) grants.
    pub fn with_signature_secret(mut self, secret: &str) -> Result<Self, Error> {
        self.signature_secret = Some(self.cipher.encrypt(secret.as_bytes())?);
        Ok(self)
    }

    /// Sets the chunk size, clamped to [`MIN_CHUNK_SIZE`, `MAX_CHUNK_SIZE`].
    #[must_use]
    pub fn with_max_chunk_size(mut self, size: u64) -> Self {
        self.max_chunk_size = size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    pub fn client_secret(&self) -> Result<String, Error> {
        self.reveal(&self.client_secret)
    }

    pub fn signature_secret(&self) -> Result<Option<String>, Error> {
        self.signature_secret
            .as_deref()
            .map(|s| self.reveal(s))
            .transpose()
    }

    /// True when the client can obtain new tokens without an operator.
    pub fn has_signature_secret(&self) -> bool {
        self.signature_secret.is_some()
    }

    fn reveal(&self, sealed: &str) -> Result<String, Error> {
        let plain = self.cipher.decrypt(sealed)?;
        String::from_utf8(plain).map_err(|e| Error::Request(format!("secret is not UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new("kw.example.com", "app-id", "s3cret").unwrap()
    }

    #[test]
    fn defaults() {
        let cfg = config();
        assert_eq!(cfg.redirect_uri, "https://kw.example.com/rest/callback.html");
        assert_eq!(cfg.retries, 3);
        assert_eq!(cfg.max_chunk_size(), MAX_CHUNK_SIZE);
        assert!(cfg.verify_ssl);
        assert!(!cfg.has_signature_secret());
        assert!(cfg.retry_error_codes.iter().any(|c| c == "ERR_INTERNAL_SERVER_ERROR"));
        assert!(cfg.token_error_codes.iter().any(|c| c == "ERR_AUTH_PROFILE_CHANGED"));
    }

    #[test]
    fn secrets_are_sealed_in_memory() {
        let cfg = config().with_signature_secret("sig-key").unwrap();
        let dump = format!("{cfg:?}");
        assert!(!dump.contains("s3cret"));
        assert!(!dump.contains("sig-key"));
        assert_eq!(cfg.client_secret().unwrap(), "s3cret");
        assert_eq!(cfg.signature_secret().unwrap().as_deref(), Some("sig-key"));
    }

    #[test]
    fn chunk_size_is_clamped() {
        assert_eq!(config().with_max_chunk_size(10).max_chunk_size(), MIN_CHUNK_SIZE);
        assert_eq!(
            config().with_max_chunk_size(u64::MAX).max_chunk_size(),
            MAX_CHUNK_SIZE
        );
        assert_eq!(
            config().with_max_chunk_size(4 << 20).max_chunk_size(),
            4 << 20
        );
    }
}
