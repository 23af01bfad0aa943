//! Detection of structured errors inside response bodies.

use serde::Deserialize;

use crate::ApiError;

/// Bytes of each body handed to the scanner.
pub const SCAN_LIMIT: usize = 64 * 1024;

/// Maps a vendor error envelope to an [`ApiError`].
///
/// Runs on 2xx and non-2xx bodies alike; some errors arrive with a success
/// status. Returning `None` (or an empty error) means "no structured error".
pub trait ErrorScanner: Send + Sync {
    fn scan(&self, body: &[u8]) -> Option<ApiError>;
}

impl<F> ErrorScanner for F
where
    F: Fn(&[u8]) -> Option<ApiError> + Send + Sync,
{
    fn scan(&self, body: &[u8]) -> Option<ApiError> {
        self(body)
    }
}

/// Recognises the OAuth2 `{"error", "error_description"}` envelope only.
#[derive(Debug, Default, Clone, Copy)]
pub struct OAuthErrorScanner;

#[derive(Deserialize)]
struct OAuthEnvelope {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl ErrorScanner for OAuthErrorScanner {
    fn scan(&self, body: &[u8]) -> Option<ApiError> {
        let envelope: OAuthEnvelope = serde_json::from_slice(body).ok()?;
        Some(ApiError::single(
            envelope.error,
            envelope.error_description.unwrap_or_default(),
        ))
    }
}

/// Scans at most [`SCAN_LIMIT`] bytes, discarding empty results.
pub(crate) fn scan_head(scanner: &dyn ErrorScanner, body: &[u8]) -> Option<ApiError> {
    let head = &body[..body.len().min(SCAN_LIMIT)];
    scanner.scan(head).filter(|err| !err.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_envelope() {
        let body = br#"{"error":"invalid_grant","error_description":"expired"}"#;
        let err = OAuthErrorScanner.scan(body).unwrap();
        assert!(err.has_code("INVALID_GRANT"));
        assert_eq!(err.to_string(), "invalid_grant: expired");
    }

    #[test]
    fn ordinary_bodies_are_clean() {
        assert!(OAuthErrorScanner.scan(br#"{"id":"1"}"#).is_none());
        assert!(OAuthErrorScanner.scan(b"not json").is_none());
        assert!(OAuthErrorScanner.scan(b"").is_none());
    }

    #[test]
    fn closures_are_scanners() {
        let scanner = |body: &[u8]| {
            body.starts_with(b"ERR").then(|| ApiError::single("ERR_CUSTOM", ""))
        };
        assert!(scan_head(&scanner, b"ERR!").is_some());
        assert!(scan_head(&scanner, b"fine").is_none());
    }

    #[test]
    fn empty_errors_are_discarded() {
        let scanner = |_: &[u8]| Some(ApiError::new());
        assert!(scan_head(&scanner, b"{}").is_none());
    }

    #[test]
    fn only_the_head_is_scanned() {
        let scanner = |body: &[u8]| {
            assert!(body.len() <= SCAN_LIMIT);
            None
        };
        let big = vec![b' '; SCAN_LIMIT * 2];
        assert!(scan_head(&scanner, &big).is_none());
    }
}
