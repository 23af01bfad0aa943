use kitebroker_api::{ApiError, ErrorScanner, OAuthErrorScanner};
use serde::Deserialize;

/// Recognises the kiteworks error envelopes.
///
/// - `{"errors": [{"code": .., "message"|"msg": ..}, ..]}`
/// - `{"code": .., "message": ..}`
/// - OAuth `{"error": .., "error_description": ..}`
#[derive(Debug, Default, Clone, Copy)]
pub struct KiteworksErrorScanner;

#[derive(Deserialize)]
struct Entry {
    code: String,
    #[serde(default, alias = "msg")]
    message: String,
}

#[derive(Deserialize)]
struct ErrorList {
    errors: Vec<Entry>,
}

#[derive(Deserialize)]
struct Single {
    code: String,
    message: String,
}

impl ErrorScanner for KiteworksErrorScanner {
    fn scan(&self, body: &[u8]) -> Option<ApiError> {
        if let Ok(list) = serde_json::from_slice::<ErrorList>(body) {
            let mut err = ApiError::new();
            for entry in list.errors {
                err.register(entry.code, entry.message);
            }
            return Some(err);
        }
        if let Ok(single) = serde_json::from_slice::<Single>(body) {
            return Some(ApiError::single(single.code, single.message));
        }
        OAuthErrorScanner.scan(body)
    }
}
