//! Chunked uploads and ranged downloads.
//!
//! Both hold a transfer slot for their whole lifetime; requests they make
//! go through the transfer limiter, not the call limiter.

mod download;
mod upload;

pub use download::{Download, DownloadPart, RAW_SEEK_OFFSET, RAW_SEEK_WHENCE};
pub use upload::{
    ResumeKey, UPLOADS_TABLE, UploadRecord, UploadSpec, chunk_count, clamp_chunk_size,
};

use serde::{Deserialize, Deserializer};

/// Accepts ids sent either as JSON strings or numbers.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
