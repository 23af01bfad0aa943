use std::io::SeekFrom;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tracing::{debug, info};

use crate::config::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::request::MultipartBody;
use crate::{ApiRequest, Client, Error};

/// Table mapping [`ResumeKey`]s to server upload ids.
pub const UPLOADS_TABLE: &str = "uploads";

/// Identity of one upload for resume purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeKey {
    pub dest: String,
    pub filename: String,
    pub size: u64,
    /// Source modification time, unix seconds.
    pub mtime: i64,
}

impl ResumeKey {
    /// Table key; JSON keeps the fields apart whatever they contain.
    pub fn to_key(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What is being uploaded, and where.
#[derive(Debug, Clone)]
pub struct UploadSpec {
    /// Destination id (folder, or file for a new version).
    pub dest: String,
    pub filename: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl UploadSpec {
    pub fn resume_key(&self) -> ResumeKey {
        ResumeKey {
            dest: self.dest.clone(),
            filename: self.filename.clone(),
            size: self.size,
            mtime: self.modified.timestamp(),
        }
    }
}

/// Server-side upload session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    #[serde(deserialize_with = "super::string_or_number")]
    pub id: String,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_chunks: u64,
    #[serde(default)]
    pub uploaded_chunks: u64,
    #[serde(default)]
    pub uploaded_size: u64,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub uri: String,
}

impl UploadRecord {
    /// Where chunks are posted.
    pub fn chunk_path(&self) -> String {
        if self.uri.is_empty() {
            format!("/rest/uploads/{}", self.id)
        } else if self.uri.starts_with('/') || self.uri.starts_with("http") {
            self.uri.clone()
        } else {
            format!("/{}", self.uri)
        }
    }
}

pub fn clamp_chunk_size(size: u64) -> u64 {
    size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// `max(1, ceil(size / chunk_size))`.
pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size.max(1)).max(1)
}

/// Reads a source in fixed-size chunks, starting at a chunk boundary.
struct ChunkReader<'a, R> {
    source: &'a mut R,
    chunk_size: u64,
    size: u64,
    offset: u64,
}

impl<'a, R> ChunkReader<'a, R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    async fn new(source: &'a mut R, chunk_size: u64, size: u64, first_chunk: u64) -> Result<Self, Error> {
        let offset = first_chunk.saturating_mul(chunk_size).min(size);
        source.seek(SeekFrom::Start(offset)).await?;
        Ok(Self {
            source,
            chunk_size,
            size,
            offset,
        })
    }

    /// Reads the next chunk; empty once the source is exhausted.
    async fn next_chunk(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.chunk_size.min(self.size - self.offset);
        let mut buf = vec![0u8; len as usize];
        self.source.read_exact(&mut buf).await?;
        self.offset += len;
        Ok(buf)
    }
}

impl Client {
    /// Uploads `source` in chunks, resuming a previous session when asked.
    ///
    /// `initiate` is the destination-specific request that opens the upload
    /// session; the file description is merged into its JSON body. The
    /// response to the last chunk (the created entity) is decoded into `T`.
    /// On failure the resume record is kept so a later call can continue.
    pub async fn upload<T, R>(
        &self,
        username: &str,
        initiate: &ApiRequest,
        spec: &UploadSpec,
        source: &mut R,
        resume: bool,
    ) -> Result<T, Error>
    where
        T: DeserializeOwned,
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let _permit = self.inner.transfer_limiter.acquire().await?;

        let chunk_size = clamp_chunk_size(self.config().max_chunk_size());
        let total_chunks = chunk_count(spec.size, chunk_size);
        let table = self.table(UPLOADS_TABLE);
        let key = spec.resume_key().to_key()?;

        let mut record = None;
        if let Some(id) = table.get::<String>(&key)? {
            let session_path = format!("/rest/uploads/{id}");
            if resume {
                match self.call::<UploadRecord>(username, &ApiRequest::get(session_path)).await {
                    Ok(found)
                        if !found.finished
                            && found.total_chunks == total_chunks
                            && found.uploaded_chunks < total_chunks =>
                    {
                        record = Some(found);
                    }
                    Ok(_) => debug!(user = username, upload = %id, "stale upload session"),
                    Err(err) => debug!(user = username, upload = %id, error = %err, "upload session lookup failed"),
                }
            } else if let Err(err) = self
                .call::<Value>(username, &ApiRequest::delete(session_path))
                .await
            {
                debug!(user = username, upload = %id, error = %err, "could not delete old upload session");
            }
            if record.is_none() {
                table.unset(&key)?;
            }
        }

        let record = match record {
            Some(found) => {
                info!(
                    user = username,
                    file = %spec.filename,
                    upload = %found.id,
                    done = found.uploaded_chunks,
                    total = total_chunks,
                    "resuming upload"
                );
                found
            }
            None => {
                let req = initiate.clone().json(json!({
                    "filename": spec.filename,
                    "totalSize": spec.size,
                    "totalChunks": total_chunks,
                    "clientModified": spec.modified.to_rfc3339(),
                }));
                let created: UploadRecord = self.call(username, &req).await?;
                table.set(&key, &created.id)?;
                created
            }
        };

        let chunk_path = record.chunk_path();
        let mut reader = ChunkReader::new(source, chunk_size, spec.size, record.uploaded_chunks).await?;
        let mut index = record.uploaded_chunks;
        loop {
            let data = reader.next_chunk().await?;
            let len = data.len();
            let body = MultipartBody::new("content", spec.filename.clone(), data)
                .field("compressMode", "NORMAL")
                .field("compressionSize", len)
                .field("originalSize", len)
                .field("index", index + 1);
            let req = ApiRequest::post(chunk_path.clone()).multipart(body);
            index += 1;

            if index >= total_chunks {
                let req = req.query([("returnEntity", "true"), ("mode", "full")]);
                let entity: T = self.fulfill(username, &req).await?;
                table.unset(&key)?;
                info!(user = username, file = %spec.filename, chunks = total_chunks, "upload complete");
                return Ok(entity);
            }

            let _: Value = self.fulfill(username, &req).await?;
            debug!(user = username, upload = %record.id, chunk = index, total = total_chunks, "chunk sent");
        }
    }
}
