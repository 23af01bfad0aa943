use std::collections::VecDeque;
use std::time::Duration;

use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, HeaderValue, RANGE};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use crate::scanner::{ErrorScanner, scan_head};
use crate::{ApiError, ApiRequest, Client, Error};

/// `seek(RAW_SEEK_OFFSET, RAW_SEEK_WHENCE)` turns off error classification
/// for the stream: bodies are delivered as-is whatever their status.
pub const RAW_SEEK_OFFSET: i64 = -500;
pub const RAW_SEEK_WHENCE: i32 = -500;

const COPY_BUFFER: usize = 64 * 1024;

/// One GET of a (possibly multi-part) download.
#[derive(Debug, Clone)]
pub struct DownloadPart {
    pub request: ApiRequest,
    /// Byte length, when known; lets seeks skip whole parts.
    pub size: Option<u64>,
}

impl DownloadPart {
    pub fn new(request: ApiRequest, size: Option<u64>) -> Self {
        Self { request, size }
    }
}

/// A sequential reader over one or more download parts.
///
/// Parts are opened lazily; exhausting one opens the next. Holds a transfer
/// slot until closed or dropped.
pub struct Download {
    client: Client,
    username: String,
    parts: VecDeque<DownloadPart>,
    current: Option<reqwest::Response>,
    pending: Vec<u8>,
    pending_pos: usize,
    range_start: Option<u64>,
    raw: bool,
    started: bool,
    position: u64,
    read_timeout: Duration,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("user", &self.username)
            .field("parts_left", &self.parts.len())
            .field("position", &self.position)
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Opens a download over `parts`, waiting for a transfer slot.
    pub async fn download(&self, username: &str, parts: Vec<DownloadPart>) -> Result<Download, Error> {
        let permit = self.inner.transfer_limiter.acquire().await?;
        Ok(Download {
            client: self.clone(),
            username: username.to_string(),
            parts: parts.into(),
            current: None,
            pending: Vec::new(),
            pending_pos: 0,
            range_start: None,
            raw: false,
            started: false,
            position: 0,
            read_timeout: self.config().request_timeout,
            permit: Some(permit),
        })
    }

    /// Downloads an absolute URL. The bearer token is only sent to the
    /// configured server, and only over HTTPS.
    pub async fn web_download(&self, username: &str, url: &str) -> Result<Download, Error> {
        let trusted = reqwest::Url::parse(url)
            .ok()
            .filter(|u| u.scheme() == "https")
            .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(&self.config().server)))
            .unwrap_or(false);
        let mut request = ApiRequest::get(url);
        if !trusted {
            request = request.unauthenticated();
        }
        self.download(username, vec![DownloadPart::new(request, None)]).await
    }
}

/// Start offset of a `Content-Range: bytes <start>-<end>/<total>` header.
fn content_range_start(value: &HeaderValue) -> Option<u64> {
    let text = value.to_str().ok()?;
    let range = text.trim().strip_prefix("bytes")?.trim_start();
    range.split('-').next()?.trim().parse().ok()
}

/// Validates a freshly opened part and reads its first chunk.
async fn open_checked(
    scanner: &dyn ErrorScanner,
    mut resp: reqwest::Response,
    raw: bool,
    range: Option<u64>,
    timeout: Duration,
) -> Result<(reqwest::Response, Vec<u8>), Error> {
    let status = resp.status();
    if let Some(expected) = range {
        let served = resp.headers().get(CONTENT_RANGE).and_then(content_range_start);
        if status.is_success() && served != Some(expected) {
            return Err(Error::Protocol(format!(
                "requested range starting at {expected}, server sent {served:?}"
            )));
        }
    }

    let first = tokio::time::timeout(timeout, resp.chunk())
        .await
        .map_err(|_| Error::Transport("download read timed out".into()))??
        .map(|b| b.to_vec())
        .unwrap_or_default();
    if raw {
        return Ok((resp, first));
    }

    // A successful body is file content unless the server labels it JSON.
    let is_json = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().to_ascii_lowercase().starts_with("application/json"));
    if !status.is_success() || is_json {
        if let Some(err) = scan_head(scanner, &first) {
            return Err(Error::Api(err));
        }
    }
    if !status.is_success() {
        return Err(Error::Api(ApiError::http_status(status.as_u16())));
    }
    Ok((resp, first))
}

impl Download {
    /// Repositions the stream before the first read.
    ///
    /// `(RAW_SEEK_OFFSET, RAW_SEEK_WHENCE)` disables error classification,
    /// `0` is a no-op, and a positive offset from the start (whence 0) skips
    /// parts of known size and requests the rest with a `Range` header.
    pub fn seek(&mut self, offset: i64, whence: i32) -> Result<u64, Error> {
        if offset == RAW_SEEK_OFFSET && whence == RAW_SEEK_WHENCE {
            self.raw = true;
            return Ok(self.position);
        }
        if offset == 0 {
            return Ok(self.position);
        }
        if whence != 0 || offset < 0 {
            return Err(Error::Request(format!(
                "unsupported seek (offset {offset}, whence {whence})"
            )));
        }
        if self.started {
            return Err(Error::Request("cannot seek after reading has begun".into()));
        }

        let target = offset as u64;
        let mut rel = target;
        while let Some(part) = self.parts.front() {
            match part.size {
                Some(size) if rel >= size => {
                    rel -= size;
                    self.parts.pop_front();
                }
                _ => break,
            }
        }
        self.range_start = (rel > 0).then_some(rel);
        self.position = target;
        Ok(self.position)
    }

    /// Turns off error classification for this stream.
    pub fn raw(&mut self) {
        self.raw = true;
    }

    /// Bytes delivered so far, plus any seek offset.
    pub fn position(&self) -> u64 {
        self.position
    }

    async fn open_next(&mut self) -> Result<bool, Error> {
        let Some(part) = self.parts.pop_front() else {
            return Ok(false);
        };
        let range = self.range_start.take();
        let raw = self.raw;
        let timeout = self.read_timeout;
        let scanner = self.client.inner.scanner.as_ref();
        let ctx = self
            .client
            .init_retry(&self.username, &part.request.label());

        let customize = |request: &mut reqwest::Request| {
            // Bodies are bounded per read instead.
            *request.timeout_mut() = None;
            if let Some(start) = range {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes={start}-")) {
                    request.headers_mut().insert(RANGE, value);
                }
            }
        };
        let (resp, first) = self
            .client
            .fulfill_with(&self.username, &part.request, ctx, customize, |resp| {
                open_checked(scanner, resp, raw, range, timeout)
            })
            .await?;

        debug!(user = %self.username, path = %part.request.path, range = ?range, "opened download part");
        self.current = Some(resp);
        self.pending = first;
        self.pending_pos = 0;
        Ok(true)
    }

    /// Reads into `buf`; `Ok(0)` means every part is exhausted.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.started = true;
        loop {
            if self.pending_pos < self.pending.len() {
                let available = &self.pending[self.pending_pos..];
                let n = available.len().min(buf.len());
                buf[..n].copy_from_slice(&available[..n]);
                self.pending_pos += n;
                self.position += n as u64;
                return Ok(n);
            }

            let Some(resp) = self.current.as_mut() else {
                if !self.open_next().await? {
                    return Ok(0);
                }
                continue;
            };

            let next = tokio::time::timeout(self.read_timeout, resp.chunk())
                .await
                .map_err(|_| Error::Transport("download read timed out".into()))??;
            match next {
                Some(bytes) => {
                    self.pending = bytes.to_vec();
                    self.pending_pos = 0;
                }
                None => self.current = None,
            }
        }
    }

    /// Reads everything that is left.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; COPY_BUFFER];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Streams everything that is left into `writer`; returns bytes copied.
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> Result<u64, Error>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut copied = 0u64;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            copied += n as u64;
        }
        writer.flush().await?;
        Ok(copied)
    }

    /// Releases the connection and the transfer slot.
    pub fn close(mut self) {
        self.current = None;
        self.parts.clear();
        self.permit = None;
    }
}
