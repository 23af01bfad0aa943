//! The shared API client: limiters, credentials and the fulfil loop.

use std::future::Future;
use std::sync::Arc;

use kitebroker_store::{Database, DatabaseTokenStore, JsonDatabase, Table, TokenStore};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue, REFERER, USER_AGENT};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::auth::TokenSource;
use crate::limiter::RateLimiter;
use crate::request::{Prepared, PreparedBody, assemble};
use crate::scanner::{ErrorScanner, OAuthErrorScanner, scan_head};
use crate::transport::{HttpTransport, Transport, build_http_client};
use crate::{ApiError, ApiRequest, ClientConfig, Error, RetryContext, Session};

/// Header carrying the API version on every request.
pub const VERSION_HEADER: &str = "X-Accellion-Version";

/// Table holding credentials when no token store is supplied.
pub const TOKENS_TABLE: &str = "tokens";

pub(crate) struct Inner {
    pub(crate) config: ClientConfig,
    http: reqwest::Client,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) call_limiter: RateLimiter,
    pub(crate) transfer_limiter: RateLimiter,
    pub(crate) tokens: Arc<dyn TokenStore>,
    db: Arc<dyn Database>,
    pub(crate) auth_lock: tokio::sync::Mutex<()>,
    pub(crate) token_source: Option<Arc<dyn TokenSource>>,
    pub(crate) scanner: Arc<dyn ErrorScanner>,
}

/// Handle to one configured API endpoint.
///
/// Cheap to clone; every clone shares the limiters, the token store and the
/// refresh lock.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.inner.config.server)
            .field("call_limit", &self.inner.call_limiter.limit())
            .field("transfer_limit", &self.inner.transfer_limiter.limit())
            .finish_non_exhaustive()
    }
}

/// Assembles a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    tokens: Option<Arc<dyn TokenStore>>,
    db: Option<Arc<dyn Database>>,
    token_source: Option<Arc<dyn TokenSource>>,
    scanner: Option<Arc<dyn ErrorScanner>>,
    call_limit: i64,
    transfer_limit: i64,
}

impl ClientBuilder {
    /// Replaces the HTTP transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn token_store(mut self, tokens: Arc<dyn TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Database for resume records (and credentials, when no token store is set).
    pub fn database(mut self, db: Arc<dyn Database>) -> Self {
        self.db = Some(db);
        self
    }

    /// Grant flow used when a user has no usable credential.
    pub fn token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    pub fn error_scanner(mut self, scanner: Arc<dyn ErrorScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn call_limit(mut self, n: i64) -> Self {
        self.call_limit = n;
        self
    }

    pub fn transfer_limit(mut self, n: i64) -> Self {
        self.transfer_limit = n;
        self
    }

    pub fn build(self) -> Result<Client, Error> {
        let http = build_http_client(&self.config)?;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new(http.clone())) as Arc<dyn Transport>);
        let db = self
            .db
            .unwrap_or_else(|| Arc::new(JsonDatabase::in_memory()) as Arc<dyn Database>);
        let tokens = self.tokens.unwrap_or_else(|| {
            let table = Table::new(Arc::clone(&db), TOKENS_TABLE);
            Arc::new(DatabaseTokenStore::new(table)) as Arc<dyn TokenStore>
        });

        let call_limiter = RateLimiter::new();
        call_limiter.set_limit(self.call_limit);
        let transfer_limiter = RateLimiter::new();
        transfer_limiter.set_limit(self.transfer_limit);

        Ok(Client {
            inner: Arc::new(Inner {
                config: self.config,
                http,
                transport,
                call_limiter,
                transfer_limiter,
                tokens,
                db,
                auth_lock: tokio::sync::Mutex::new(()),
                token_source: self.token_source,
                scanner: self
                    .scanner
                    .unwrap_or_else(|| Arc::new(OAuthErrorScanner) as Arc<dyn ErrorScanner>),
            }),
        })
    }
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            transport: None,
            tokens: None,
            db: None,
            token_source: None,
            scanner: None,
            call_limit: 1,
            transfer_limit: 1,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Binds this client to a user.
    pub fn session(&self, username: impl Into<String>) -> Session {
        Session::new(username.into(), self.clone())
    }

    /// Sizes the call limiter; no effect once a call has been made.
    pub fn set_limit(&self, n: i64) {
        self.inner.call_limiter.set_limit(n);
    }

    /// Sizes the transfer limiter; no effect once a transfer has started.
    pub fn set_transfer_limit(&self, n: i64) {
        self.inner.transfer_limiter.set_limit(n);
    }

    pub fn call_limiter(&self) -> &RateLimiter {
        &self.inner.call_limiter
    }

    pub fn transfer_limiter(&self) -> &RateLimiter {
        &self.inner.transfer_limiter
    }

    pub fn token_store(&self) -> &Arc<dyn TokenStore> {
        &self.inner.tokens
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.inner.db
    }

    /// Handle to one table of the client database.
    pub fn table(&self, name: &str) -> Table {
        Table::new(Arc::clone(&self.inner.db), name)
    }

    /// Starts the retry bookkeeping for one logical operation.
    pub fn init_retry(&self, username: &str, task: &str) -> RetryContext {
        RetryContext::new(&self.inner.config, username, task)
    }

    /// Full URL for `path`; absolute URLs pass through unchanged. Plain
    /// `http://` URLs are refused for authenticated requests.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            return path.to_string();
        }
        let sep = if path.starts_with('/') { "" } else { "/" };
        format!("https://{}{sep}{path}", self.inner.config.server)
    }

    /// Sends `req` while holding a call slot, then decodes the JSON reply.
    pub async fn call<T: DeserializeOwned>(&self, username: &str, req: &ApiRequest) -> Result<T, Error> {
        let _permit = self.inner.call_limiter.acquire().await?;
        self.fulfill(username, req).await
    }

    /// Sends `req` without taking a call slot, retrying as configured.
    pub(crate) async fn fulfill<T: DeserializeOwned>(&self, username: &str, req: &ApiRequest) -> Result<T, Error> {
        let ctx = self.init_retry(username, &req.label());
        self.fulfill_with(username, req, ctx, |_| {}, |resp| {
            read_json::<T>(self.inner.scanner.as_ref(), resp)
        })
        .await
    }

    /// The retry loop under every request.
    ///
    /// Each attempt rebuilds the request from the assembled parameters, lets
    /// `customize` adjust it, attaches a bearer token unless the request is
    /// unauthenticated, sends it and hands the response to `handle`. When the
    /// retry context flags a token error the credential that was rejected is
    /// expired before the next attempt.
    pub(crate) async fn fulfill_with<T, C, H, Fut>(
        &self,
        username: &str,
        req: &ApiRequest,
        ctx: RetryContext,
        customize: C,
        handle: H,
    ) -> Result<T, Error>
    where
        C: Fn(&mut reqwest::Request),
        H: Fn(reqwest::Response) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let prepared = assemble(&req.params)?;
        let mut ctx = ctx.with_extra_codes(req.retry_codes.as_slice());
        if req.unauthenticated {
            ctx = ctx.without_token_errors();
        }

        loop {
            let mut request = self.build_request(req, &prepared)?;
            customize(&mut request);
            let used = if req.unauthenticated {
                None
            } else {
                Some(self.set_token(username, &mut request).await?)
            };

            let outcome = match self.inner.transport.execute(request).await {
                Ok(resp) => handle(resp).await,
                Err(err) => Err(err),
            };

            if !ctx.check_for_retry(&outcome).await {
                return outcome;
            }
            if ctx.token_error() {
                if let Some(used) = used.as_deref() {
                    self.expire_token(username, used).await?;
                }
            }
            debug!(
                id = %ctx.id(),
                user = username,
                path = %req.path,
                attempt = ctx.attempt(),
                "retrying request"
            );
        }
    }

    pub(crate) fn build_request(&self, req: &ApiRequest, prepared: &Prepared) -> Result<reqwest::Request, Error> {
        let config = &self.inner.config;
        if !req.unauthenticated && is_plain_http(&req.path) {
            return Err(Error::Request(format!(
                "refusing to send credentials over plain HTTP: {}",
                req.path
            )));
        }
        let version = req.version.as_deref().unwrap_or(&config.api_version);

        let mut builder = self
            .inner
            .http
            .request(req.method.clone(), self.url_for(&req.path))
            .header(USER_AGENT, config.user_agent.as_str())
            .header(REFERER, format!("https://{}/", config.server))
            .header(VERSION_HEADER, version)
            .header(ACCEPT, "application/json")
            .timeout(config.request_timeout);

        if !prepared.query.is_empty() {
            builder = builder.query(&prepared.query);
        }
        builder = match &prepared.body {
            Some(PreparedBody::Json(bytes)) => builder
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(bytes.clone()),
            Some(PreparedBody::Form(pairs)) => builder.form(pairs),
            Some(PreparedBody::Multipart(body)) => builder.multipart(body.to_form()?),
            None => builder,
        };
        Ok(builder.build()?)
    }
}

fn is_plain_http(path: &str) -> bool {
    path.get(..7).is_some_and(|scheme| scheme.eq_ignore_ascii_case("http://"))
}

/// Checks a fully-read body for structured errors and the status code.
fn check_body(scanner: &dyn ErrorScanner, status: reqwest::StatusCode, body: &[u8]) -> Result<(), Error> {
    if let Some(err) = scan_head(scanner, body) {
        return Err(Error::Api(err));
    }
    if !status.is_success() {
        return Err(Error::Api(ApiError::http_status(status.as_u16())));
    }
    Ok(())
}

/// Reads the whole body, scans it and decodes it as JSON.
async fn read_json<T: DeserializeOwned>(scanner: &dyn ErrorScanner, resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status();
    let body = resp.bytes().await?;
    check_body(scanner, status, &body)?;
    decode(&body)
}

/// Decodes a JSON body; an empty body decodes as `null`.
pub(crate) fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::from_value(Value::Null)?);
    }
    Ok(serde_json::from_slice(body)?)
}
