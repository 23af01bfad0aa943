//! Scripted transport and client fixtures for tests.
//!
//! Built for this crate's unit tests; enable the `testing` feature to use it
//! from another crate's tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http_body_util::BodyExt;
use kitebroker_store::{Credential, MemoryTokenStore, TokenStore};
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};
use serde_json::Value;

use crate::transport::{Transport, TransportFuture};
use crate::{Client, ClientBuilder, ClientConfig, Error};

/// A request as the mock transport saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn query(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Value of a field in a urlencoded body.
    pub fn form(&self, name: &str) -> Option<String> {
        let url = Url::parse(&format!("http://form.invalid/?{}", self.body_text())).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Value of a text field in a multipart body.
    pub fn multipart_field(&self, name: &str) -> Option<String> {
        let body = self.body_text();
        let marker = format!("name=\"{name}\"\r\n\r\n");
        let start = body.find(&marker)? + marker.len();
        let end = body[start..].find("\r\n")?;
        Some(body[start..start + end].to_string())
    }
}

/// A scripted response.
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn json(status: u16, value: Value) -> Self {
        Self::bytes(status, serde_json::to_vec(&value).unwrap()).header("content-type", "application/json")
    }

    pub fn bytes(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self::bytes(status, Vec::new())
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

type Handler = Box<dyn Fn(&Recorded) -> Result<Reply, Error> + Send + Sync>;

/// Records every request and answers from a handler.
pub struct MockTransport {
    handler: Handler,
    delay: Duration,
    requests: Mutex<Vec<Recorded>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&Recorded) -> Result<Reply, Error> + Send + Sync + 'static,
    {
        Self::with_delay(Duration::ZERO, handler)
    }

    /// Holds each request for `delay` before answering.
    pub fn with_delay<F>(delay: Duration, handler: F) -> Arc<Self>
    where
        F: Fn(&Recorded) -> Result<Reply, Error> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            delay,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Requests whose path equals `path`.
    pub fn count_path(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path() == path)
            .count()
    }

    /// Highest number of requests in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn execute(&self, mut request: reqwest::Request) -> TransportFuture<'_> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let body = match request.body_mut().take() {
                Some(body) => {
                    let buffered = body.as_bytes().map(<[u8]>::to_vec);
                    match buffered {
                        Some(bytes) => bytes,
                        None => body
                            .collect()
                            .await
                            .map_err(|e| Error::Transport(e.to_string()))?
                            .to_bytes()
                            .to_vec(),
                    }
                }
                None => Vec::new(),
            };
            let recorded = Recorded {
                method: request.method().clone(),
                url: request.url().clone(),
                headers: request.headers().clone(),
                body,
            };

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let reply = (self.handler)(&recorded);
            self.requests.lock().unwrap().push(recorded);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let reply = reply?;

            let mut builder = http::Response::builder().status(reply.status);
            for (name, value) in &reply.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            Ok(reqwest::Response::from(builder.body(reply.body).unwrap()))
        })
    }
}

pub const USER: &str = "alice";

pub fn config() -> ClientConfig {
    ClientConfig::new("kw.example.com", "app-id", "app-secret").unwrap()
}

/// Token store holding a valid credential for [`USER`].
pub fn tokens() -> Arc<MemoryTokenStore> {
    let store = Arc::new(MemoryTokenStore::new());
    store
        .save(USER, &Credential::new("valid-token".into(), Some("refresh-1".into()), 3600))
        .unwrap();
    store
}

/// Client over `transport` with a valid token for [`USER`].
pub fn client(transport: Arc<MockTransport>) -> Client {
    client_with(config(), transport)
}

pub fn client_with(config: ClientConfig, transport: Arc<MockTransport>) -> Client {
    builder(config, transport).build().unwrap()
}

/// Builder over `transport` with a valid token for [`USER`], left open for
/// further settings.
pub fn builder(config: ClientConfig, transport: Arc<MockTransport>) -> ClientBuilder {
    Client::builder(config)
        .transport(transport)
        .token_store(tokens())
}
