//! The seam between the client and the network.

use std::future::Future;
use std::pin::Pin;

use crate::{ClientConfig, Error};

/// Future returned by [`Transport::execute`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<reqwest::Response, Error>> + Send + 'a>>;

/// Sends fully-built requests.
///
/// The production implementation is [`HttpTransport`]; tests substitute
/// counting or scripted mocks.
pub trait Transport: Send + Sync {
    fn execute(&self, request: reqwest::Request) -> TransportFuture<'_>;
}

/// Builds the shared reqwest client from connection settings.
pub fn build_http_client(config: &ClientConfig) -> Result<reqwest::Client, Error> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .user_agent(config.user_agent.clone())
        .danger_accept_invalid_certs(!config.verify_ssl);
    builder = match &config.proxy {
        Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy.as_str())?),
        // Only the configured proxy is used, never the environment's.
        None => builder.no_proxy(),
    };
    Ok(builder.build()?)
}

/// Transport backed by a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    fn execute(&self, request: reqwest::Request) -> TransportFuture<'_> {
        Box::pin(async move { Ok(self.client.execute(request).await?) })
    }
}
