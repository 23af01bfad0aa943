//! Authenticated, rate-limited and retrying client for the kiteworks REST API.
//!
//! A [`Client`] owns the configuration, the two rate limiters (calls and
//! transfers), the token store and the transport. [`Session`]s bind it to an
//! acting user and expose the request surface tasks use: [`Session::call`],
//! paginated [`Session::data_call`] / [`Session::page_call`], chunked
//! [`Session::upload`] and ranged [`Session::download`].

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod group;
pub mod limiter;
pub mod paging;
pub mod request;
pub mod retry;
pub mod scanner;
pub mod session;
pub mod transfer;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use auth::{PasswordGrant, SignatureGrant, TokenSource};
pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use error::{ApiError, Error, ErrorEntry};
pub use group::LimitGroup;
pub use limiter::RateLimiter;
pub use request::{ApiRequest, MultipartBody, Param};
pub use retry::{Classification, RetryContext};
pub use scanner::{ErrorScanner, OAuthErrorScanner};
pub use session::Session;
pub use transfer::{Download, DownloadPart, ResumeKey, UploadRecord, UploadSpec};
pub use transport::{HttpTransport, Transport};

pub use kitebroker_store as store;
