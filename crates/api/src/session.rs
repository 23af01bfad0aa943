//! A client bound to one acting user.

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::transfer::{Download, DownloadPart, UploadSpec};
use crate::{ApiRequest, Client, Error, RetryContext};

/// Stamps every request with a username; shares everything else with its
/// [`Client`].
#[derive(Debug, Clone)]
pub struct Session {
    username: String,
    client: Client,
}

impl Session {
    pub fn new(username: String, client: Client) -> Self {
        Self { username, client }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Same client, different user.
    pub fn with_user(&self, username: impl Into<String>) -> Session {
        self.client.session(username)
    }

    pub async fn call<T: DeserializeOwned>(&self, req: ApiRequest) -> Result<T, Error> {
        self.client.call(&self.username, &req).await
    }

    pub async fn data_call<T: DeserializeOwned>(&self, req: ApiRequest, offset: i64, limit: i64) -> Result<T, Error> {
        self.client.data_call(&self.username, &req, offset, limit).await
    }

    pub async fn page_call<T: DeserializeOwned>(&self, req: ApiRequest, offset: i64, limit: i64) -> Result<T, Error> {
        self.client.page_call(&self.username, &req, offset, limit).await
    }

    pub async fn upload<T, R>(
        &self,
        initiate: ApiRequest,
        spec: &UploadSpec,
        source: &mut R,
        resume: bool,
    ) -> Result<T, Error>
    where
        T: DeserializeOwned,
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        self.client
            .upload(&self.username, &initiate, spec, source, resume)
            .await
    }

    pub async fn download(&self, parts: Vec<DownloadPart>) -> Result<Download, Error> {
        self.client.download(&self.username, parts).await
    }

    pub async fn web_download(&self, url: &str) -> Result<Download, Error> {
        self.client.web_download(&self.username, url).await
    }

    pub fn init_retry(&self, task: &str) -> RetryContext {
        self.client.init_retry(&self.username, task)
    }

    /// Ensures a usable credential exists, fetching one if needed.
    pub async fn login(&self) -> Result<(), Error> {
        self.client.access_token(&self.username).await.map(|_| ())
    }

    pub async fn logout(&self) -> Result<(), Error> {
        self.client.logout(&self.username).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value, json};

    use super::*;
    use crate::testing::{self, MockTransport, Reply, USER};

    #[tokio::test]
    async fn sessions_act_as_their_user() {
        let mock = MockTransport::new(|req| {
            Ok(Reply::json(200, json!({"auth": req.header("authorization")})))
        });
        let client = testing::client(Arc::clone(&mock));
        let alice = client.session(USER);
        assert_eq!(alice.username(), USER);

        let out: Value = alice.call(ApiRequest::get("/rest/users/me")).await.unwrap();
        assert_eq!(out["auth"], "Bearer valid-token");

        // No credential and no grant flow for bob.
        let bob = alice.with_user("bob");
        assert!(matches!(
            bob.call::<Value>(ApiRequest::get("/rest/users/me")).await,
            Err(Error::NoCredential(_))
        ));
    }

    #[tokio::test]
    async fn manual_retry_loop() {
        let mock = MockTransport::new(|_| Ok(Reply::empty(200)));
        let client = testing::client(mock);
        let session = client.session(USER);

        let mut ctx = session.init_retry("custom");
        assert_eq!(ctx.username(), USER);
        assert_eq!(ctx.task(), "custom");
        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome: Result<Value, Error> = session.call(ApiRequest::get("/rest/users/me")).await;
            if !ctx.check_for_retry(&outcome).await {
                break;
            }
        }
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn login_and_logout() {
        let mock = MockTransport::new(|_| Ok(Reply::empty(200)));
        let client = testing::client(mock);
        let session = client.session(USER);
        session.login().await.unwrap();
        session.logout().await.unwrap();
        assert!(matches!(session.login().await, Err(Error::NoCredential(_))));
    }
}
