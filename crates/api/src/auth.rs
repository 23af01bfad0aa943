//! Credential acquisition and renewal.
//!
//! All credential changes for a client happen under one async mutex, so a
//! burst of callers holding the same expired token produces a single token
//! request; the rest observe the credential the first caller saved.

use std::future::Future;
use std::pin::Pin;

use hmac::{Hmac, Mac};
use kitebroker_store::Credential;
use rand::Rng;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::Deserialize;
use sha1::Sha1;
use tracing::{debug, info, warn};

use crate::{ApiRequest, Client, Error};

/// Delimiter between the fields of a signature grant code.
pub const SIGNATURE_DELIMITER: &str = "|@@|";

/// Future returned by [`TokenSource::new_token`].
pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<Credential, Error>> + Send + 'a>>;

/// A grant flow that produces brand-new credentials.
pub trait TokenSource: Send + Sync {
    fn new_token<'a>(&'a self, client: &'a Client, username: &'a str) -> TokenFuture<'a>;

    /// True when new tokens can be obtained without an operator. Only such
    /// sources are consulted after a refresh has failed.
    fn unattended(&self) -> bool {
        false
    }
}

/// OAuth2 token endpoint reply.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

/// Resource-owner password grant; the password is supplied once by an operator.
pub struct PasswordGrant {
    password: String,
}

impl PasswordGrant {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for PasswordGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordGrant { .. }")
    }
}

impl TokenSource for PasswordGrant {
    fn new_token<'a>(&'a self, client: &'a Client, username: &'a str) -> TokenFuture<'a> {
        Box::pin(async move {
            let form = client.grant_form("password", [
                ("username", username.to_string()),
                ("password", self.password.clone()),
            ])?;
            client.request_token(username, form).await
        })
    }
}

/// Signed `authorization_code` grant built from the configured signature
/// secret; needs no operator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureGrant;

impl TokenSource for SignatureGrant {
    fn new_token<'a>(&'a self, client: &'a Client, username: &'a str) -> TokenFuture<'a> {
        Box::pin(async move {
            let config = client.config();
            let secret = config
                .signature_secret()?
                .ok_or_else(|| Error::Request("no signature secret configured".into()))?;
            let timestamp = chrono::Utc::now().timestamp();
            let nonce: u32 = rand::thread_rng().gen_range(1..=999_999);
            let code = signature_code(&config.application_id, username, &secret, timestamp, nonce)?;
            let form = client.grant_form("authorization_code", [("code", code)])?;
            client.request_token(username, form).await
        })
    }

    fn unattended(&self) -> bool {
        true
    }
}

/// Builds `client_id|@@|user|@@|timestamp|@@|nonce|@@|signature`, the
/// signature being hex HMAC-SHA1 over the first four fields.
pub fn signature_code(
    client_id: &str,
    username: &str,
    secret: &str,
    timestamp: i64,
    nonce: u32,
) -> Result<String, Error> {
    let d = SIGNATURE_DELIMITER;
    let base = format!("{client_id}{d}{username}{d}{timestamp}{d}{nonce}");
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Request(format!("invalid signature secret: {e}")))?;
    mac.update(base.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    Ok(format!("{base}{d}{signature}"))
}

impl Client {
    /// Attaches `Authorization: Bearer` for `username`, renewing the
    /// credential first when needed. Returns the access token attached.
    pub async fn set_token(&self, username: &str, request: &mut reqwest::Request) -> Result<String, Error> {
        let access = self.access_token(username).await?;
        let value = HeaderValue::from_str(&format!("Bearer {access}"))
            .map_err(|e| Error::Request(format!("access token is not a valid header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(access)
    }

    /// Returns a usable access token for `username`.
    ///
    /// An expired credential is refreshed. When the refresh fails and no
    /// unattended grant is configured the credential is deleted and the
    /// operator must sign in again; otherwise a brand-new token is fetched.
    pub async fn access_token(&self, username: &str) -> Result<String, Error> {
        let _guard = self.inner.auth_lock.lock().await;

        let credential = match self.inner.tokens.load(username)? {
            Some(cred) if !cred.is_expired() => return Ok(cred.access_token),
            Some(cred) => match self.refresh(username, &cred).await {
                Ok(fresh) => fresh,
                Err(err) => {
                    let unattended = self
                        .inner
                        .token_source
                        .as_ref()
                        .is_some_and(|s| s.unattended());
                    if !unattended {
                        warn!(user = username, error = %err, "token refresh failed");
                        self.inner.tokens.delete(username)?;
                        return Err(Error::Reauthenticate(username.to_string()));
                    }
                    debug!(user = username, error = %err, "refresh failed, requesting new token");
                    self.new_token(username).await?
                }
            },
            None => self.new_token(username).await?,
        };

        self.inner.tokens.save(username, &credential)?;
        Ok(credential.access_token)
    }

    /// Marks the stored credential expired if it is still `rejected`.
    pub(crate) async fn expire_token(&self, username: &str, rejected: &str) -> Result<(), Error> {
        let _guard = self.inner.auth_lock.lock().await;
        if let Some(mut cred) = self.inner.tokens.load(username)? {
            if cred.access_token == rejected {
                debug!(user = username, "expiring rejected token");
                cred.expire();
                self.inner.tokens.save(username, &cred)?;
            }
        }
        Ok(())
    }

    /// Forgets the stored credential for `username`.
    pub async fn logout(&self, username: &str) -> Result<(), Error> {
        let _guard = self.inner.auth_lock.lock().await;
        self.inner.tokens.delete(username)?;
        info!(user = username, "signed out");
        Ok(())
    }

    async fn new_token(&self, username: &str) -> Result<Credential, Error> {
        let source = self
            .inner
            .token_source
            .as_ref()
            .ok_or_else(|| Error::NoCredential(username.to_string()))?;
        let credential = source.new_token(self, username).await?;
        info!(user = username, "obtained new token");
        Ok(credential)
    }

    async fn refresh(&self, username: &str, current: &Credential) -> Result<Credential, Error> {
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| Error::Reauthenticate(username.to_string()))?;
        let form = self.grant_form("refresh_token", [("refresh_token", refresh_token.clone())])?;
        let mut fresh = self.request_token(username, form).await?;
        if fresh.refresh_token.is_none() {
            fresh.refresh_token = Some(refresh_token);
        }
        debug!(user = username, "refreshed token");
        Ok(fresh)
    }

    /// Common OAuth2 fields plus the grant-specific ones.
    pub(crate) fn grant_form<const N: usize>(
        &self,
        grant_type: &str,
        extra: [(&str, String); N],
    ) -> Result<Vec<(String, String)>, Error> {
        let config = self.config();
        let mut form = vec![
            ("grant_type".to_string(), grant_type.to_string()),
            ("client_id".to_string(), config.application_id.clone()),
            ("client_secret".to_string(), config.client_secret()?),
            ("redirect_uri".to_string(), config.redirect_uri.clone()),
            ("scope".to_string(), config.scope.clone()),
        ];
        form.extend(extra.into_iter().map(|(k, v)| (k.to_string(), v)));
        Ok(form)
    }

    /// Posts a grant to the token endpoint.
    ///
    /// Sent unauthenticated and outside the call limiter: the caller may
    /// already hold a call slot.
    pub(crate) fn request_token<'a>(&'a self, username: &'a str, form: Vec<(String, String)>) -> TokenFuture<'a> {
        // Boxed: token requests run inside the fulfil loop that asked for them.
        Box::pin(async move {
            let req = ApiRequest::post(self.config().token_path.clone())
                .form(form)
                .unauthenticated();
            let reply: TokenResponse = self.fulfill(username, &req).await?;
            Ok(Credential::new(
                reply.access_token,
                reply.refresh_token,
                reply.expires_in,
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use kitebroker_store::{MemoryTokenStore, TokenStore};
    use serde_json::{Value, json};

    use super::*;
    use crate::testing::{self, MockTransport, Recorded, Reply, USER};

    fn expired_store() -> Arc<MemoryTokenStore> {
        let store = Arc::new(MemoryTokenStore::new());
        let mut cred = Credential::new("stale".into(), Some("refresh-1".into()), 3600);
        cred.expire();
        store.save(USER, &cred).unwrap();
        store
    }

    /// Token endpoint issuing `fresh-N`; API calls echo the bearer token.
    fn server(issued: Arc<AtomicUsize>) -> impl Fn(&Recorded) -> Result<Reply, Error> + Send + Sync + 'static {
        move |req: &Recorded| {
            if req.path() == "/oauth/token" {
                let n = issued.fetch_add(1, Ordering::SeqCst) + 1;
                return Ok(Reply::json(
                    200,
                    json!({"access_token": format!("fresh-{n}"), "refresh_token": "r2", "expires_in": 3600}),
                ));
            }
            match req.header("authorization") {
                Some(auth) if auth.starts_with("Bearer fresh-") => {
                    Ok(Reply::json(200, json!({"token": auth})))
                }
                _ => Ok(Reply::empty(401)),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_refresh() {
        let issued = Arc::new(AtomicUsize::new(0));
        let mock = MockTransport::new(server(Arc::clone(&issued)));
        let client = Client::builder(testing::config())
            .transport(Arc::clone(&mock) as Arc<dyn crate::Transport>)
            .token_store(expired_store())
            .call_limit(16)
            .build()
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let out: Value = client
                    .call(USER, &ApiRequest::get("/rest/users/me"))
                    .await
                    .unwrap();
                out["token"].as_str().unwrap().to_string()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), "Bearer fresh-1");
        }
        assert_eq!(issued.load(Ordering::SeqCst), 1);
        assert_eq!(mock.count_path("/oauth/token"), 1);
    }

    #[tokio::test]
    async fn refresh_sends_refresh_grant_and_persists() {
        let issued = Arc::new(AtomicUsize::new(0));
        let mock = MockTransport::new(server(issued));
        let store = expired_store();
        let client = Client::builder(testing::config())
            .transport(Arc::clone(&mock) as Arc<dyn crate::Transport>)
            .token_store(Arc::clone(&store) as Arc<dyn TokenStore>)
            .build()
            .unwrap();

        assert_eq!(client.access_token(USER).await.unwrap(), "fresh-1");

        let grant = &mock.requests()[0];
        assert_eq!(grant.form("grant_type").as_deref(), Some("refresh_token"));
        assert_eq!(grant.form("refresh_token").as_deref(), Some("refresh-1"));
        assert_eq!(grant.form("client_id").as_deref(), Some("app-id"));
        assert_eq!(grant.form("client_secret").as_deref(), Some("app-secret"));
        assert!(grant.header("authorization").is_none());

        let saved = store.load(USER).unwrap().unwrap();
        assert_eq!(saved.access_token, "fresh-1");
        assert!(!saved.is_expired());
    }

    #[tokio::test]
    async fn failed_refresh_without_unattended_grant_requires_sign_in() {
        let mock = MockTransport::new(|_| {
            Ok(Reply::json(400, json!({"error": "invalid_grant", "error_description": "revoked"})))
        });
        let store = expired_store();
        let client = Client::builder(testing::config())
            .transport(Arc::clone(&mock) as Arc<dyn crate::Transport>)
            .token_store(Arc::clone(&store) as Arc<dyn TokenStore>)
            .token_source(Arc::new(PasswordGrant::new("pw")))
            .build()
            .unwrap();

        let err = client.access_token(USER).await.unwrap_err();
        assert!(matches!(err, Error::Reauthenticate(_)));
        assert!(store.load(USER).unwrap().is_none());
        // Token codes are fatal on the token endpoint itself.
        assert_eq!(mock.count(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_signature_grant() {
        let mock = MockTransport::new(|req| {
            if req.form("grant_type").as_deref() == Some("refresh_token") {
                return Ok(Reply::json(400, json!({"error": "invalid_grant"})));
            }
            Ok(Reply::json(
                200,
                json!({"access_token": "signed", "refresh_token": "r", "expires_in": 60}),
            ))
        });
        let config = testing::config().with_signature_secret("sig-secret").unwrap();
        let client = Client::builder(config)
            .transport(Arc::clone(&mock) as Arc<dyn crate::Transport>)
            .token_store(expired_store())
            .token_source(Arc::new(SignatureGrant))
            .build()
            .unwrap();

        assert_eq!(client.access_token(USER).await.unwrap(), "signed");

        let grant = &mock.requests()[1];
        assert_eq!(grant.form("grant_type").as_deref(), Some("authorization_code"));
        let code = grant.form("code").unwrap();
        let fields: Vec<&str> = code.split(SIGNATURE_DELIMITER).collect();
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[0], "app-id");
        assert_eq!(fields[1], USER);
        let expected = signature_code(
            fields[0],
            fields[1],
            "sig-secret",
            fields[2].parse().unwrap(),
            fields[3].parse().unwrap(),
        )
        .unwrap();
        assert_eq!(code, expected);
    }

    #[tokio::test]
    async fn password_grant_for_unknown_user() {
        let mock = MockTransport::new(|_| {
            Ok(Reply::json(200, json!({"access_token": "pw-token", "expires_in": 60})))
        });
        let client = Client::builder(testing::config())
            .transport(Arc::clone(&mock) as Arc<dyn crate::Transport>)
            .token_store(Arc::new(MemoryTokenStore::new()))
            .token_source(Arc::new(PasswordGrant::new("hunter2")))
            .build()
            .unwrap();

        assert_eq!(client.access_token("bob").await.unwrap(), "pw-token");
        let grant = &mock.requests()[0];
        assert_eq!(grant.form("grant_type").as_deref(), Some("password"));
        assert_eq!(grant.form("username").as_deref(), Some("bob"));
        assert_eq!(grant.form("password").as_deref(), Some("hunter2"));
        assert_eq!(grant.form("scope").as_deref(), Some("*/*/*"));
    }

    #[tokio::test]
    async fn no_credential_and_no_source() {
        let mock = MockTransport::new(|_| Ok(Reply::empty(200)));
        let client = Client::builder(testing::config())
            .transport(Arc::clone(&mock) as Arc<dyn crate::Transport>)
            .token_store(Arc::new(MemoryTokenStore::new()))
            .build()
            .unwrap();
        let err = client.access_token("nobody").await.unwrap_err();
        assert!(matches!(err, Error::NoCredential(_)));
        assert_eq!(mock.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_token_is_expired_and_renewed() {
        let issued = Arc::new(AtomicUsize::new(0));
        let mock = MockTransport::new(server(Arc::clone(&issued)));
        // "valid-token" looks fresh locally but the server rejects it.
        let client = testing::client(Arc::clone(&mock));

        let out: Value = client.call(USER, &ApiRequest::get("/rest/users/me")).await.unwrap();
        assert_eq!(out["token"], "Bearer fresh-1");
        assert_eq!(issued.load(Ordering::SeqCst), 1);
        assert_eq!(mock.count(), 3);
    }

    #[tokio::test]
    async fn expire_only_touches_the_rejected_token() {
        let mock = MockTransport::new(|_| Ok(Reply::empty(200)));
        let client = testing::client(mock);

        client.expire_token(USER, "some-older-token").await.unwrap();
        let cred = client.token_store().load(USER).unwrap().unwrap();
        assert!(!cred.is_expired());

        client.expire_token(USER, "valid-token").await.unwrap();
        let cred = client.token_store().load(USER).unwrap().unwrap();
        assert!(cred.is_expired());
    }

    #[tokio::test]
    async fn logout_deletes_credential() {
        let mock = MockTransport::new(|_| Ok(Reply::empty(200)));
        let client = testing::client(mock);
        client.logout(USER).await.unwrap();
        assert!(client.token_store().load(USER).unwrap().is_none());
    }

    #[test]
    fn signature_code_is_deterministic() {
        let a = signature_code("app", "alice", "key", 1_700_000_000, 42).unwrap();
        let b = signature_code("app", "alice", "key", 1_700_000_000, 42).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("app|@@|alice|@@|1700000000|@@|42|@@|"));
        // HMAC-SHA1 is 20 bytes.
        assert_eq!(a.rsplit(SIGNATURE_DELIMITER).next().unwrap().len(), 40);
        assert_ne!(a, signature_code("app", "alice", "other", 1_700_000_000, 42).unwrap());
    }
}
