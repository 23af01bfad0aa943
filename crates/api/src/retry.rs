//! Per-call retry bookkeeping and backoff.
//!
//! A [`RetryContext`] lives for one logical operation. Its owner loops while
//! [`check_for_retry`](RetryContext::check_for_retry) returns `true`.

use std::time::Duration;

use tracing::{debug, warn};

use crate::{ClientConfig, Error};

/// How a failed attempt is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The credential was rejected; renew it, then retry.
    Token,
    /// Transient failure; back off, then retry.
    Retry,
    /// Surface to the caller immediately.
    Fatal,
}

/// Backoff before the retry that follows `attempt` (0-based): `(attempt+1)^2` units.
pub fn backoff_delay(unit: Duration, attempt: u32) -> Duration {
    let factor = (attempt.saturating_add(1)).saturating_pow(2);
    unit.saturating_mul(factor)
}

/// Retry state for one call chain.
#[derive(Debug, Clone)]
pub struct RetryContext {
    id: String,
    username: String,
    task: String,
    attempt: u32,
    retries: u32,
    backoff_unit: Duration,
    token_codes: Vec<String>,
    retry_codes: Vec<String>,
    extra_codes: Vec<String>,
    token_error: bool,
}

impl RetryContext {
    pub fn new(config: &ClientConfig, username: &str, task: &str) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: id[..8].to_string(),
            username: username.to_string(),
            task: task.to_string(),
            attempt: 0,
            retries: config.retries,
            backoff_unit: config.backoff_unit,
            token_codes: config.token_error_codes.clone(),
            retry_codes: config.retry_error_codes.clone(),
            extra_codes: Vec::new(),
            token_error: false,
        }
    }

    /// Adds codes that are retryable for this call chain only.
    #[must_use]
    pub fn with_extra_codes<S: AsRef<str>>(mut self, codes: &[S]) -> Self {
        self.extra_codes
            .extend(codes.iter().map(|c| c.as_ref().to_string()));
        self
    }

    /// Token codes become fatal; used for calls made without a bearer token.
    #[must_use]
    pub(crate) fn without_token_errors(mut self) -> Self {
        self.token_codes.clear();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True if the last failure checked was a token error.
    pub fn token_error(&self) -> bool {
        self.token_error
    }

    /// Pure classification of an error against this context's code sets.
    pub fn classify(&self, err: &Error) -> Classification {
        match err {
            Error::Api(api) if api.has_any(self.token_codes.as_slice()) => Classification::Token,
            Error::Api(api)
                if api.has_any(self.retry_codes.as_slice()) || api.has_any(self.extra_codes.as_slice()) =>
            {
                Classification::Retry
            }
            e if e.is_transport() => Classification::Retry,
            _ => Classification::Fatal,
        }
    }

    pub fn is_token_error(&self, err: &Error) -> bool {
        self.classify(err) == Classification::Token
    }

    /// Token errors count as retryable: the call is repeated after renewal.
    pub fn is_retryable(&self, err: &Error) -> bool {
        self.classify(err) != Classification::Fatal
    }

    /// Decides whether the caller should try again, sleeping for the backoff
    /// first when it should.
    pub async fn check_for_retry<T>(&mut self, outcome: &Result<T, Error>) -> bool {
        self.token_error = false;

        let err = match outcome {
            Ok(_) => {
                if self.attempt > 0 {
                    debug!(
                        id = %self.id,
                        user = %self.username,
                        task = %self.task,
                        attempt = self.attempt,
                        "call succeeded after retry"
                    );
                }
                return false;
            }
            Err(e) => e,
        };

        if self.attempt > self.retries {
            warn!(
                id = %self.id,
                user = %self.username,
                task = %self.task,
                retries = self.retries,
                error = %err,
                "retries exhausted"
            );
            return false;
        }

        match self.classify(err) {
            Classification::Fatal => return false,
            Classification::Token => {
                self.token_error = true;
                debug!(id = %self.id, user = %self.username, error = %err, "token rejected, renewing");
            }
            Classification::Retry => {
                debug!(id = %self.id, user = %self.username, error = %err, "transient failure");
            }
        }

        if self.attempt < self.retries {
            let delay = backoff_delay(self.backoff_unit, self.attempt);
            debug!(
                id = %self.id,
                task = %self.task,
                attempt = self.attempt + 1,
                delay_secs = delay.as_secs_f64(),
                "backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }

        self.attempt += 1;
        true
    }
}
