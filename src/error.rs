//! Error taxonomy and retry logic
//!
//! Every fallible operation in the library returns [`Error`]. The variants
//! map one-to-one onto the failure domains of the reconciler: input
//! validation, Git transport, subprocess execution, credential decryption,
//! lookups, and persistence.

use std::time::Duration;

use tokio::time::sleep;

/// Library-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad input; no external call was made.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Clone/pull/fetch/listing failure against the Git remote.
    #[error("git {op} failed: {message}")]
    Git {
        op: &'static str,
        message: String,
        /// Auth failures are not retryable; transient network ones are.
        auth_failure: bool,
    },

    /// The compose subprocess exited non-zero (or could not be spawned).
    #[error("compose {op} failed: {message}")]
    Process {
        op: &'static str,
        message: String,
        stdout: String,
        stderr: String,
    },

    /// Stored credential could not be decrypted (e.g. rotated key).
    #[error("credential decryption failed: {0}")]
    Decryption(String),

    /// Unknown project or deployment id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Persistence layer failure.
    #[error("storage error: {0}")]
    Store(String),

    /// An operation exceeded its deadline.
    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn git(op: &'static str, err: &git2::Error) -> Self {
        let auth_failure = err.code() == git2::ErrorCode::Auth
            || matches!(err.class(), git2::ErrorClass::Ssh)
            || (err.class() == git2::ErrorClass::Http
                && err.message().contains("authentication"));
        Self::Git {
            op,
            message: err.message().to_string(),
            auth_failure,
        }
    }

    pub fn process(op: &'static str, message: impl Into<String>) -> Self {
        Self::Process {
            op,
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn process_output(
        op: &'static str,
        message: impl Into<String>,
        stdout: String,
        stderr: String,
    ) -> Self {
        Self::Process {
            op,
            message: message.into(),
            stdout,
            stderr,
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether retrying the operation can plausibly succeed.
    ///
    /// Auth failures and bad input never become valid on retry; transient
    /// Git transport errors and timeouts can.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Git { auth_failure, .. } => !auth_failure,
            Error::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Store(err.to_string())
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (first try included)
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Run `operation` until it succeeds, returns a non-retryable error, or the
/// attempt budget is spent. Only errors for which [`Error::is_retryable`]
/// holds are retried.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempts < policy.max_attempts => {
                tracing::warn!(
                    attempt = attempts,
                    max = policy.max_attempts,
                    error = %e,
                    "retrying after transient failure in {:?}",
                    delay
                );
                sleep(delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * policy.backoff_multiplier)
                        .min(policy.max_delay.as_secs_f64()),
                );
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn transient() -> Error {
        Error::Git {
            op: "fetch",
            message: "connection reset".into(),
            auth_failure: false,
        }
    }

    fn auth() -> Error {
        Error::Git {
            op: "fetch",
            message: "authentication required".into(),
            auth_failure: true,
        }
    }

    #[test]
    fn test_retryability() {
        assert!(transient().is_retryable());
        assert!(!auth().is_retryable());
        assert!(!Error::validation("bad name").is_retryable());
        assert!(!Error::Decryption("key mismatch".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_with_retry_eventually_succeeds() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(
            &RetryPolicy {
                initial_delay: Duration::from_millis(1),
                ..Default::default()
            },
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { if n < 3 { Err(transient()) } else { Ok(n) } }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_on_auth_failure() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(auth()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_respects_attempt_budget() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retry(
            &RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                ..Default::default()
            },
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
