//! Git synchronization
//!
//! Everything the reconciler needs from Git: single-branch clone, pull,
//! fetch for drift probes, commit resolution, default-branch discovery,
//! and credential validation. Backed by libgit2; the [`GitSync`] trait is
//! the seam tests substitute fakes through.

mod auth;
mod sync;

pub use sync::GitSynchronizer;

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::GitAuth;

/// Capability interface over a Git implementation.
///
/// All methods are blocking (libgit2 is); async callers go through
/// `tokio::task::spawn_blocking`.
pub trait GitSync: Send + Sync {
    /// Single-branch clone of `url` into `dest`. An empty `branch` resolves
    /// the remote default branch first. Returns the branch actually cloned.
    fn clone_repo(
        &self,
        url: &str,
        branch: &str,
        auth: Option<&GitAuth>,
        dest: &Path,
    ) -> Result<String>;

    /// Fetch + fast-forward the local branch. Already up to date is success,
    /// not an error. Returns the resulting HEAD commit hash.
    fn pull(&self, branch: &str, auth: Option<&GitAuth>, dir: &Path) -> Result<String>;

    /// Update the remote-tracking ref only; the working tree is untouched.
    fn fetch(&self, branch: &str, auth: Option<&GitAuth>, dir: &Path) -> Result<()>;

    /// Local HEAD commit hash.
    fn latest_commit(&self, dir: &Path) -> Result<String>;

    /// Commit hash of `refs/remotes/origin/<branch>`; requires a prior fetch.
    fn remote_latest_commit(&self, dir: &Path, branch: &str) -> Result<String>;

    /// Resolve the remote's symbolic HEAD to a branch name.
    fn default_branch(&self, url: &str, auth: Option<&GitAuth>) -> Result<String>;

    /// Read-only remote listing to validate credentials. Leaves no local
    /// state behind.
    fn test_auth(&self, url: &str, auth: Option<&GitAuth>) -> Result<()>;
}

/// Run a blocking Git closure off the async runtime, bounded by `timeout`.
///
/// The timeout bounds how long the caller waits; libgit2 itself keeps
/// running until its next cancellation point, which is acceptable for a
/// background task.
pub async fn with_timeout<T, F>(timeout: Duration, op: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Err(_) => Err(Error::Timeout { op, timeout }),
        Ok(Err(join_err)) => Err(Error::Git {
            op,
            message: format!("git task failed: {join_err}"),
            auth_failure: false,
        }),
        Ok(Ok(result)) => result,
    }
}
