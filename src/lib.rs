//! # Dockhand - GitOps for docker compose
//!
//! Single-host reconciler that keeps deployed compose projects in sync
//! with a Git branch.
//!
//! ## Features
//!
//! - **Drift detection**: a periodic loop compares the deployed commit to
//!   the remote branch HEAD and redeploys on divergence
//! - **Three execution modes**: blocking (introspection), streaming
//!   (line-by-line over a bounded channel), piping (interactive CLI)
//! - **Deployment history**: every attempt is recorded with its commit
//!   hash and captured output
//! - **Encrypted credentials**: Git auth is AES-256-GCM encrypted at rest
//!   with rotatable keys
//! - **Process-group cancellation**: an aborted deploy never leaves a
//!   compose process behind
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dockhand::{AppContext, Config, DeploymentOrchestrator, Watcher};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = AppContext::initialize(Config::from_env()?)?;
//!     let orchestrator = Arc::new(DeploymentOrchestrator::new(ctx.clone()));
//!
//!     let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     let watcher = Watcher::new(ctx, orchestrator);
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         let _ = shutdown_tx.send(true);
//!     });
//!     watcher.run(shutdown_rx).await;
//!     Ok(())
//! }
//! ```

pub mod compose;
pub mod config;
pub mod context;
pub mod error;
pub mod git;
pub mod models;
pub mod orchestrator;
pub mod storage;
pub mod vault;
pub mod watcher;

// Re-export main types for library consumers
pub use compose::{ComposeExecutor, ComposeRunner, OutputLine, OutputMode};
pub use config::Config;
pub use context::AppContext;
pub use error::{Error, Result};
pub use git::{GitSync, GitSynchronizer};
pub use models::{Deployment, DeploymentStatus, GitAuth, Project, ProjectStatus};
pub use orchestrator::{DeploymentOrchestrator, NewProject};
pub use vault::CredentialVault;
pub use watcher::Watcher;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
