//! Application context
//!
//! One struct owns every service the reconciler needs (repositories, Git,
//! compose, vault, configuration), constructed once at startup and passed
//! by reference. No global mutable state anywhere.

use std::sync::Arc;

use crate::compose::{ComposeExecutor, ComposeRunner};
use crate::config::Config;
use crate::error::Result;
use crate::git::{GitSync, GitSynchronizer};
use crate::storage::{
    Database, DeploymentRepository, ProjectRepository, SqliteDeploymentRepository,
    SqliteProjectRepository,
};
use crate::vault::CredentialVault;

pub struct AppContext {
    pub config: Config,
    pub projects: Arc<dyn ProjectRepository>,
    pub deployments: Arc<dyn DeploymentRepository>,
    pub git: Arc<dyn GitSync>,
    pub compose: Arc<dyn ComposeRunner>,
    pub vault: Option<Arc<CredentialVault>>,
}

impl AppContext {
    /// Wire the default production services: sqlite storage, libgit2, and
    /// the real compose executor.
    pub fn initialize(config: Config) -> Result<Arc<Self>> {
        let db = Database::new(&config.db_path())?;
        db.initialize()?;

        let vault = config
            .secret_key
            .as_deref()
            .map(|key| Arc::new(CredentialVault::new(key, &config.secret_keys)));

        let projects = Arc::new(SqliteProjectRepository::new(db.clone(), vault.clone()));
        let deployments = Arc::new(SqliteDeploymentRepository::new(db));

        Ok(Arc::new(Self {
            compose: Arc::new(ComposeExecutor::new(config.compose_bin.clone())),
            git: Arc::new(GitSynchronizer::new()),
            projects,
            deployments,
            vault,
            config,
        }))
    }

    /// Assemble a context from explicit parts; the seam tests use to
    /// substitute fakes for Git and compose.
    pub fn with_services(
        config: Config,
        projects: Arc<dyn ProjectRepository>,
        deployments: Arc<dyn DeploymentRepository>,
        git: Arc<dyn GitSync>,
        compose: Arc<dyn ComposeRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            projects,
            deployments,
            git,
            compose,
            vault: None,
        })
    }
}
