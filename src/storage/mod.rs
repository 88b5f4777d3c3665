//! Persistence - repository traits and their sqlite implementations
//!
//! The core depends only on [`ProjectRepository`] and
//! [`DeploymentRepository`]; the sqlite implementations here are the
//! default backend. Git credentials pass through the vault on their way in
//! and out of the `projects` table.

mod db;
mod deployments;
mod projects;

pub use db::Database;
pub use deployments::SqliteDeploymentRepository;
pub use projects::SqliteProjectRepository;

use uuid::Uuid;

use crate::error::Result;
use crate::models::{Deployment, Project};

/// Project persistence contract.
pub trait ProjectRepository: Send + Sync {
    fn create(&self, project: &Project) -> Result<()>;
    fn update(&self, project: &Project) -> Result<()>;
    fn delete(&self, id: Uuid) -> Result<()>;
    fn find_by_id(&self, id: Uuid) -> Result<Option<Project>>;
    fn find_by_name(&self, name: &str) -> Result<Option<Project>>;
    fn list(&self) -> Result<Vec<Project>>;
}

/// Deployment persistence contract. Records are never deleted by the core.
pub trait DeploymentRepository: Send + Sync {
    fn create(&self, deployment: &Deployment) -> Result<()>;
    fn update(&self, deployment: &Deployment) -> Result<()>;
    fn find_by_id(&self, id: Uuid) -> Result<Option<Deployment>>;
    /// Newest first.
    fn list_by_project(&self, project_id: Uuid) -> Result<Vec<Deployment>>;
    /// Deployments of a project are removed only when the project itself is.
    fn delete_by_project(&self, project_id: Uuid) -> Result<()>;
}
