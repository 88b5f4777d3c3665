//! Domain model - projects, deployments, and Git authentication
//!
//! A `Project` is one tracked compose application: a Git repository, the
//! branch to follow, the compose files to run, and the state of the last
//! reconciliation. A `Deployment` is the immutable record of one attempt
//! to bring the project up.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Git authentication material.
///
/// Exactly one variant is populated, or none at all for public repositories.
/// Modeled as a sum type so "HTTP and SSH at the same time" is unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GitAuth {
    Http { username: String, password: String },
    Ssh { private_key: String, user: String },
}

impl GitAuth {
    /// Stable tag stored next to the ciphertext so decryption never has to
    /// guess the variant.
    pub fn type_tag(&self) -> &'static str {
        match self {
            GitAuth::Http { .. } => "http",
            GitAuth::Ssh { .. } => "ssh",
        }
    }
}

/// Aggregate container state of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Running,
    Stopped,
    Error,
    Unknown,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Running => "running",
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Error => "error",
            ProjectStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => ProjectStatus::Running,
            "stopped" => ProjectStatus::Stopped,
            "error" => ProjectStatus::Error,
            _ => ProjectStatus::Unknown,
        }
    }
}

/// Deployment lifecycle. Transitions are one-way:
/// `InProgress -> Completed` or `InProgress -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    InProgress,
    Completed,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => DeploymentStatus::Completed,
            "failed" => DeploymentStatus::Failed,
            _ => DeploymentStatus::InProgress,
        }
    }
}

/// A tracked compose application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,

    /// Unique human-readable name; doubles as the compose project name.
    pub name: String,

    pub git_url: String,
    pub git_branch: String,

    /// Optional credentials; encrypted at rest by the vault.
    pub git_auth: Option<GitAuth>,

    /// The local Git checkout the compose command runs in.
    pub working_dir: PathBuf,

    /// Ordered `--file` arguments, relative to the working directory.
    pub compose_files: Vec<String>,

    /// Optional override file, applied after `compose_files`.
    pub compose_override: Option<String>,

    /// Ordered KEY=VALUE pairs injected as subprocess environment.
    pub variables: Vec<(String, String)>,

    pub status: ProjectStatus,
    pub local_commit: Option<String>,
    pub remote_commit: Option<String>,
    pub auto_deploy: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Validate the invariants a project must satisfy before it is persisted.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("project name must not be empty"));
        }
        if self
            .name
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
        {
            return Err(Error::validation(format!(
                "project name '{}' may only contain alphanumerics, '-' and '_'",
                self.name
            )));
        }
        if self.git_url.trim().is_empty() {
            return Err(Error::validation("git url must not be empty"));
        }
        if self.compose_files.is_empty() {
            return Err(Error::validation(
                "at least one compose file is required",
            ));
        }
        for (key, _) in &self.variables {
            if key.is_empty() || key.contains('=') {
                return Err(Error::validation(format!("invalid variable name '{key}'")));
            }
        }
        Ok(())
    }
}

/// One recorded attempt to deploy a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub commit_hash: String,
    pub status: DeploymentStatus,
    pub stdout: String,
    pub stderr: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Start a new in-progress deployment record.
    pub fn begin(project_id: Uuid, commit_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            commit_hash: commit_hash.into(),
            status: DeploymentStatus::InProgress,
            stdout: String::new(),
            stderr: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_project() -> Project {
        let now = Utc::now();
        Project {
            id: Uuid::new_v4(),
            name: "web-app".into(),
            git_url: "https://example.com/repo.git".into(),
            git_branch: "main".into(),
            git_auth: None,
            working_dir: PathBuf::from("/var/lib/dockhand/projects/web-app"),
            compose_files: vec!["docker-compose.yml".into()],
            compose_override: None,
            variables: vec![("IMAGE_TAG".into(), "v1".into())],
            status: ProjectStatus::Unknown,
            local_commit: None,
            remote_commit: None,
            auto_deploy: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_valid_project_passes() {
        assert!(sample_project().validate().is_ok());
    }

    #[test]
    fn test_compose_files_must_not_be_empty() {
        let mut p = sample_project();
        p.compose_files.clear();
        assert!(matches!(p.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_name_charset_is_enforced() {
        let mut p = sample_project();
        p.name = "web app!".into();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_variable_names_reject_equals() {
        let mut p = sample_project();
        p.variables = vec![("BAD=KEY".into(), "v".into())];
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_auth_type_tags() {
        let http = GitAuth::Http {
            username: "u".into(),
            password: "p".into(),
        };
        let ssh = GitAuth::Ssh {
            private_key: "---".into(),
            user: "git".into(),
        };
        assert_eq!(http.type_tag(), "http");
        assert_eq!(ssh.type_tag(), "ssh");
    }

    #[test]
    fn test_deployment_status_transitions_are_one_way() {
        assert!(!DeploymentStatus::InProgress.is_terminal());
        assert!(DeploymentStatus::Completed.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_string_round_trip() {
        for s in [
            ProjectStatus::Running,
            ProjectStatus::Stopped,
            ProjectStatus::Error,
            ProjectStatus::Unknown,
        ] {
            assert_eq!(ProjectStatus::parse(s.as_str()), s);
        }
    }
}
