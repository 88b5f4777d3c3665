//! Deployment orchestration
//!
//! Coordinates Git and compose to move a project between states, recording
//! every attempt as a deployment row. Operations on the SAME project are
//! serialized through a per-project lock; different projects never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::compose::{CancelSignal, OutputLine, OutputMode};
use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::git;
use crate::models::{Deployment, DeploymentStatus, GitAuth, Project, ProjectStatus};

/// Input for first-time project registration.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub git_url: String,
    /// Empty string means "resolve the remote default branch".
    pub git_branch: String,
    pub git_auth: Option<GitAuth>,
    pub compose_files: Vec<String>,
    pub compose_override: Option<String>,
    pub variables: Vec<(String, String)>,
    pub auto_deploy: bool,
}

pub struct DeploymentOrchestrator {
    ctx: Arc<AppContext>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl DeploymentOrchestrator {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, project_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn load(&self, project_id: Uuid) -> Result<Project> {
        self.ctx
            .projects
            .find_by_id(project_id)?
            .ok_or_else(|| Error::not_found("project", project_id.to_string()))
    }

    /// Register a new project: validate, clone, verify the compose files
    /// parse, persist. The project only exists once the clone succeeded.
    pub async fn register(&self, input: NewProject) -> Result<Project> {
        if self.ctx.projects.find_by_name(&input.name)?.is_some() {
            return Err(Error::validation(format!(
                "a project named '{}' already exists",
                input.name
            )));
        }

        let working_dir = self.ctx.config.project_dir(&input.name);
        if working_dir.exists() {
            return Err(Error::validation(format!(
                "working directory {} already exists",
                working_dir.display()
            )));
        }

        let now = chrono::Utc::now();
        let mut project = Project {
            id: Uuid::new_v4(),
            name: input.name,
            git_url: input.git_url,
            git_branch: input.git_branch,
            git_auth: input.git_auth,
            working_dir: working_dir.clone(),
            compose_files: input.compose_files,
            compose_override: input.compose_override,
            variables: input.variables,
            status: ProjectStatus::Unknown,
            local_commit: None,
            remote_commit: None,
            auto_deploy: input.auto_deploy,
            created_at: now,
            updated_at: now,
        };
        project.validate()?;

        let branch = {
            let git = self.ctx.git.clone();
            let url = project.git_url.clone();
            let requested = project.git_branch.clone();
            let auth = project.git_auth.clone();
            let dest = working_dir.clone();
            git::with_timeout(self.ctx.config.git_timeout, "clone", move || {
                git.clone_repo(&url, &requested, auth.as_ref(), &dest)
            })
            .await?
        };
        project.git_branch = branch;

        let commit = {
            let git = self.ctx.git.clone();
            let dir = working_dir.clone();
            git::with_timeout(self.ctx.config.git_timeout, "resolve HEAD", move || {
                git.latest_commit(&dir)
            })
            .await
        };
        project.local_commit = commit.ok();
        project.remote_commit = project.local_commit.clone();

        // A project whose compose files do not parse would fail on every
        // deploy; reject it now and leave nothing behind.
        if let Err(err) = self.ctx.compose.config_check(&project).await {
            let _ = tokio::fs::remove_dir_all(&working_dir).await;
            return Err(err);
        }

        if let Err(err) = self.ctx.projects.create(&project) {
            let _ = tokio::fs::remove_dir_all(&working_dir).await;
            return Err(err);
        }

        info!(project = %project.name, branch = %project.git_branch, "project registered");
        Ok(project)
    }

    /// Deploy a project: optionally pull, then `up`. Every attempt leaves a
    /// deployment record; only a successful one moves the project forward.
    pub async fn deploy(
        &self,
        project_id: Uuid,
        pull: bool,
        output: OutputMode,
        cancel: CancelSignal,
    ) -> Result<Deployment> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;

        let mut project = self.load(project_id)?;
        info!(project = %project.name, pull, "starting deployment");

        let commit = match self.sync_checkout(&project, pull).await {
            Ok(commit) => commit,
            Err(err) => {
                // The attempt is still recorded, attributed to the commit
                // we were sitting on when Git failed.
                let mut failed = Deployment::begin(
                    project.id,
                    project.local_commit.clone().unwrap_or_default(),
                );
                failed.status = DeploymentStatus::Failed;
                failed.stderr = err.to_string();
                if let Err(store_err) = self.ctx.deployments.create(&failed) {
                    error!(%store_err, "failed to record failed deployment");
                }
                if let OutputMode::Streaming(tx) = &output {
                    let _ = tx.try_send(OutputLine::system(err.to_string()));
                }
                return Err(err);
            }
        };

        let mut deployment = Deployment::begin(project.id, &commit);
        self.ctx.deployments.create(&deployment)?;

        match self.ctx.compose.up(&project, output, cancel).await {
            Ok(output) => {
                deployment.status = DeploymentStatus::Completed;
                deployment.stdout = output.stdout;
                deployment.stderr = output.stderr;
                self.ctx.deployments.update(&deployment)?;

                project.status = ProjectStatus::Running;
                project.local_commit = Some(commit.clone());
                self.ctx.projects.update(&project)?;

                info!(project = %project.name, commit = %commit, "deployment completed");
                Ok(deployment)
            }
            Err(err) => {
                deployment.status = DeploymentStatus::Failed;
                if let Error::Process { stdout, stderr, .. } = &err {
                    deployment.stdout = stdout.clone();
                    deployment.stderr = stderr.clone();
                } else {
                    deployment.stderr = err.to_string();
                }
                if let Err(store_err) = self.ctx.deployments.update(&deployment) {
                    error!(%store_err, "failed to finalize deployment record");
                }
                // The failure is scoped to this attempt; the project's
                // status reflects whatever was running before.
                warn!(project = %project.name, %err, "deployment failed");
                Err(err)
            }
        }
    }

    /// Take the project's containers down and mark it stopped.
    pub async fn stop(
        &self,
        project_id: Uuid,
        output: OutputMode,
        cancel: CancelSignal,
    ) -> Result<()> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;

        let mut project = self.load(project_id)?;
        self.ctx.compose.down(&project, output, cancel).await?;

        project.status = ProjectStatus::Stopped;
        self.ctx.projects.update(&project)?;
        info!(project = %project.name, "stopped");
        Ok(())
    }

    /// Remove a project entirely: stop, delete the checkout, delete the
    /// records. A failing stop aborts the removal so no containers are
    /// orphaned.
    pub async fn remove(
        &self,
        project_id: Uuid,
        output: OutputMode,
        cancel: CancelSignal,
    ) -> Result<()> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;

        let project = self.load(project_id)?;
        self.ctx.compose.down(&project, output, cancel).await?;

        match tokio::fs::remove_dir_all(&project.working_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        self.ctx.deployments.delete_by_project(project.id)?;
        self.ctx.projects.delete(project.id)?;
        self.locks.remove(&project.id);

        info!(project = %project.name, "removed");
        Ok(())
    }

    /// Probe the live container status and persist it when it changed.
    pub async fn refresh_status(&self, project_id: Uuid) -> Result<ProjectStatus> {
        let mut project = self.load(project_id)?;
        let status = self.ctx.compose.status(&project).await?;
        if status != project.status {
            project.status = status;
            self.ctx.projects.update(&project)?;
        }
        Ok(status)
    }

    /// Pull (optional) and resolve the checked-out commit.
    async fn sync_checkout(&self, project: &Project, pull: bool) -> Result<String> {
        let timeout = self.ctx.config.git_timeout;

        if pull {
            let git = self.ctx.git.clone();
            let branch = project.git_branch.clone();
            let auth = project.git_auth.clone();
            let dir = project.working_dir.clone();
            git::with_timeout(timeout, "pull", move || {
                git.pull(&branch, auth.as_ref(), &dir)
            })
            .await?;
        }

        let git = self.ctx.git.clone();
        let dir = project.working_dir.clone();
        git::with_timeout(timeout, "resolve HEAD", move || git.latest_commit(&dir)).await
    }
}
