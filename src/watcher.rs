//! Drift-detection loop
//!
//! One long-lived task ticks on a fixed interval, probes every
//! auto-deploy project for divergence between the deployed commit and the
//! remote branch HEAD, and hands drifted projects to the orchestrator.
//! Each sweep is self-contained: no state carries across ticks, and one
//! project's failure never aborts the rest of the sweep.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::compose::{OutputMode, OUTPUT_CHANNEL_CAPACITY};
use crate::context::AppContext;
use crate::error::{with_retry, Result, RetryPolicy};
use crate::git;
use crate::models::{Project, ProjectStatus};
use crate::orchestrator::DeploymentOrchestrator;

pub struct Watcher {
    ctx: Arc<AppContext>,
    orchestrator: Arc<DeploymentOrchestrator>,
    retry: RetryPolicy,
}

/// What one sweep did; used for logging and assertions.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub deployed: usize,
    pub failed: usize,
}

impl Watcher {
    pub fn new(ctx: Arc<AppContext>, orchestrator: Arc<DeploymentOrchestrator>) -> Self {
        Self {
            ctx,
            orchestrator,
            retry: RetryPolicy::default(),
        }
    }

    /// Tick until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval = ?self.ctx.config.poll_interval, "watcher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep(shutdown.clone()).await;
                    debug!(?report, "sweep finished");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("watcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One reconciliation pass over every auto-deploy project.
    pub async fn sweep(&self, cancel: watch::Receiver<bool>) -> SweepReport {
        let projects = match self.ctx.projects.list() {
            Ok(projects) => projects,
            Err(err) => {
                error!(%err, "cannot list projects, skipping sweep");
                return SweepReport::default();
            }
        };

        let mut report = SweepReport::default();

        for project in projects.into_iter().filter(|p| p.auto_deploy) {
            if *cancel.borrow() {
                break;
            }
            report.checked += 1;

            match self.reconcile(&project, cancel.clone()).await {
                Ok(true) => report.deployed += 1,
                Ok(false) => {}
                Err(err) => {
                    report.failed += 1;
                    error!(project = %project.name, %err, "reconciliation failed");
                    self.mark_errored(&project);
                }
            }
        }

        report
    }

    /// Probe one project; deploy when the remote has moved past the
    /// deployed commit. Returns whether a deploy happened.
    async fn reconcile(&self, project: &Project, cancel: watch::Receiver<bool>) -> Result<bool> {
        // Transient fetch failures (flaky network, remote hiccup) are
        // retried with backoff; auth failures fall through immediately.
        let remote_head = with_retry(&self.retry, || {
            let git = self.ctx.git.clone();
            let branch = project.git_branch.clone();
            let auth = project.git_auth.clone();
            let dir = project.working_dir.clone();
            let timeout = self.ctx.config.git_timeout;
            async move {
                git::with_timeout(timeout, "fetch", move || {
                    git.fetch(&branch, auth.as_ref(), &dir)?;
                    git.remote_latest_commit(&dir, &branch)
                })
                .await
            }
        })
        .await?;

        if project.remote_commit.as_deref() != Some(remote_head.as_str()) {
            let mut probed = project.clone();
            probed.remote_commit = Some(remote_head.clone());
            self.ctx.projects.update(&probed)?;
        }

        if project.local_commit.as_deref() == Some(remote_head.as_str()) {
            debug!(project = %project.name, "in sync");
            return Ok(false);
        }

        info!(
            project = %project.name,
            local = project.local_commit.as_deref().unwrap_or("none"),
            remote = %remote_head,
            "drift detected, deploying"
        );

        // Nobody is watching a background deploy; the channel exists so the
        // executor's lossy forwarding has somewhere to not deliver to, and
        // the drain keeps a debug trail.
        let (tx, mut rx) = mpsc::channel::<crate::compose::OutputLine>(OUTPUT_CHANNEL_CAPACITY);
        let name = project.name.clone();
        let drain = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                debug!(project = %name, "{}", line.text);
            }
        });

        let result = self
            .orchestrator
            .deploy(project.id, true, OutputMode::Streaming(tx), cancel)
            .await;
        let _ = drain.await;

        result.map(|_| true)
    }

    /// Surface a sweep failure on the project itself.
    fn mark_errored(&self, project: &Project) {
        match self.ctx.projects.find_by_id(project.id) {
            Ok(Some(mut fresh)) => {
                if fresh.status != ProjectStatus::Error {
                    fresh.status = ProjectStatus::Error;
                    if let Err(err) = self.ctx.projects.update(&fresh) {
                        warn!(project = %project.name, %err, "could not record error status");
                    }
                }
            }
            Ok(None) => {} // removed mid-sweep
            Err(err) => {
                warn!(project = %project.name, %err, "could not reload project");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::compose::{CancelSignal, CommandOutput, ComposeRunner};
    use crate::config::Config;
    use crate::error::Error;
    use crate::git::GitSync;
    use crate::models::GitAuth;
    use crate::storage::{
        Database, ProjectRepository, SqliteDeploymentRepository, SqliteProjectRepository,
    };

    /// Git fake: remote heads per directory, every call recorded.
    #[derive(Default)]
    struct FakeGit {
        remote_heads: StdMutex<HashMap<PathBuf, String>>,
        local_heads: StdMutex<HashMap<PathBuf, String>>,
        fail_fetch_for: StdMutex<Option<PathBuf>>,
    }

    impl FakeGit {
        fn set_remote(&self, dir: &Path, commit: &str) {
            self.remote_heads
                .lock()
                .unwrap()
                .insert(dir.to_path_buf(), commit.to_string());
        }

        fn set_local(&self, dir: &Path, commit: &str) {
            self.local_heads
                .lock()
                .unwrap()
                .insert(dir.to_path_buf(), commit.to_string());
        }
    }

    impl GitSync for FakeGit {
        fn clone_repo(
            &self,
            _url: &str,
            branch: &str,
            _auth: Option<&GitAuth>,
            _dest: &Path,
        ) -> crate::error::Result<String> {
            Ok(if branch.is_empty() { "main".into() } else { branch.into() })
        }

        fn pull(
            &self,
            _branch: &str,
            _auth: Option<&GitAuth>,
            dir: &Path,
        ) -> crate::error::Result<String> {
            let remote = self
                .remote_heads
                .lock()
                .unwrap()
                .get(dir)
                .cloned()
                .unwrap_or_default();
            self.set_local(dir, &remote);
            Ok(remote)
        }

        fn fetch(
            &self,
            _branch: &str,
            _auth: Option<&GitAuth>,
            dir: &Path,
        ) -> crate::error::Result<()> {
            if self.fail_fetch_for.lock().unwrap().as_deref() == Some(dir) {
                return Err(Error::Git {
                    op: "fetch",
                    message: "remote unreachable".into(),
                    auth_failure: false,
                });
            }
            Ok(())
        }

        fn latest_commit(&self, dir: &Path) -> crate::error::Result<String> {
            Ok(self
                .local_heads
                .lock()
                .unwrap()
                .get(dir)
                .cloned()
                .unwrap_or_else(|| "none".into()))
        }

        fn remote_latest_commit(&self, dir: &Path, _branch: &str) -> crate::error::Result<String> {
            Ok(self
                .remote_heads
                .lock()
                .unwrap()
                .get(dir)
                .cloned()
                .unwrap_or_else(|| "none".into()))
        }

        fn default_branch(
            &self,
            _url: &str,
            _auth: Option<&GitAuth>,
        ) -> crate::error::Result<String> {
            Ok("main".into())
        }

        fn test_auth(&self, _url: &str, _auth: Option<&GitAuth>) -> crate::error::Result<()> {
            Ok(())
        }
    }

    /// Compose fake: records which projects were brought up.
    #[derive(Default)]
    struct FakeCompose {
        ups: StdMutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl ComposeRunner for FakeCompose {
        async fn up(
            &self,
            project: &Project,
            _output: OutputMode,
            _cancel: CancelSignal,
        ) -> crate::error::Result<CommandOutput> {
            self.ups.lock().unwrap().push(project.id);
            Ok(CommandOutput {
                exit_code: Some(0),
                stdout: "started".into(),
                stderr: String::new(),
            })
        }

        async fn down(
            &self,
            _project: &Project,
            _output: OutputMode,
            _cancel: CancelSignal,
        ) -> crate::error::Result<CommandOutput> {
            Ok(CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        }

        async fn status(&self, _project: &Project) -> crate::error::Result<ProjectStatus> {
            Ok(ProjectStatus::Running)
        }

        async fn config_check(&self, _project: &Project) -> crate::error::Result<()> {
            Ok(())
        }

        async fn logs(
            &self,
            _project: &Project,
            _output: OutputMode,
            _cancel: CancelSignal,
        ) -> crate::error::Result<CommandOutput> {
            Ok(CommandOutput::default())
        }
    }

    struct Harness {
        ctx: Arc<AppContext>,
        watcher: Watcher,
        git: Arc<FakeGit>,
        compose: Arc<FakeCompose>,
    }

    fn harness() -> Harness {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let projects = Arc::new(SqliteProjectRepository::new(db.clone(), None));
        let deployments = Arc::new(SqliteDeploymentRepository::new(db));
        let git = Arc::new(FakeGit::default());
        let compose = Arc::new(FakeCompose::default());

        let ctx = AppContext::with_services(
            Config::default(),
            projects,
            deployments,
            git.clone(),
            compose.clone(),
        );
        let orchestrator = Arc::new(DeploymentOrchestrator::new(ctx.clone()));
        Harness {
            watcher: Watcher::new(ctx.clone(), orchestrator),
            ctx,
            git,
            compose,
        }
    }

    fn seed_project(harness: &Harness, name: &str, local: &str, remote: &str) -> Project {
        let now = Utc::now();
        let dir = PathBuf::from(format!("/tmp/fake/{name}"));
        let project = Project {
            id: Uuid::new_v4(),
            name: name.into(),
            git_url: format!("https://example.com/{name}.git"),
            git_branch: "main".into(),
            git_auth: None,
            working_dir: dir.clone(),
            compose_files: vec!["docker-compose.yml".into()],
            compose_override: None,
            variables: vec![],
            status: ProjectStatus::Running,
            local_commit: Some(local.into()),
            remote_commit: Some(local.into()),
            auto_deploy: true,
            created_at: now,
            updated_at: now,
        };
        harness.ctx.projects.create(&project).unwrap();
        harness.git.set_local(&dir, local);
        harness.git.set_remote(&dir, remote);
        project
    }

    fn cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the whole test process.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_drift_triggers_exactly_one_deploy() {
        let h = harness();
        let project = seed_project(&h, "drifty", "c1", "c2");

        let report = h.watcher.sweep(cancel()).await;
        assert_eq!(report.checked, 1);
        assert_eq!(report.deployed, 1);
        assert_eq!(report.failed, 0);

        assert_eq!(h.compose.ups.lock().unwrap().as_slice(), &[project.id]);

        let fresh = h.ctx.projects.find_by_id(project.id).unwrap().unwrap();
        assert_eq!(fresh.local_commit.as_deref(), Some("c2"));
        assert_eq!(fresh.remote_commit.as_deref(), Some("c2"));
        assert_eq!(fresh.status, ProjectStatus::Running);

        let history = h.ctx.deployments.list_by_project(project.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].commit_hash, "c2");
        assert_eq!(history[0].status, crate::models::DeploymentStatus::Completed);
    }

    #[tokio::test]
    async fn test_in_sync_project_is_left_alone() {
        let h = harness();
        seed_project(&h, "steady", "c1", "c1");

        let report = h.watcher.sweep(cancel()).await;
        assert_eq!(report.deployed, 0);
        assert!(h.compose.ups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_deploy_disabled_is_skipped() {
        let h = harness();
        let mut project = seed_project(&h, "manual", "c1", "c2");
        project.auto_deploy = false;
        h.ctx.projects.update(&project).unwrap();

        let report = h.watcher.sweep(cancel()).await;
        assert_eq!(report.checked, 0);
        assert!(h.compose.ups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_the_sweep() {
        let h = harness();
        let broken = seed_project(&h, "broken", "c1", "c2");
        let healthy = seed_project(&h, "healthy", "c1", "c2");
        *h.git.fail_fetch_for.lock().unwrap() = Some(broken.working_dir.clone());

        let report = h.watcher.sweep(cancel()).await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.deployed, 1);
        assert_eq!(report.failed, 1);

        // The healthy project deployed; the broken one carries the error.
        assert_eq!(h.compose.ups.lock().unwrap().as_slice(), &[healthy.id]);
        let fresh = h.ctx.projects.find_by_id(broken.id).unwrap().unwrap();
        assert_eq!(fresh.status, ProjectStatus::Error);
    }

    #[tokio::test]
    async fn test_second_sweep_is_idempotent() {
        let h = harness();
        let project = seed_project(&h, "once", "c1", "c2");

        h.watcher.sweep(cancel()).await;
        let report = h.watcher.sweep(cancel()).await;

        assert_eq!(report.deployed, 0);
        assert_eq!(h.compose.ups.lock().unwrap().as_slice(), &[project.id]);
    }
}
