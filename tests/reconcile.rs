//! End-to-end reconciliation: a real Git upstream advances, the watcher
//! notices, and the orchestrator deploys the new commit. Only the compose
//! tool is faked; Git, storage, and the loop are the real implementations.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use git2::{Repository, Signature};
use tempfile::TempDir;
use tokio::sync::watch;
use uuid::Uuid;

use dockhand::compose::{CancelSignal, CommandOutput, ComposeRunner, OutputMode};
use dockhand::storage::{Database, SqliteDeploymentRepository, SqliteProjectRepository};
use dockhand::{
    AppContext, Config, DeploymentOrchestrator, DeploymentStatus, GitSynchronizer, NewProject,
    Project, ProjectStatus, Watcher,
};

/// Compose fake that reports success and remembers every `up`.
#[derive(Default)]
struct RecordingCompose {
    ups: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl ComposeRunner for RecordingCompose {
    async fn up(
        &self,
        project: &Project,
        _output: OutputMode,
        _cancel: CancelSignal,
    ) -> dockhand::Result<CommandOutput> {
        self.ups.lock().unwrap().push(project.id);
        Ok(CommandOutput {
            exit_code: Some(0),
            stdout: "Container started".into(),
            stderr: String::new(),
        })
    }

    async fn down(
        &self,
        _project: &Project,
        _output: OutputMode,
        _cancel: CancelSignal,
    ) -> dockhand::Result<CommandOutput> {
        Ok(CommandOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    }

    async fn status(&self, _project: &Project) -> dockhand::Result<ProjectStatus> {
        Ok(ProjectStatus::Running)
    }

    async fn config_check(&self, _project: &Project) -> dockhand::Result<()> {
        Ok(())
    }

    async fn logs(
        &self,
        _project: &Project,
        _output: OutputMode,
        _cancel: CancelSignal,
    ) -> dockhand::Result<CommandOutput> {
        Ok(CommandOutput::default())
    }
}

fn commit_file(repo: &Repository, name: &str, content: &str) -> String {
    std::fs::write(repo.workdir().unwrap().join(name), content).unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new(name)).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::now("tester", "tester@example.com").unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<_> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, "update", &tree, &parents)
        .unwrap()
        .to_string()
}

struct World {
    ctx: Arc<AppContext>,
    orchestrator: Arc<DeploymentOrchestrator>,
    compose: Arc<RecordingCompose>,
    upstream: Repository,
    upstream_url: String,
    _tmp: TempDir,
}

fn world() -> World {
    let tmp = TempDir::new().unwrap();

    let upstream_path = tmp.path().join("upstream");
    let mut opts = git2::RepositoryInitOptions::new();
    opts.initial_head("main");
    let upstream = Repository::init_opts(&upstream_path, &opts).unwrap();
    commit_file(&upstream, "docker-compose.yml", "services:\n  web:\n    image: nginx\n");

    let db = Database::in_memory().unwrap();
    db.initialize().unwrap();
    let compose = Arc::new(RecordingCompose::default());
    let ctx = AppContext::with_services(
        Config {
            data_dir: tmp.path().join("data"),
            ..Default::default()
        },
        Arc::new(SqliteProjectRepository::new(db.clone(), None)),
        Arc::new(SqliteDeploymentRepository::new(db)),
        Arc::new(GitSynchronizer::new()),
        compose.clone(),
    );
    let orchestrator = Arc::new(DeploymentOrchestrator::new(ctx.clone()));

    World {
        upstream_url: upstream_path.to_string_lossy().into_owned(),
        ctx,
        orchestrator,
        compose,
        upstream,
        _tmp: tmp,
    }
}

fn no_cancel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    std::mem::forget(tx);
    rx
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn register_then_watch_reconciles_upstream_drift() {
    let w = world();

    // Register: clones the upstream and records the initial commit.
    let project = w
        .orchestrator
        .register(NewProject {
            name: "web".into(),
            git_url: w.upstream_url.clone(),
            git_branch: String::new(),
            git_auth: None,
            compose_files: vec!["docker-compose.yml".into()],
            compose_override: None,
            variables: vec![],
            auto_deploy: true,
        })
        .await
        .unwrap();

    assert_eq!(project.git_branch, "main");
    let c1 = project.local_commit.clone().expect("clone resolves HEAD");

    // First deploy pins c1.
    w.orchestrator
        .deploy(project.id, true, OutputMode::Piping, no_cancel())
        .await
        .unwrap();

    // In sync: a sweep deploys nothing.
    let watcher = Watcher::new(w.ctx.clone(), w.orchestrator.clone());
    let report = watcher.sweep(no_cancel()).await;
    assert_eq!(report.deployed, 0);

    // Upstream advances to c2.
    let c2 = commit_file(
        &w.upstream,
        "docker-compose.yml",
        "services:\n  web:\n    image: nginx:1.27\n",
    );
    assert_ne!(c1, c2);

    // The next sweep detects the drift and deploys exactly once.
    let report = watcher.sweep(no_cancel()).await;
    assert_eq!(report.checked, 1);
    assert_eq!(report.deployed, 1);
    assert_eq!(report.failed, 0);

    let fresh = w.ctx.projects.find_by_id(project.id).unwrap().unwrap();
    assert_eq!(fresh.local_commit.as_deref(), Some(c2.as_str()));
    assert_eq!(fresh.remote_commit.as_deref(), Some(c2.as_str()));
    assert_eq!(fresh.status, ProjectStatus::Running);

    // The checkout itself moved to c2.
    let checkout = Repository::open(&fresh.working_dir).unwrap();
    assert_eq!(
        checkout.head().unwrap().peel_to_commit().unwrap().id().to_string(),
        c2
    );

    // History: first deploy at c1, reconciliation deploy at c2, both
    // completed, newest first.
    let history = w.ctx.deployments.list_by_project(project.id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].commit_hash, c2);
    assert_eq!(history[0].status, DeploymentStatus::Completed);
    assert_eq!(history[1].commit_hash, c1);

    // And the sweep after that is a no-op again.
    let report = watcher.sweep(no_cancel()).await;
    assert_eq!(report.deployed, 0);
    assert_eq!(w.compose.ups.lock().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_deletes_checkout_and_records() {
    let w = world();

    let project = w
        .orchestrator
        .register(NewProject {
            name: "short-lived".into(),
            git_url: w.upstream_url.clone(),
            git_branch: "main".into(),
            git_auth: None,
            compose_files: vec!["docker-compose.yml".into()],
            compose_override: None,
            variables: vec![],
            auto_deploy: false,
        })
        .await
        .unwrap();
    assert!(project.working_dir.exists());

    w.orchestrator
        .deploy(project.id, false, OutputMode::Piping, no_cancel())
        .await
        .unwrap();

    w.orchestrator
        .remove(project.id, OutputMode::Piping, no_cancel())
        .await
        .unwrap();

    assert!(!project.working_dir.exists());
    assert!(w.ctx.projects.find_by_name("short-lived").unwrap().is_none());
    assert!(w
        .ctx
        .deployments
        .list_by_project(project.id)
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn watcher_loop_stops_on_shutdown() {
    let w = world();
    let watcher = Watcher::new(w.ctx.clone(), w.orchestrator.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { watcher.run(shutdown_rx).await });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("watcher must exit promptly after shutdown")
        .unwrap();
}
