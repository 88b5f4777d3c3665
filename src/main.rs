use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _, Result};
use clap::{Parser, Subcommand};
use colored::*;
use tokio::sync::mpsc;

use dockhand::compose::{cancel_channel, LineSource, OutputMode, OUTPUT_CHANNEL_CAPACITY};
use dockhand::{
    AppContext, Config, DeploymentOrchestrator, GitAuth, NewProject, Project, Watcher,
};

#[derive(Parser)]
#[command(name = "dockhand")]
#[command(
    about = "GitOps deployment for docker compose projects - track a branch, detect drift, redeploy",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a project: clone its repository and store its settings
    Create {
        /// Project name (also the compose project name)
        name: String,

        /// Git repository URL
        url: String,

        /// Branch to track (defaults to the remote default branch)
        #[arg(short, long)]
        branch: Option<String>,

        /// Compose file(s), in order (defaults to docker-compose.yml)
        #[arg(short, long = "file")]
        files: Vec<String>,

        /// Override file applied after the compose files
        #[arg(long)]
        override_file: Option<String>,

        /// KEY=VALUE pairs passed to compose as environment
        #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
        variables: Vec<String>,

        /// HTTP auth username
        #[arg(long)]
        username: Option<String>,

        /// HTTP auth password/token
        #[arg(long)]
        password: Option<String>,

        /// Path to an SSH private key
        #[arg(long)]
        ssh_key: Option<PathBuf>,

        /// SSH user (defaults to the one in the URL)
        #[arg(long)]
        ssh_user: Option<String>,

        /// Redeploy automatically when the remote branch moves
        #[arg(long)]
        auto_deploy: bool,
    },

    /// Deploy a project now
    Deploy {
        name: String,

        /// Skip the git pull and deploy the checkout as-is
        #[arg(long)]
        no_pull: bool,
    },

    /// Stop a project's containers
    Stop { name: String },

    /// Stop a project, delete its checkout and all records
    Remove { name: String },

    /// List all projects
    List,

    /// Show a project's live status and recent deployments
    Status { name: String },

    /// Follow a project's container logs
    Logs { name: String },

    /// Run the drift-detection loop until interrupted
    Watch,

    /// Validate credentials against a remote without storing anything
    CheckAuth {
        url: String,

        #[arg(long)]
        username: Option<String>,

        #[arg(long)]
        password: Option<String>,

        #[arg(long)]
        ssh_key: Option<PathBuf>,

        #[arg(long)]
        ssh_user: Option<String>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(matches!(cli.command, Commands::Watch));

    let config = Config::from_env()?;
    let ctx = AppContext::initialize(config)?;
    let orchestrator = Arc::new(DeploymentOrchestrator::new(ctx.clone()));

    match cli.command {
        Commands::Create {
            name,
            url,
            branch,
            files,
            override_file,
            variables,
            username,
            password,
            ssh_key,
            ssh_user,
            auto_deploy,
        } => {
            let git_auth = build_auth(username, password, ssh_key, ssh_user)?;
            let compose_files = if files.is_empty() {
                vec!["docker-compose.yml".to_string()]
            } else {
                files
            };

            println!("{}", format!("⚓ Registering '{name}'...").cyan().bold());
            let project = orchestrator
                .register(NewProject {
                    name,
                    git_url: url,
                    git_branch: branch.unwrap_or_default(),
                    git_auth,
                    compose_files,
                    compose_override: override_file,
                    variables: parse_variables(&variables)?,
                    auto_deploy,
                })
                .await?;

            println!(
                "{} Project registered on branch {} at {}",
                "✓".green(),
                project.git_branch.bright_yellow(),
                short_commit(project.local_commit.as_deref()).bright_black()
            );
            println!(
                "\n{}",
                format!("Next: dockhand deploy {}", project.name).yellow()
            );
        }

        Commands::Deploy { name, no_pull } => {
            let project = find_project(&ctx, &name)?;
            println!("{}", format!("🚀 Deploying '{name}'...").cyan().bold());

            let (_cancel_tx, cancel_rx) = cancel_channel();
            let deployment = orchestrator
                .deploy(project.id, !no_pull, OutputMode::Piping, cancel_rx)
                .await?;

            println!(
                "{} Deployed {} ({})",
                "✓".green(),
                name.bright_white(),
                short_commit(Some(&deployment.commit_hash)).bright_yellow()
            );
        }

        Commands::Stop { name } => {
            let project = find_project(&ctx, &name)?;
            let (_cancel_tx, cancel_rx) = cancel_channel();
            orchestrator
                .stop(project.id, OutputMode::Piping, cancel_rx)
                .await?;
            println!("{} '{name}' stopped", "✓".green());
        }

        Commands::Remove { name } => {
            let project = find_project(&ctx, &name)?;
            let (_cancel_tx, cancel_rx) = cancel_channel();
            orchestrator
                .remove(project.id, OutputMode::Piping, cancel_rx)
                .await?;
            println!("{} '{name}' removed", "✓".green());
        }

        Commands::List => {
            let projects = ctx.projects.list()?;
            if projects.is_empty() {
                println!("No projects. Add one with {}", "dockhand create".bright_white());
                return Ok(());
            }
            for project in projects {
                println!(
                    "{:<24} {:<10} {:<12} {}  {}",
                    project.name.bright_white(),
                    paint_status(&project),
                    project.git_branch,
                    short_commit(project.local_commit.as_deref()).bright_black(),
                    if project.auto_deploy {
                        "auto".cyan()
                    } else {
                        "manual".bright_black()
                    }
                );
            }
        }

        Commands::Status { name } => {
            let project = find_project(&ctx, &name)?;
            let status = orchestrator.refresh_status(project.id).await?;
            println!(
                "{} is {}",
                name.bright_white().bold(),
                format!("{status:?}").to_lowercase()
            );

            let history = ctx.deployments.list_by_project(project.id)?;
            if !history.is_empty() {
                println!("\n{}", "Recent deployments".cyan().bold());
                for deployment in history.iter().take(5) {
                    println!(
                        "  {} {:<12} {}",
                        deployment
                            .created_at
                            .format("%Y-%m-%d %H:%M:%S")
                            .to_string()
                            .bright_black(),
                        deployment.status.as_str(),
                        short_commit(Some(&deployment.commit_hash)).bright_yellow()
                    );
                }
            }
        }

        Commands::Logs { name } => {
            let project = find_project(&ctx, &name)?;
            stream_logs(&ctx, project).await?;
        }

        Commands::Watch => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                let _ = shutdown_tx.send(true);
            });

            println!(
                "{}",
                format!(
                    "👁  Watching {} project(s) every {:?} (Ctrl-C to stop)",
                    ctx.projects.list()?.iter().filter(|p| p.auto_deploy).count(),
                    ctx.config.poll_interval
                )
                .cyan()
                .bold()
            );

            Watcher::new(ctx, orchestrator).run(shutdown_rx).await;
        }

        Commands::CheckAuth {
            url,
            username,
            password,
            ssh_key,
            ssh_user,
        } => {
            let auth = build_auth(username, password, ssh_key, ssh_user)?;
            let git = ctx.git.clone();
            dockhand::git::with_timeout(ctx.config.git_timeout, "ls-remote", move || {
                git.test_auth(&url, auth.as_ref())
            })
            .await?;
            println!("{} Authentication succeeded", "✓".green());
        }
    }

    Ok(())
}

fn init_tracing(with_file_log: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if with_file_log {
        let appender = tracing_appender::rolling::daily(".dockhand/logs", "dockhand.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // The guard must outlive the process; watch mode never returns it.
        std::mem::forget(guard);
        fmt().with_env_filter(filter).with_writer(writer).init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn find_project(ctx: &AppContext, name: &str) -> Result<Project> {
    ctx.projects
        .find_by_name(name)?
        .ok_or_else(|| anyhow!("no project named '{name}'"))
}

/// Exactly one auth scheme, or none: HTTP credentials and an SSH key are
/// mutually exclusive.
fn build_auth(
    username: Option<String>,
    password: Option<String>,
    ssh_key: Option<PathBuf>,
    ssh_user: Option<String>,
) -> Result<Option<GitAuth>> {
    match (username, password, ssh_key) {
        (None, None, None) => Ok(None),
        (Some(username), Some(password), None) => Ok(Some(GitAuth::Http { username, password })),
        (None, None, Some(key_path)) => {
            let private_key = std::fs::read_to_string(&key_path)
                .with_context(|| format!("reading ssh key {}", key_path.display()))?;
            Ok(Some(GitAuth::Ssh {
                private_key,
                user: ssh_user.unwrap_or_default(),
            }))
        }
        (_, _, Some(_)) => {
            bail!("--ssh-key cannot be combined with --username/--password")
        }
        _ => bail!("--username and --password must be given together"),
    }
}

fn parse_variables(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("invalid --env '{pair}', expected KEY=VALUE"))
        })
        .collect()
}

fn short_commit(commit: Option<&str>) -> String {
    match commit {
        Some(hash) if hash.len() >= 7 => hash[..7].to_string(),
        Some(hash) => hash.to_string(),
        None => "-------".to_string(),
    }
}

fn paint_status(project: &Project) -> ColoredString {
    use dockhand::ProjectStatus::*;
    match project.status {
        Running => "running".green(),
        Stopped => "stopped".bright_black(),
        Error => "error".red(),
        Unknown => "unknown".yellow(),
    }
}

/// Stream `compose logs --follow` to the terminal until Ctrl-C.
async fn stream_logs(ctx: &Arc<AppContext>, project: Project) -> Result<()> {
    let (cancel_tx, cancel_rx) = cancel_channel();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        let _ = cancel_tx.send(true);
    });

    let (tx, mut rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let compose = ctx.compose.clone();
    let handle = tokio::spawn(async move {
        compose
            .logs(&project, OutputMode::Streaming(tx), cancel_rx)
            .await
    });

    while let Some(line) = rx.recv().await {
        match line.source {
            LineSource::System => eprintln!("{}", line.text.red()),
            _ => println!("{}", line.text),
        }
    }

    // Cancellation surfaces as an error from the follow process; only real
    // failures matter here.
    match handle.await? {
        Ok(_) => Ok(()),
        Err(err) if err.to_string().contains("cancelled") => Ok(()),
        Err(err) => Err(err.into()),
    }
}
