//! Compose subprocess orchestration
//!
//! Builds and runs `docker compose` invocations in three modes:
//!
//! - **blocking**: wait for exit, capture output (introspection: `config`, `ps`)
//! - **streaming**: forward output line-by-line into one bounded channel
//! - **piping**: inherit the host's stdio (interactive CLI use)
//!
//! Streaming uses a lossy back-pressure policy: a full or abandoned channel
//! drops lines instead of stalling the subprocess pipes. Cancellation kills
//! the whole process group so no compose process outlives its caller.

mod command;
mod executor;
mod logs;
mod status;

pub use command::ComposeCommand;
pub use executor::ComposeExecutor;
pub use logs::humanize_line;
pub use status::{parse_ps_output, reduce_status, ContainerState};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::Result;
use crate::models::{Project, ProjectStatus};

/// Bound of the streaming output channel. Beyond this, lines are dropped.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Where a streamed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSource {
    Stdout,
    Stderr,
    /// Synthesized by dockhand itself (e.g. a terminal error notice).
    System,
}

/// One line of subprocess output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub source: LineSource,
    pub text: String,
}

impl OutputLine {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            source: LineSource::System,
            text: text.into(),
        }
    }
}

/// How a long-running compose operation delivers its output.
pub enum OutputMode {
    /// Forward lines into the given bounded channel (lossy on overflow).
    Streaming(mpsc::Sender<OutputLine>),
    /// Inherit the host's stdout/stderr directly.
    Piping,
}

/// Cancellation signal: flips to `true` when the operation should abort.
pub type CancelSignal = watch::Receiver<bool>;

/// A cancel channel pair with the conventional initial state.
pub fn cancel_channel() -> (watch::Sender<bool>, CancelSignal) {
    watch::channel(false)
}

/// Captured result of a finished compose invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, the way a terminal user would read it.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout.trim_end(), self.stderr)
        }
    }
}

/// Capability interface over the compose tool; tests substitute fakes.
#[async_trait]
pub trait ComposeRunner: Send + Sync {
    /// `up -d`: create/update the project's containers.
    async fn up(
        &self,
        project: &Project,
        output: OutputMode,
        cancel: CancelSignal,
    ) -> Result<CommandOutput>;

    /// `down`: stop and remove the project's containers.
    async fn down(
        &self,
        project: &Project,
        output: OutputMode,
        cancel: CancelSignal,
    ) -> Result<CommandOutput>;

    /// Aggregate container status via `ps --format json`.
    async fn status(&self, project: &Project) -> Result<ProjectStatus>;

    /// `config --quiet`: validate the compose files parse.
    async fn config_check(&self, project: &Project) -> Result<()>;

    /// `logs --follow`, streamed until cancelled.
    async fn logs(
        &self,
        project: &Project,
        output: OutputMode,
        cancel: CancelSignal,
    ) -> Result<CommandOutput>;
}
