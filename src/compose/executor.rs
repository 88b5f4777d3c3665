//! Compose subprocess execution engine
//!
//! One spawn path serves the blocking and streaming contracts: the child is
//! started in its own process group with both pipes captured, two reader
//! tasks drain stdout/stderr concurrently, and the parent waits on exit or
//! cancellation. Piping mode hands the host's stdio straight to the child.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    humanize_line, parse_ps_output, reduce_status, CancelSignal, CommandOutput, ComposeCommand,
    ComposeRunner, LineSource, OutputLine, OutputMode,
};
use crate::error::{Error, Result};
use crate::models::{Project, ProjectStatus};

/// Captured output is truncated past this point; the record stays useful
/// without letting a chatty build log exhaust memory.
const MAX_CAPTURE_BYTES: usize = 512 * 1024;

/// How long a TERM'd process group gets before it is KILL'd.
const KILL_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

/// Runs compose commands for projects.
#[derive(Debug, Clone)]
pub struct ComposeExecutor {
    bin: String,
}

impl ComposeExecutor {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// Blocking contract: wait for exit, capture everything.
    pub async fn run_blocking(
        &self,
        cmd: ComposeCommand,
        cancel: CancelSignal,
    ) -> Result<CommandOutput> {
        self.run_captured(cmd, None, cancel).await
    }

    /// Streaming contract: forward lines into `tx` while capturing.
    ///
    /// Channel sends are non-blocking attempts; when the consumer is slow
    /// or gone, lines are dropped rather than back-pressured into the
    /// subprocess pipes.
    pub async fn run_streaming(
        &self,
        cmd: ComposeCommand,
        tx: mpsc::Sender<OutputLine>,
        cancel: CancelSignal,
    ) -> Result<CommandOutput> {
        self.run_captured(cmd, Some(tx), cancel).await
    }

    /// Piping contract: the child inherits the host's stdout/stderr.
    pub async fn run_piping(
        &self,
        cmd: ComposeCommand,
        cancel: CancelSignal,
    ) -> Result<CommandOutput> {
        let op = cmd.op;
        let mut child = spawn(&cmd, Stdio::inherit(), Stdio::inherit())?;
        let pid = child.id();

        let exit = wait_or_cancel(&mut child, pid, cancel, op).await?;
        let output = CommandOutput {
            exit_code: exit.code(),
            stdout: String::new(),
            stderr: String::new(),
        };
        check_exit(op, output)
    }

    async fn run_captured(
        &self,
        cmd: ComposeCommand,
        tx: Option<mpsc::Sender<OutputLine>>,
        cancel: CancelSignal,
    ) -> Result<CommandOutput> {
        let op = cmd.op;
        let mut child = match spawn(&cmd, Stdio::piped(), Stdio::piped()) {
            Ok(child) => child,
            Err(e) => {
                if let Some(tx) = &tx {
                    let _ = tx.try_send(OutputLine::system(e.to_string()));
                }
                return Err(e);
            }
        };
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::process(op, "stdout pipe missing"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::process(op, "stderr pipe missing"))?;

        let out_reader = drain_lines(stdout, LineSource::Stdout, tx.clone());
        let err_reader = drain_lines(stderr, LineSource::Stderr, tx.clone());

        let wait_result = wait_or_cancel(&mut child, pid, cancel, op).await;

        // The readers run the pipes dry regardless of how the child went
        // down; join them before deciding anything.
        let stdout_text = out_reader.await.unwrap_or_default();
        let stderr_text = err_reader.await.unwrap_or_default();

        let exit = match wait_result {
            Ok(exit) => exit,
            Err(e) => {
                if let Some(tx) = &tx {
                    let _ = tx.try_send(OutputLine::system(e.to_string()));
                }
                return Err(e);
            }
        };

        let output = CommandOutput {
            exit_code: exit.code(),
            stdout: stdout_text,
            stderr: stderr_text,
        };

        match check_exit(op, output) {
            Ok(output) => Ok(output),
            Err(e) => {
                // Streaming callers learn about the failure on the same
                // channel the output flowed through, then it closes.
                if let Some(tx) = &tx {
                    let _ = tx.try_send(OutputLine::system(e.to_string()));
                }
                Err(e)
            }
        }
    }
}

fn spawn(cmd: &ComposeCommand, stdout: Stdio, stderr: Stdio) -> Result<Child> {
    debug!(program = %cmd.program, args = ?cmd.args, cwd = %cmd.cwd.display(), "spawning compose");

    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .envs(cmd.env.iter().cloned())
        .current_dir(&cmd.cwd)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true);

    // Own process group, so cancellation can take down the whole tree.
    #[cfg(unix)]
    command.process_group(0);

    command
        .spawn()
        .map_err(|e| Error::process(cmd.op, format!("failed to spawn '{}': {e}", cmd.program)))
}

/// Read one pipe line-by-line, forwarding each line (non-blocking) and
/// accumulating a bounded capture for the deployment record.
fn drain_lines<R>(
    reader: R,
    source: LineSource,
    tx: Option<mpsc::Sender<OutputLine>>,
) -> JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut captured = String::new();
        let mut truncated = false;

        while let Ok(Some(line)) = lines.next_line().await {
            let text = humanize_line(&line);

            if captured.len() < MAX_CAPTURE_BYTES {
                captured.push_str(&text);
                captured.push('\n');
            } else if !truncated {
                truncated = true;
                captured.push_str("... [output truncated]\n");
            }

            if let Some(tx) = &tx {
                // Full or closed: drop the line. The consumer being slow or
                // gone must never stall the subprocess.
                let _ = tx.try_send(OutputLine { source, text });
            }
        }

        captured
    })
}

/// Wait for the child to exit, or cancel it (process group TERM, grace,
/// then KILL) when the signal flips.
async fn wait_or_cancel(
    child: &mut Child,
    pid: Option<u32>,
    mut cancel: CancelSignal,
    op: &'static str,
) -> Result<std::process::ExitStatus> {
    tokio::select! {
        exit = child.wait() => {
            exit.map_err(|e| Error::process(op, format!("wait failed: {e}")))
        }
        _ = cancelled(&mut cancel) => {
            warn!(op, "cancellation requested, terminating process group");
            terminate_group(child, pid).await;
            Err(Error::process(op, "operation cancelled"))
        }
    }
}

/// Resolve only when the cancel signal flips to `true`. A dropped sender
/// means "no one can cancel anymore", not "cancel now".
async fn cancelled(rx: &mut CancelSignal) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
async fn terminate_group(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        let _ = child.kill().await;
        return;
    };

    let pgid = Pid::from_raw(pid as i32);
    let _ = killpg(pgid, Signal::SIGTERM);

    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
        return;
    }

    let _ = killpg(pgid, Signal::SIGKILL);
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_group(child: &mut Child, _pid: Option<u32>) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

fn check_exit(op: &'static str, output: CommandOutput) -> Result<CommandOutput> {
    if output.success() {
        Ok(output)
    } else {
        let code = output
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Err(Error::process_output(
            op,
            format!("exited with status {code}"),
            output.stdout,
            output.stderr,
        ))
    }
}

#[async_trait]
impl ComposeRunner for ComposeExecutor {
    async fn up(
        &self,
        project: &Project,
        output: OutputMode,
        cancel: CancelSignal,
    ) -> Result<CommandOutput> {
        let cmd = ComposeCommand::for_project(
            &self.bin,
            project,
            "up",
            &["up", "-d", "--remove-orphans"],
        );
        match output {
            OutputMode::Streaming(tx) => self.run_streaming(cmd, tx, cancel).await,
            OutputMode::Piping => self.run_piping(cmd, cancel).await,
        }
    }

    async fn down(
        &self,
        project: &Project,
        output: OutputMode,
        cancel: CancelSignal,
    ) -> Result<CommandOutput> {
        let cmd = ComposeCommand::for_project(
            &self.bin,
            project,
            "down",
            &["down", "--remove-orphans"],
        );
        match output {
            OutputMode::Streaming(tx) => self.run_streaming(cmd, tx, cancel).await,
            OutputMode::Piping => self.run_piping(cmd, cancel).await,
        }
    }

    async fn status(&self, project: &Project) -> Result<ProjectStatus> {
        let cmd = ComposeCommand::for_project(
            &self.bin,
            project,
            "ps",
            &["ps", "--all", "--format", "json"],
        );
        let (_, cancel) = super::cancel_channel();
        let output = self.run_blocking(cmd, cancel).await?;
        let containers = parse_ps_output(&output.stdout);
        Ok(reduce_status(&containers))
    }

    async fn config_check(&self, project: &Project) -> Result<()> {
        let cmd =
            ComposeCommand::for_project(&self.bin, project, "config", &["config", "--quiet"]);
        let (_, cancel) = super::cancel_channel();
        self.run_blocking(cmd, cancel).await?;
        Ok(())
    }

    async fn logs(
        &self,
        project: &Project,
        output: OutputMode,
        cancel: CancelSignal,
    ) -> Result<CommandOutput> {
        let cmd = ComposeCommand::for_project(
            &self.bin,
            project,
            "logs",
            &["logs", "--follow", "--no-color"],
        );
        match output {
            OutputMode::Streaming(tx) => self.run_streaming(cmd, tx, cancel).await,
            OutputMode::Piping => self.run_piping(cmd, cancel).await,
        }
    }
}
