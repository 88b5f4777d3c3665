//! Container status parsing and aggregate reduction
//!
//! `docker compose ps --all --format json` emits newline-delimited JSON,
//! one object per container. Each line is parsed independently: a malformed
//! line is logged and skipped, never fatal.

use serde::Deserialize;
use tracing::warn;

use crate::models::ProjectStatus;

/// One container row from `ps --format json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Service", default)]
    pub service: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i64,
}

impl ContainerState {
    fn is_running(&self) -> bool {
        self.state == "running"
    }

    fn is_clean_exit(&self) -> bool {
        !self.is_running() && self.exit_code == 0
    }
}

/// Parse newline-delimited JSON container listings.
pub fn parse_ps_output(raw: &str) -> Vec<ContainerState> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<ContainerState>(line) {
            Ok(container) => Some(container),
            Err(err) => {
                warn!(%err, line, "skipping malformed container status line");
                None
            }
        })
        .collect()
}

/// Reduce per-container states to one project status.
///
/// Zero-exit containers are excluded when judging partial failure: a
/// one-shot init container that finished cleanly does not make a running
/// stack "Failed". A stack consisting ONLY of clean exits is reported as
/// Unknown rather than guessed: there is nothing left running, but
/// nothing failed either.
pub fn reduce_status(containers: &[ContainerState]) -> ProjectStatus {
    if containers.is_empty() {
        return ProjectStatus::Stopped;
    }

    let running = containers.iter().filter(|c| c.is_running()).count();
    let clean_exits = containers.iter().filter(|c| c.is_clean_exit()).count();
    let failed = containers.len() - running - clean_exits;

    if running > 0 {
        if failed > 0 {
            ProjectStatus::Error
        } else {
            ProjectStatus::Running
        }
    } else if clean_exits == containers.len() {
        ProjectStatus::Unknown
    } else {
        ProjectStatus::Stopped
    }
}
