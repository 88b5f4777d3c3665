//! Compose command construction
//!
//! Invocations are always argument arrays handed straight to the OS;
//! nothing is ever routed through a shell, and project variables travel as
//! process environment, never as files on disk.

use std::path::PathBuf;

use crate::models::Project;

/// A fully-specified compose invocation, ready to spawn.
#[derive(Debug, Clone)]
pub struct ComposeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    /// Label used in errors and logs (`up`, `down`, `ps`, ...).
    pub op: &'static str,
}

impl ComposeCommand {
    /// Build `<bin> compose -p <name> --file ... <op_args>` for a project.
    pub fn for_project(bin: &str, project: &Project, op: &'static str, op_args: &[&str]) -> Self {
        let mut args = vec![
            "compose".to_string(),
            "-p".to_string(),
            project.name.clone(),
        ];

        for file in &project.compose_files {
            args.push("--file".to_string());
            args.push(absolute(project, file));
        }
        // The override file comes last so its values win.
        if let Some(override_file) = &project.compose_override {
            args.push("--file".to_string());
            args.push(absolute(project, override_file));
        }

        args.extend(op_args.iter().map(|s| s.to_string()));

        Self {
            program: bin.to_string(),
            args,
            env: project.variables.clone(),
            cwd: project.working_dir.clone(),
            op,
        }
    }
}

fn absolute(project: &Project, file: &str) -> String {
    let path = PathBuf::from(file);
    if path.is_absolute() {
        file.to_string()
    } else {
        project.working_dir.join(path).to_string_lossy().into_owned()
    }
}
