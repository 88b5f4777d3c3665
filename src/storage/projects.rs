//! Sqlite-backed project repository
//!
//! Credentials are encrypted on the way in and decrypted on the way out.
//! An undecryptable credential (rotated key, corrupted row) does NOT fail
//! the load: the project comes back with `git_auth = None` and a warning,
//! and the eventual Git operation reports the missing auth explicitly.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tracing::warn;
use uuid::Uuid;

use super::{Database, ProjectRepository};
use crate::error::{Error, Result};
use crate::models::{Project, ProjectStatus};
use crate::vault::CredentialVault;

pub struct SqliteProjectRepository {
    db: Database,
    vault: Option<Arc<CredentialVault>>,
}

impl SqliteProjectRepository {
    pub fn new(db: Database, vault: Option<Arc<CredentialVault>>) -> Self {
        Self { db, vault }
    }

    fn encrypt_auth(&self, project: &Project) -> Result<(Option<String>, Option<String>)> {
        match &project.git_auth {
            None => Ok((None, None)),
            Some(auth) => {
                let vault = self.vault.as_ref().ok_or_else(|| {
                    Error::validation(
                        "DOCKHAND_SECRET_KEY must be set to store git credentials",
                    )
                })?;
                let (tag, cipher) = vault.encrypt(auth)?;
                Ok((Some(tag), Some(cipher)))
            }
        }
    }

    fn row_to_project(&self, row: &Row<'_>) -> rusqlite::Result<Project> {
        let id: String = row.get("id")?;
        let name: String = row.get("name")?;
        let auth_type: Option<String> = row.get("auth_type")?;
        let auth_cipher: Option<String> = row.get("auth_cipher")?;
        let working_dir: String = row.get("working_dir")?;
        let compose_files: String = row.get("compose_files")?;
        let variables: String = row.get("variables")?;
        let status: String = row.get("status")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        let git_auth = match (auth_type, auth_cipher) {
            (Some(tag), Some(cipher)) => match &self.vault {
                Some(vault) => match vault.decrypt(&tag, &cipher) {
                    Ok(auth) => Some(auth),
                    Err(err) => {
                        warn!(project = %name, %err, "stored git credentials are unreadable, loading project without auth");
                        None
                    }
                },
                None => {
                    warn!(project = %name, "no secret key configured, loading project without auth");
                    None
                }
            },
            _ => None,
        };

        Ok(Project {
            id: parse_uuid(&id)?,
            name,
            git_url: row.get("git_url")?,
            git_branch: row.get("git_branch")?,
            git_auth,
            working_dir: PathBuf::from(working_dir),
            compose_files: serde_json::from_str(&compose_files).unwrap_or_default(),
            compose_override: row.get("compose_override")?,
            variables: serde_json::from_str(&variables).unwrap_or_default(),
            status: ProjectStatus::parse(&status),
            local_commit: row.get("local_commit")?,
            remote_commit: row.get("remote_commit")?,
            auto_deploy: row.get::<_, i64>("auto_deploy")? != 0,
            created_at: parse_time(&created_at),
            updated_at: parse_time(&updated_at),
        })
    }

    fn query_one(&self, sql: &str, param: &str) -> Result<Option<Project>> {
        let conn = self.db.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params![param])?;
        match rows.next()? {
            Some(row) => Ok(Some(self.row_to_project(row)?)),
            None => Ok(None),
        }
    }
}

const SELECT_COLUMNS: &str = "id, name, git_url, git_branch, auth_type, auth_cipher, \
     working_dir, compose_files, compose_override, variables, status, \
     local_commit, remote_commit, auto_deploy, created_at, updated_at";

impl ProjectRepository for SqliteProjectRepository {
    fn create(&self, project: &Project) -> Result<()> {
        project.validate()?;
        let (auth_type, auth_cipher) = self.encrypt_auth(project)?;

        let conn = self.db.conn.lock();
        conn.execute(
            "INSERT INTO projects (id, name, git_url, git_branch, auth_type, auth_cipher,
                working_dir, compose_files, compose_override, variables, status,
                local_commit, remote_commit, auto_deploy, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                project.id.to_string(),
                project.name,
                project.git_url,
                project.git_branch,
                auth_type,
                auth_cipher,
                project.working_dir.to_string_lossy().to_string(),
                serde_json::to_string(&project.compose_files).unwrap_or_default(),
                project.compose_override,
                serde_json::to_string(&project.variables).unwrap_or_default(),
                project.status.as_str(),
                project.local_commit,
                project.remote_commit,
                project.auto_deploy as i64,
                project.created_at.to_rfc3339(),
                project.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn update(&self, project: &Project) -> Result<()> {
        project.validate()?;
        let (auth_type, auth_cipher) = self.encrypt_auth(project)?;

        let conn = self.db.conn.lock();
        let changed = conn.execute(
            "UPDATE projects SET name = ?2, git_url = ?3, git_branch = ?4,
                auth_type = ?5, auth_cipher = ?6, working_dir = ?7,
                compose_files = ?8, compose_override = ?9, variables = ?10,
                status = ?11, local_commit = ?12, remote_commit = ?13,
                auto_deploy = ?14, updated_at = ?15
             WHERE id = ?1",
            params![
                project.id.to_string(),
                project.name,
                project.git_url,
                project.git_branch,
                auth_type,
                auth_cipher,
                project.working_dir.to_string_lossy().to_string(),
                serde_json::to_string(&project.compose_files).unwrap_or_default(),
                project.compose_override,
                serde_json::to_string(&project.variables).unwrap_or_default(),
                project.status.as_str(),
                project.local_commit,
                project.remote_commit,
                project.auto_deploy as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found("project", project.id.to_string()));
        }
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        let conn = self.db.conn.lock();
        let changed = conn.execute(
            "DELETE FROM projects WHERE id = ?1",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("project", id.to_string()));
        }
        Ok(())
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<Project>> {
        self.query_one(
            &format!("SELECT {SELECT_COLUMNS} FROM projects WHERE id = ?1"),
            &id.to_string(),
        )
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Project>> {
        self.query_one(
            &format!("SELECT {SELECT_COLUMNS} FROM projects WHERE name = ?1"),
            name,
        )
    }

    fn list(&self) -> Result<Vec<Project>> {
        let conn = self.db.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM projects ORDER BY name"))?;
        let mut rows = stmt.query([])?;
        let mut projects = Vec::new();
        while let Some(row) = rows.next()? {
            projects.push(self.row_to_project(row)?);
        }
        Ok(projects)
    }
}

fn parse_uuid(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
