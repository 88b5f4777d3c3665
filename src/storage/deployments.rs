//! Sqlite-backed deployment repository
//!
//! A deployment record is append-mostly: it is created in-progress,
//! finalized exactly once, and never touched again.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{Database, DeploymentRepository};
use crate::error::{Error, Result};
use crate::models::{Deployment, DeploymentStatus};

pub struct SqliteDeploymentRepository {
    db: Database,
}

impl SqliteDeploymentRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn row_to_deployment(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    let id: String = row.get("id")?;
    let project_id: String = row.get("project_id")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Deployment {
        id: parse_uuid(&id)?,
        project_id: parse_uuid(&project_id)?,
        commit_hash: row.get("commit_hash")?,
        status: DeploymentStatus::parse(&status),
        stdout: row.get("stdout")?,
        stderr: row.get("stderr")?,
        created_at: parse_time(&created_at),
        updated_at: parse_time(&updated_at),
    })
}

impl DeploymentRepository for SqliteDeploymentRepository {
    fn create(&self, deployment: &Deployment) -> Result<()> {
        let conn = self.db.conn.lock();
        conn.execute(
            "INSERT INTO deployments (id, project_id, commit_hash, status, stdout, stderr,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                deployment.id.to_string(),
                deployment.project_id.to_string(),
                deployment.commit_hash,
                deployment.status.as_str(),
                deployment.stdout,
                deployment.stderr,
                deployment.created_at.to_rfc3339(),
                deployment.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn update(&self, deployment: &Deployment) -> Result<()> {
        let conn = self.db.conn.lock();

        // Status transitions are one-way; a finalized record is immutable.
        let existing: Option<String> = conn
            .query_row(
                "SELECT status FROM deployments WHERE id = ?1",
                params![deployment.id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some(existing) = existing else {
            return Err(Error::not_found("deployment", deployment.id.to_string()));
        };
        if DeploymentStatus::parse(&existing).is_terminal() {
            return Err(Error::validation(format!(
                "deployment {} is already {existing} and cannot change",
                deployment.id
            )));
        }

        conn.execute(
            "UPDATE deployments SET status = ?2, stdout = ?3, stderr = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                deployment.id.to_string(),
                deployment.status.as_str(),
                deployment.stdout,
                deployment.stderr,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn find_by_id(&self, id: Uuid) -> Result<Option<Deployment>> {
        let conn = self.db.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, commit_hash, status, stdout, stderr, created_at, updated_at
             FROM deployments WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_deployment(row)?)),
            None => Ok(None),
        }
    }

    fn list_by_project(&self, project_id: Uuid) -> Result<Vec<Deployment>> {
        let conn = self.db.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, commit_hash, status, stdout, stderr, created_at, updated_at
             FROM deployments WHERE project_id = ?1
             ORDER BY created_at DESC",
        )?;
        let mut rows = stmt.query(params![project_id.to_string()])?;
        let mut deployments = Vec::new();
        while let Some(row) = rows.next()? {
            deployments.push(row_to_deployment(row)?);
        }
        Ok(deployments)
    }

    fn delete_by_project(&self, project_id: Uuid) -> Result<()> {
        let conn = self.db.conn.lock();
        conn.execute(
            "DELETE FROM deployments WHERE project_id = ?1",
            params![project_id.to_string()],
        )?;
        Ok(())
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
