//! Project, session and queue operations.

use chrono::{DateTime, Utc};
use tracing::info;

use super::{is_unique_violation, stamp};
use crate::error::{Error, Result};
use crate::model::*;

impl super::Db {
    // -----------------------------------------------------------------------
    // Project
    // -----------------------------------------------------------------------

    /// Return the project, creating it on first use.
    ///
    /// The table admits a single row; a concurrent creator losing the race
    /// falls through to the read.
    pub async fn ensure_project(&self, name: &str, repo_path: Option<&str>) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(Error::Validation("project name must not be empty".into()));
        }

        let now = stamp(Utc::now());
        let inserted = sqlx::query(
            "INSERT INTO projects (id, name, repo_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT (singleton) DO NOTHING",
        )
        .bind(ProjectId::new().to_string())
        .bind(name.trim())
        .bind(repo_path)
        .bind(&now)
        .execute(self.pool())
        .await?
        .rows_affected();

        if inserted == 1 {
            info!(project = name, "project created");
        }
        self.get_project().await
    }

    pub async fn get_project(&self) -> Result<Project> {
        let row: Option<ProjectRow> = sqlx::query_as(
            "SELECT id, name, repo_path, created_at, updated_at FROM projects LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound("project".into()))?
            .try_into_project()
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Start a new session under the project.
    pub async fn create_session(&self, name: &str, description: Option<&str>) -> Result<Session> {
        if name.trim().is_empty() {
            return Err(Error::Validation("session name must not be empty".into()));
        }
        let project = self.get_project().await?;

        let id = SessionId::new();
        let now = stamp(Utc::now());
        sqlx::query(
            "INSERT INTO sessions (id, project_id, name, description, status, started_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5, ?5)",
        )
        .bind(id.to_string())
        .bind(project.id.to_string())
        .bind(name.trim())
        .bind(description)
        .bind(&now)
        .execute(self.pool())
        .await?;

        info!(session_id = %id, name, "session created");
        self.get_session(id).await
    }

    pub async fn get_session(&self, id: SessionId) -> Result<Session> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, project_id, name, description, status, started_at, ended_at, created_at, updated_at
             FROM sessions WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("session {id}")))?
            .try_into_session()
    }

    /// All sessions, newest first.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT id, project_id, name, description, status, started_at, ended_at, created_at, updated_at
             FROM sessions ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(SessionRow::try_into_session).collect()
    }

    /// Close a session. Ending an already-ended session is a conflict.
    pub async fn end_session(&self, id: SessionId) -> Result<Session> {
        let now = stamp(Utc::now());
        let rows_affected = sqlx::query(
            "UPDATE sessions SET status = 'ended', ended_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'active'",
        )
        .bind(&now)
        .bind(id.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let session = self.get_session(id).await?;
            return Err(Error::Conflict(format!(
                "session {id} is already {}",
                session.status
            )));
        }
        self.get_session(id).await
    }

    // -----------------------------------------------------------------------
    // Queues
    // -----------------------------------------------------------------------

    /// Create a queue in a session. Queue names are unique database-wide.
    pub async fn create_queue(
        &self,
        session_id: SessionId,
        name: &str,
        instructions: Option<&str>,
    ) -> Result<Queue> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("queue name must not be empty".into()));
        }
        // Surface an unknown session as NotFound rather than a FK failure.
        self.get_session(session_id).await?;

        let id = QueueId::new();
        let now = stamp(Utc::now());
        sqlx::query(
            "INSERT INTO queues (id, session_id, name, instructions, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)",
        )
        .bind(id.to_string())
        .bind(session_id.to_string())
        .bind(name)
        .bind(instructions)
        .bind(&now)
        .execute(self.pool())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Conflict(format!("queue name '{name}' already exists"))
            } else {
                Error::Database(e)
            }
        })?;

        info!(queue_id = %id, name, "queue created");
        self.get_queue(id).await
    }

    pub async fn get_queue(&self, id: QueueId) -> Result<Queue> {
        let row: Option<QueueRow> = sqlx::query_as(
            "SELECT id, session_id, name, instructions, status, created_at, updated_at
             FROM queues WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("queue {id}")))?
            .try_into_queue()
    }

    /// Look a queue up by name: exact match first, then case-insensitive.
    pub async fn get_queue_by_name(&self, name: &str) -> Result<Queue> {
        let name = name.trim();
        let rows: Vec<QueueRow> = sqlx::query_as(
            "SELECT id, session_id, name, instructions, status, created_at, updated_at
             FROM queues WHERE name = ?1 COLLATE NOCASE
             ORDER BY (name = ?1) DESC, created_at ASC",
        )
        .bind(name)
        .fetch_all(self.pool())
        .await?;

        let mut rows = rows.into_iter();
        match (rows.next(), rows.next()) {
            (None, _) => Err(Error::NotFound(format!("queue '{name}'"))),
            (Some(first), Some(second)) if first.name != name && second.name != name => {
                Err(Error::Conflict(format!(
                    "queue name '{name}' is ambiguous without matching case"
                )))
            }
            (Some(first), _) => first.try_into_queue(),
        }
    }

    /// Resolve a queue reference that may be an id or a name.
    pub async fn resolve_queue(&self, reference: &str) -> Result<Queue> {
        if let Ok(id) = reference.parse::<QueueId>() {
            match self.get_queue(id).await {
                Err(e) if e.is_not_found() => {}
                other => return other,
            }
        }
        self.get_queue_by_name(reference).await
    }

    /// Queues, optionally restricted to one session, oldest first.
    pub async fn list_queues(&self, session_id: Option<SessionId>) -> Result<Vec<Queue>> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            "SELECT id, session_id, name, instructions, status, created_at, updated_at
             FROM queues WHERE (?1 IS NULL OR session_id = ?1)
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(session_id.map(|s| s.to_string()))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(QueueRow::try_into_queue).collect()
    }

    /// Mark a queue ended. Its tasks are untouched.
    pub async fn end_queue(&self, id: QueueId) -> Result<Queue> {
        let now = stamp(Utc::now());
        let rows_affected = sqlx::query(
            "UPDATE queues SET status = 'ended', updated_at = ?1 WHERE id = ?2 AND status = 'active'",
        )
        .bind(&now)
        .bind(id.to_string())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let queue = self.get_queue(id).await?;
            return Err(Error::Conflict(format!(
                "queue {} is already {}",
                queue.name, queue.status
            )));
        }
        self.get_queue(id).await
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    name: String,
    repo_path: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProjectRow {
    fn try_into_project(self) -> Result<Project> {
        Ok(Project {
            id: self.id.parse()?,
            name: self.name,
            repo_path: self.repo_path,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    project_id: String,
    name: String,
    description: Option<String>,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SessionRow {
    fn try_into_session(self) -> Result<Session> {
        Ok(Session {
            id: self.id.parse()?,
            project_id: self.project_id.parse()?,
            name: self.name,
            description: self.description,
            status: self.status.parse()?,
            started_at: self.started_at,
            ended_at: self.ended_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    session_id: String,
    name: String,
    instructions: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl QueueRow {
    fn try_into_queue(self) -> Result<Queue> {
        Ok(Queue {
            id: self.id.parse()?,
            session_id: self.session_id.parse()?,
            name: self.name,
            instructions: self.instructions,
            status: self.status.parse()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
