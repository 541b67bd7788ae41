//! Run read model.
//!
//! A run is one execution attempt of a command. Rows are created by
//! `CommandStarted` and terminated by `CommandSucceeded` / `CommandFailed`;
//! only projectors write them.

#[cfg(test)]
mod tests;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::auth::{Identity, Role};
use crate::core::Core;
use crate::error::CoreError;
use crate::events::Scope;

/// The lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Executing.
    Running,
    /// Finished successfully (terminal).
    Succeeded,
    /// Finished unsuccessfully (terminal).
    Failed,
}

impl RunStatus {
    /// Returns the string representation of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// Parses a status from its string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The run read model row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub run_id: String,
    /// Tenant scope.
    pub tenant_id: String,
    /// Project scope.
    pub project_id: String,
    /// The command this run executes.
    pub command_id: String,
    /// Current status.
    pub status: RunStatus,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When execution started (ms).
    pub started_ts: Option<i64>,
    /// When execution ended (ms).
    pub ended_ts: Option<i64>,
    /// Executor identity, when reported.
    pub executor: Option<String>,
    /// Failure description, recorded on `CommandFailed`.
    pub error: Option<String>,
    /// Id of the last event applied to this row.
    pub last_event_id: String,
}

const SELECT_RUN: &str = "SELECT run_id, tenant_id, project_id, command_id, status, attempt, \
     started_ts, ended_ts, executor, error, last_event_id FROM runs";

pub(crate) fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get(4)?;
    Ok(Run {
        run_id: row.get(0)?,
        tenant_id: row.get(1)?,
        project_id: row.get(2)?,
        command_id: row.get(3)?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        attempt: row.get(5)?,
        started_ts: row.get(6)?,
        ended_ts: row.get(7)?,
        executor: row.get(8)?,
        error: row.get(9)?,
        last_event_id: row.get(10)?,
    })
}

/// Loads a run within its scope. Cross-project ids come back as `None`.
pub(crate) fn load(
    conn: &Connection,
    scope: &Scope,
    run_id: &str,
) -> Result<Option<Run>, CoreError> {
    let sql = format!("{SELECT_RUN} WHERE run_id = ?1 AND tenant_id = ?2 AND project_id = ?3");
    let run = conn
        .prepare(&sql)?
        .query_row(
            params![run_id, scope.tenant_id, scope.project_id],
            row_to_run,
        )
        .optional()?;
    Ok(run)
}

/// Returns all runs of a command, oldest first.
pub(crate) fn for_command(
    conn: &Connection,
    scope: &Scope,
    command_id: &str,
) -> Result<Vec<Run>, CoreError> {
    let sql = format!(
        "{SELECT_RUN} WHERE command_id = ?1 AND tenant_id = ?2 AND project_id = ?3 ORDER BY run_id ASC"
    );
    let runs = conn
        .prepare(&sql)?
        .query_map(
            params![command_id, scope.tenant_id, scope.project_id],
            row_to_run,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(runs)
}

impl Core {
    /// Looks up a run in the caller's project. Any member role.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] for unknown or cross-project ids.
    pub fn get_run(
        &self,
        ident: &Identity,
        project_id: &str,
        run_id: &str,
    ) -> Result<Run, CoreError> {
        let ctx = self.guard(
            ident,
            project_id,
            &[Role::Owner, Role::Operator, Role::Viewer, Role::Bot],
        )?;
        self.store()
            .with_conn(|conn| load(conn, &ctx.scope(), run_id))?
            .ok_or_else(|| CoreError::not_found("run", run_id))
    }

    /// Lists a command's runs, oldest first. Any member role.
    ///
    /// # Errors
    ///
    /// Returns an error when the caller is not a member or the query fails.
    pub fn runs_for_command(
        &self,
        ident: &Identity,
        project_id: &str,
        command_id: &str,
    ) -> Result<Vec<Run>, CoreError> {
        let ctx = self.guard(
            ident,
            project_id,
            &[Role::Owner, Role::Operator, Role::Viewer, Role::Bot],
        )?;
        self.store()
            .with_conn(|conn| for_command(conn, &ctx.scope(), command_id))
    }
}
