//! CSV import and import job types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use thiserror::Error;
use uuid::Uuid;

/// How rows are applied against existing resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "import_mode", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportMode {
    #[serde(alias = "create")]
    Create,
    #[serde(alias = "update")]
    Update,
    #[serde(alias = "upsert")]
    Upsert,
}

impl Default for ImportMode {
    fn default() -> Self {
        ImportMode::Create
    }
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImportMode::Create => "CREATE",
            ImportMode::Update => "UPDATE",
            ImportMode::Upsert => "UPSERT",
        })
    }
}

impl FromStr for ImportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "create" => Ok(ImportMode::Create),
            "update" => Ok(ImportMode::Update),
            "upsert" => Ok(ImportMode::Upsert),
            _ => Err(format!("Invalid import mode '{}'. Expected create, update or upsert", s)),
        }
    }
}

/// One failed row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRowError {
    /// Data-row index + 2 (line 1 is the header)
    pub row: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub error: String,
}

impl fmt::Display for ImportRowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(ref code) => write!(f, "Row {} ({}): {}", self.row, code, self.error),
            None => write!(f, "Row {}: {}", self.row, self.error),
        }
    }
}

/// Result of one complete pipeline run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub total_rows: u32,
    pub success_count: u32,
    pub updated_count: u32,
    pub error_count: u32,
    pub errors: Vec<ImportRowError>,
    /// Wall-clock milliseconds for the whole batch
    pub processing_time: u64,
}

/// Pipeline result plus the ids of resources the run created
#[derive(Debug, Clone, Default)]
pub struct ImportOutcome {
    pub result: ImportResult,
    pub created_ids: Vec<Uuid>,
}

/// Dry-run report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub total_rows: u32,
    pub valid_rows: u32,
    pub invalid_rows: u32,
    pub errors: Vec<ImportRowError>,
    pub warnings: Vec<String>,
}

// ============================================================================
// Import job
// ============================================================================

/// Import job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "import_job_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    RolledBack,
}

impl ImportJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportJobStatus::Pending => "PENDING",
            ImportJobStatus::Processing => "PROCESSING",
            ImportJobStatus::Completed => "COMPLETED",
            ImportJobStatus::Failed => "FAILED",
            ImportJobStatus::RolledBack => "ROLLED_BACK",
        }
    }

    /// Allowed edges of the job state machine
    pub fn can_transition_to(&self, next: ImportJobStatus) -> bool {
        use ImportJobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, RolledBack)
        )
    }
}

impl fmt::Display for ImportJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state machine edge
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid import job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ImportJobStatus,
    pub to: ImportJobStatus,
}

/// Persisted import job aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_name: String,
    pub file_size: i64,
    pub total_rows: i32,
    pub processed_rows: i32,
    pub success_count: i32,
    pub updated_count: i32,
    pub error_count: i32,
    pub status: ImportJobStatus,
    pub mode: ImportMode,
    pub skip_errors: bool,
    pub errors: Vec<String>,
    /// Resources created by this job. Updated resources are not tracked.
    pub resource_ids: Vec<Uuid>,
    pub rollback_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped on every save
    pub version: i64,
}

impl ImportJob {
    /// New job in `PENDING`
    pub fn submit(
        user_id: Uuid,
        file_name: impl Into<String>,
        file_size: i64,
        total_rows: i32,
        mode: ImportMode,
        skip_errors: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            file_name: file_name.into(),
            file_size,
            total_rows,
            processed_rows: 0,
            success_count: 0,
            updated_count: 0,
            error_count: 0,
            status: ImportJobStatus::Pending,
            mode,
            skip_errors,
            errors: vec![],
            resource_ids: vec![],
            rollback_reason: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    fn transition(&mut self, next: ImportJobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError { from: self.status, to: next });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `PENDING -> PROCESSING`
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(ImportJobStatus::Processing)?;
        self.started_at = Some(self.updated_at);
        Ok(())
    }

    /// `PROCESSING -> COMPLETED`
    pub fn complete(&mut self, outcome: &ImportOutcome) -> Result<(), TransitionError> {
        self.transition(ImportJobStatus::Completed)?;
        let result = &outcome.result;
        // The line count estimate can disagree with the parser on quoted newlines.
        self.total_rows = result.total_rows as i32;
        self.processed_rows = result.total_rows as i32;
        self.success_count = (result.success_count + result.updated_count) as i32;
        self.updated_count = result.updated_count as i32;
        self.error_count = result.error_count as i32;
        self.errors = result.errors.iter().map(|e| e.to_string()).collect();
        self.resource_ids = outcome.created_ids.clone();
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// `PROCESSING -> FAILED`
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(ImportJobStatus::Failed)?;
        self.errors = vec![message.into()];
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// `COMPLETED -> ROLLED_BACK`
    pub fn roll_back(&mut self, reason: Option<String>) -> Result<(), TransitionError> {
        self.transition(ImportJobStatus::RolledBack)?;
        self.resource_ids.clear();
        self.rollback_reason = reason;
        Ok(())
    }
}

/// Outcome of a rollback command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub job_id: Uuid,
    pub deleted_count: u32,
    pub deleted_resource_ids: Vec<Uuid>,
    /// Ids whose deletion failed; logged and skipped
    pub failed_resource_ids: Vec<Uuid>,
    pub success: bool,
}

/// Import failures surfaced to callers
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Row {row}: {message}")]
    Row {
        row: usize,
        code: Option<String>,
        message: String,
    },
    #[error("Import job {0} not found")]
    JobNotFound(Uuid),
    #[error("Import job {0} belongs to another user")]
    NotOwner(Uuid),
    #[error("Import job {id} is {status}; only COMPLETED jobs can be rolled back")]
    InvalidState { id: Uuid, status: ImportJobStatus },
    #[error("Import job {0} was modified concurrently")]
    Conflict(Uuid),
    #[error("File is {size} bytes; synchronous imports are limited to {limit} bytes, use the asynchronous import")]
    FileTooLarge { size: usize, limit: usize },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ImportError {
    /// Stable code for error responses
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::Row { .. } => "ROW_ERROR",
            ImportError::JobNotFound(_) => "NOT_FOUND",
            ImportError::NotOwner(_) => "FORBIDDEN",
            ImportError::InvalidState { .. } | ImportError::Transition(_) => "INVALID_STATE",
            ImportError::Conflict(_) => "CONFLICT",
            ImportError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            ImportError::Storage(_) => "DATABASE_ERROR",
        }
    }
}

// ============================================================================
// Bus commands
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitImportCommand {
    #[serde(default)]
    pub correlation_id: String,
    pub user_id: Uuid,
    pub file_name: String,
    #[serde(default)]
    pub file_size: Option<i64>,
    pub csv_content: String,
    #[serde(default)]
    pub mode: ImportMode,
    #[serde(default)]
    pub skip_errors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetImportJobCommand {
    #[serde(default)]
    pub correlation_id: String,
    pub job_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackImportCommand {
    #[serde(default)]
    pub correlation_id: String,
    pub job_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateImportCommand {
    #[serde(default)]
    pub correlation_id: String,
    pub user_id: Uuid,
    pub csv_content: String,
    #[serde(default)]
    pub mode: ImportMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunImportCommand {
    #[serde(default)]
    pub correlation_id: String,
    pub user_id: Uuid,
    pub csv_content: String,
    #[serde(default)]
    pub mode: ImportMode,
    #[serde(default)]
    pub skip_errors: bool,
}
