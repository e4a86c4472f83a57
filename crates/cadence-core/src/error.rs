use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// StateError — precondition violations
// ---------------------------------------------------------------------------

/// A precondition was not met. Nothing has been mutated when one of these is
/// returned; fix the named condition and retry.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("not initialized: run Project::init first")]
    NotInitialized,

    #[error("uncommitted files: [{}]; commit or discard before retrying", files.join(", "))]
    DirtyWorkingTree { files: Vec<String> },

    #[error("a transaction is already in progress")]
    TransactionInProgress,

    #[error("exclusive operation in progress: {0}; retry after it finishes")]
    ExclusiveOperation(String),

    #[error("repository unavailable: {0}")]
    RepositoryUnavailable(String),

    #[error("epic {0} not found")]
    EpicNotFound(u32),

    #[error("epic {0} already exists")]
    EpicExists(u32),

    #[error("story {epic}.{story} not found")]
    StoryNotFound { epic: u32, story: u32 },

    #[error("story {epic}.{story} already exists")]
    StoryExists { epic: u32, story: u32 },

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("invalid identifier '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidIdentifier(String),

    #[error("epic and story numbers must be positive")]
    ZeroNumber,
}

// ---------------------------------------------------------------------------
// RecordError — record file parsing
// ---------------------------------------------------------------------------

/// A record file could not be parsed. Always names the offending file —
/// malformed metadata is a fatal error during migration and consistency
/// checks, never silently skipped.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("{path}: missing metadata block")]
    MissingMetadata { path: PathBuf },

    #[error("{path}: malformed metadata block: {reason}")]
    MalformedMetadata { path: PathBuf, reason: String },

    #[error("{path}: metadata names {found}, expected {expected}")]
    WrongEntity {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("invalid status value: {0}")]
    InvalidStatus(String),

    #[error("record file not found: {0}")]
    NotFound(PathBuf),
}

// ---------------------------------------------------------------------------
// GitError — repository subprocess failures
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("revision not found: {0}")]
    RevisionNotFound(String),
}

impl GitError {
    /// Lock-contention-class failures that are worth a bounded retry.
    pub fn is_transient(&self) -> bool {
        match self {
            GitError::CommandFailed { stderr, .. } => {
                stderr.contains("index.lock") || stderr.contains("another git process")
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// TransactionError — commit failed after staging
// ---------------------------------------------------------------------------

/// The history commit failed after record files were staged. The index
/// transaction has been rolled back and the staged files restored by the
/// time one of these surfaces; the original git failure is the cause.
#[derive(Debug, Error)]
#[error("commit failed after {attempts} attempt(s), transaction rolled back: {cause}")]
pub struct TransactionError {
    pub attempts: u32,
    pub cause: GitError,
}

// ---------------------------------------------------------------------------
// MigrationError — phase failure, always post-rollback
// ---------------------------------------------------------------------------

/// A migration attempt failed. The isolated branch has been deleted, the
/// working tree restored to the checkpoint revision, and the index restored
/// from its pre-migration copy by the time one of these surfaces.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration preflight failed: {0}")]
    Preflight(StateError),

    #[error("migration already in progress on branch '{branch}' (checkpoint {base_revision})")]
    AlreadyInProgress {
        branch: String,
        base_revision: String,
    },

    #[error("migration preflight failed: cannot write to {path}: {reason}")]
    DiskSpace { path: PathBuf, reason: String },

    #[error("migration phase '{phase}' failed: {cause}; rolled back to {base_revision}")]
    PhaseFailed {
        phase: String,
        base_revision: String,
        cause: String,
    },

    #[error("migration validation failed: {0}; rolled back to {1}")]
    ValidationFailed(String, String),

    #[error("migration rollback failed, manual intervention required: {0}")]
    RollbackFailed(String),
}

// ---------------------------------------------------------------------------
// CadenceError — crate-level wrapper
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CadenceError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    MergeConflict(#[from] crate::merge::MergeConflictError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CadenceError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_tree_error_names_files() {
        let err = StateError::DirtyWorkingTree {
            files: vec!["cadence/epic-1/epic.md".into(), "notes.txt".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("cadence/epic-1/epic.md"));
        assert!(msg.contains("notes.txt"));
        assert!(msg.contains("commit or discard"));
    }

    #[test]
    fn malformed_metadata_names_path() {
        let err = RecordError::MalformedMetadata {
            path: "cadence/epic-3/story-3.5.md".into(),
            reason: "missing field `title`".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("story-3.5"));
        assert!(msg.contains("malformed metadata block"));
    }

    #[test]
    fn transient_classification() {
        let locked = GitError::CommandFailed {
            command: "commit".into(),
            stderr: "fatal: Unable to create '.git/index.lock': File exists".into(),
        };
        assert!(locked.is_transient());

        let other = GitError::CommandFailed {
            command: "commit".into(),
            stderr: "fatal: empty ident name".into(),
        };
        assert!(!other.is_transient());
    }
}
