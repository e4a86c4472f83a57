//! Precondition checks for every mutating operation.
//!
//! All writers pass through [`check_before_operation`] before touching any
//! state, which serializes mutations process-wide: the index's single-writer
//! constraint is never actually contended.

use crate::error::StateError;
use crate::paths;
use crate::repo::GitRepo;
use crate::types::OperationKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// GuardFlags
// ---------------------------------------------------------------------------

/// Process-local serialization state, owned by the context object.
#[derive(Debug, Default)]
pub struct GuardFlags {
    txn_open: AtomicBool,
    exclusive: Mutex<Option<String>>,
}

impl GuardFlags {
    /// Mark a transaction open for the duration of the returned ticket.
    pub fn begin_txn(&self) -> Result<TxnTicket<'_>, StateError> {
        if self.txn_open.swap(true, Ordering::SeqCst) {
            return Err(StateError::TransactionInProgress);
        }
        Ok(TxnTicket { flags: self })
    }

    /// Mark an exclusive operation running for the duration of the ticket.
    pub fn begin_exclusive(&self, name: &str) -> Result<ExclusiveTicket<'_>, StateError> {
        let mut slot = self.exclusive.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = slot.as_ref() {
            return Err(StateError::ExclusiveOperation(current.clone()));
        }
        *slot = Some(name.to_string());
        Ok(ExclusiveTicket { flags: self })
    }

    fn txn_is_open(&self) -> bool {
        self.txn_open.load(Ordering::SeqCst)
    }

    fn exclusive_operation(&self) -> Option<String> {
        self.exclusive
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Clears the transaction flag on drop, so a failed protocol step can never
/// leave the flag stuck.
pub struct TxnTicket<'a> {
    flags: &'a GuardFlags,
}

impl Drop for TxnTicket<'_> {
    fn drop(&mut self) {
        self.flags.txn_open.store(false, Ordering::SeqCst);
    }
}

pub struct ExclusiveTicket<'a> {
    flags: &'a GuardFlags,
}

impl Drop for ExclusiveTicket<'_> {
    fn drop(&mut self) {
        *self
            .flags
            .exclusive
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }
}

// ---------------------------------------------------------------------------
// check_before_operation
// ---------------------------------------------------------------------------

/// Verify every precondition for `op`. Side-effect-free; never mutates state.
///
/// Checks, in order: no exclusive operation in progress (unless `op` is that
/// exclusive operation acquiring its own slot), no open transaction, an
/// initialized project, and a clean working tree. The returned error names
/// the violated precondition and the remediation.
pub fn check_before_operation(
    root: &Path,
    repo: &GitRepo,
    flags: &GuardFlags,
    op: OperationKind,
) -> Result<(), StateError> {
    if let Some(current) = flags.exclusive_operation() {
        if !op.is_exclusive() || current != op.as_str() {
            return Err(StateError::ExclusiveOperation(current));
        }
    }
    // A checkpoint file on disk means a migration owns the repository, even
    // if it was started by a process that has since died.
    if paths::migration_path(root).exists() && op != OperationKind::Migration {
        return Err(StateError::ExclusiveOperation("migration".to_string()));
    }
    if flags.txn_is_open() {
        return Err(StateError::TransactionInProgress);
    }
    if !paths::config_path(root).exists() {
        return Err(StateError::NotInitialized);
    }
    let dirty = repo
        .dirty_paths()
        .map_err(|e| StateError::RepositoryUnavailable(e.to_string()))?;
    if !dirty.is_empty() {
        return Err(StateError::DirtyWorkingTree { files: dirty });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
