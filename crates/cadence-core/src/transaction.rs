//! The write protocol.
//!
//! Every logical mutation runs the same sequence: guard check, stage record
//! files on disk, apply index mutations inside an uncommitted transaction,
//! commit history, stamp the new revision into the mutated rows, commit the
//! index transaction. The index is durably committed only after the history
//! commit succeeds, so a crash between the two leaves at worst an
//! uncommitted index transaction that the journal discards on the next open
//! — never a committed history revision without its rows. Partial failure is
//! always resolved by discarding the later side (index + staged files),
//! never by editing history.

use crate::config::CadenceConfig;
use crate::context::ContextCache;
use crate::error::{Result, StateError, TransactionError};
use crate::guard::{self, GuardFlags};
use crate::index::{ActionItemRow, CeremonyRow, EpicRow, Index, IndexTxn, StoryRow};
use crate::paths;
use crate::record::{CeremonyActionItem, CeremonyDoc, EpicDoc, StoryDoc};
use crate::repo::GitRepo;
use crate::types::{CeremonyType, EpicStatus, OperationKind, StoryStatus};
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

pub struct TransactionManager<'a> {
    pub root: &'a Path,
    pub repo: &'a GitRepo,
    pub index: &'a mut Index,
    pub cache: &'a ContextCache,
    pub config: &'a CadenceConfig,
    pub flags: &'a GuardFlags,
}

// ---------------------------------------------------------------------------
// Protocol core
// ---------------------------------------------------------------------------

/// Commit with a bounded retry for lock-contention-class failures.
/// `attempts` is total tries, not extra retries.
fn commit_with_retry(repo: &GitRepo, attempts: u32, message: &str) -> Result<String> {
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match repo.commit(message) {
            Ok(rev) => return Ok(rev),
            Err(cause) if cause.is_transient() && attempt < attempts => {
                tracing::warn!(attempt, error = %cause, "transient commit failure, retrying");
                std::thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
            }
            Err(cause) => {
                return Err(TransactionError {
                    attempts: attempt,
                    cause,
                }
                .into())
            }
        }
    }
}

/// Steps 3–5 of the protocol, with rollback of both stores on any failure.
/// The record files named in `staged_rel` must already be written to disk.
fn run_protocol(
    repo: &GitRepo,
    index: &mut Index,
    attempts: u32,
    staged_rel: &[String],
    message: &str,
    apply: &mut dyn FnMut(&IndexTxn<'_>) -> Result<()>,
) -> Result<String> {
    let refs: Vec<&str> = staged_rel.iter().map(String::as_str).collect();
    let outcome = (|| -> Result<String> {
        let txn = index.begin()?;
        apply(&txn)?;
        repo.stage(&refs)?;
        let revision = commit_with_retry(repo, attempts, message)?;
        txn.stamp(&revision)?;
        txn.commit()?;
        Ok(revision)
    })();
    if outcome.is_err() {
        // The index transaction is already gone (dropped uncommitted);
        // restore the working tree so history and disk agree again.
        if let Err(e) = repo.discard_paths(&refs) {
            tracing::warn!(error = %e, "rollback: failed to restore working tree");
        }
    }
    outcome
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl TransactionManager<'_> {
    fn check(&self, op: OperationKind) -> Result<()> {
        guard::check_before_operation(self.root, self.repo, self.flags, op)?;
        Ok(())
    }

    pub fn create_epic(&mut self, epic: u32, title: &str) -> Result<EpicRow> {
        paths::validate_number(epic)?;
        self.check(OperationKind::CreateEpic)?;
        let _ticket = self.flags.begin_txn()?;

        if self.index.epic(epic)?.is_some() || paths::epic_record(self.root, epic).exists() {
            return Err(StateError::EpicExists(epic).into());
        }

        let doc = EpicDoc::new(epic, title);
        doc.save(self.root)?;

        let rel = paths::epic_record_rel(epic).display().to_string();
        let mut row = EpicRow {
            epic_number: epic,
            title: title.to_string(),
            status: EpicStatus::NotStarted,
            story_count: 0,
            completed_story_count: 0,
            source_path: rel.clone(),
            synced_revision: String::new(),
        };

        let message = format!("epic: create epic-{epic} — {title}");
        let revision = run_protocol(
            self.repo,
            self.index,
            self.config.commit_attempts,
            &[rel],
            &message,
            &mut |txn| txn.upsert_epic(&row),
        )?;

        row.synced_revision = revision.clone();
        self.cache.invalidate_epic(epic);
        tracing::info!(epic, revision = %revision, "created epic");
        Ok(row)
    }

    pub fn create_story(&mut self, epic: u32, story: u32, title: &str) -> Result<StoryRow> {
        paths::validate_number(epic)?;
        paths::validate_number(story)?;
        self.check(OperationKind::CreateStory)?;
        let _ticket = self.flags.begin_txn()?;

        let mut epic_row = self
            .index
            .epic(epic)?
            .ok_or(StateError::EpicNotFound(epic))?;
        if self.index.story(epic, story)?.is_some()
            || paths::story_record(self.root, epic, story).exists()
        {
            return Err(StateError::StoryExists { epic, story }.into());
        }

        let doc = StoryDoc::new(epic, story, title);
        doc.save(self.root)?;

        let rel = paths::story_record_rel(epic, story).display().to_string();
        let mut row = StoryRow {
            epic_number: epic,
            story_number: story,
            title: title.to_string(),
            status: StoryStatus::Draft,
            source_path: rel.clone(),
            synced_revision: String::new(),
            inferred: false,
        };
        epic_row.story_count += 1;
        epic_row.synced_revision = String::new();

        let message = format!("story: create epic-{epic}/story-{epic}.{story} — {title}");
        let revision = run_protocol(
            self.repo,
            self.index,
            self.config.commit_attempts,
            &[rel],
            &message,
            &mut |txn| {
                txn.upsert_story(&row)?;
                txn.upsert_epic(&epic_row)
            },
        )?;

        row.synced_revision = revision.clone();
        self.cache.invalidate_epic(epic);
        tracing::info!(epic, story, revision = %revision, "created story");
        Ok(row)
    }

    pub fn transition_story(
        &mut self,
        epic: u32,
        story: u32,
        target: StoryStatus,
    ) -> Result<StoryRow> {
        self.check(OperationKind::TransitionStory)?;
        let _ticket = self.flags.begin_txn()?;

        let (mut row, mut doc, mut epic_row) = self.load_story(epic, story)?;
        let current = doc.meta.status.unwrap_or(row.status);
        if target == StoryStatus::Done {
            return Err(StateError::InvalidTransition {
                from: current.to_string(),
                to: target.to_string(),
                reason: "stories are completed, not transitioned, to done".to_string(),
            }
            .into());
        }
        current
            .can_transition_to(target)
            .map_err(|reason| StateError::InvalidTransition {
                from: current.to_string(),
                to: target.to_string(),
                reason,
            })?;

        doc.meta.status = Some(target);
        doc.save(self.root)?;
        let mut staged = vec![row.source_path.clone()];

        row.status = target;
        row.inferred = false;
        row.synced_revision = String::new();

        // A story leaving draft moves a fresh epic into progress.
        let epic_update = if epic_row.status == EpicStatus::NotStarted && target != StoryStatus::Draft
        {
            epic_row.status = EpicStatus::InProgress;
            epic_row.synced_revision = String::new();
            let mut epic_doc = EpicDoc::load(self.root, epic)?;
            epic_doc.meta.status = EpicStatus::InProgress;
            epic_doc.save(self.root)?;
            staged.push(epic_row.source_path.clone());
            true
        } else {
            false
        };

        let message = format!("story: transition epic-{epic}/story-{epic}.{story} to {target}");
        let revision = run_protocol(
            self.repo,
            self.index,
            self.config.commit_attempts,
            &staged,
            &message,
            &mut |txn| {
                txn.upsert_story(&row)?;
                if epic_update {
                    txn.upsert_epic(&epic_row)?;
                }
                Ok(())
            },
        )?;

        row.synced_revision = revision.clone();
        self.cache.invalidate_story(epic, story);
        self.cache.invalidate_epic(epic);
        tracing::info!(epic, story, status = %target, revision = %revision, "transitioned story");
        Ok(row)
    }

    pub fn complete_story(&mut self, epic: u32, story: u32) -> Result<StoryRow> {
        self.check(OperationKind::CompleteStory)?;
        let _ticket = self.flags.begin_txn()?;

        let (mut row, mut doc, mut epic_row) = self.load_story(epic, story)?;
        let current = doc.meta.status.unwrap_or(row.status);
        current
            .can_transition_to(StoryStatus::Done)
            .map_err(|reason| StateError::InvalidTransition {
                from: current.to_string(),
                to: StoryStatus::Done.to_string(),
                reason,
            })?;

        doc.meta.status = Some(StoryStatus::Done);
        doc.save(self.root)?;
        let mut staged = vec![row.source_path.clone()];

        row.status = StoryStatus::Done;
        row.inferred = false;
        row.synced_revision = String::new();

        epic_row.completed_story_count += 1;
        let epic_status = if epic_row.completed_story_count >= epic_row.story_count {
            EpicStatus::Complete
        } else {
            EpicStatus::InProgress
        };
        if epic_status != epic_row.status {
            let mut epic_doc = EpicDoc::load(self.root, epic)?;
            epic_doc.meta.status = epic_status;
            epic_doc.save(self.root)?;
            staged.push(epic_row.source_path.clone());
        }
        epic_row.status = epic_status;
        epic_row.synced_revision = String::new();

        let message = format!("story: complete epic-{epic}/story-{epic}.{story}");
        let revision = run_protocol(
            self.repo,
            self.index,
            self.config.commit_attempts,
            &staged,
            &message,
            &mut |txn| {
                txn.upsert_story(&row)?;
                txn.upsert_epic(&epic_row)
            },
        )?;

        row.synced_revision = revision.clone();
        self.cache.invalidate_story(epic, story);
        self.cache.invalidate_epic(epic);
        tracing::info!(epic, story, revision = %revision, "completed story");
        Ok(row)
    }

    pub fn record_ceremony(
        &mut self,
        epic: u32,
        ceremony: CeremonyType,
        participants: Vec<String>,
        summary: &str,
        action_items: Vec<CeremonyActionItem>,
    ) -> Result<CeremonyRow> {
        self.check(OperationKind::RecordCeremony)?;
        let _ticket = self.flags.begin_txn()?;

        if self.index.epic(epic)?.is_none() {
            return Err(StateError::EpicNotFound(epic).into());
        }
        for participant in &participants {
            paths::validate_agent_id(participant)?;
        }
        for item in &action_items {
            paths::validate_agent_id(&item.owner)?;
            if let Some(story) = item.story {
                if self.index.story(epic, story)?.is_none() {
                    return Err(StateError::StoryNotFound { epic, story }.into());
                }
            }
        }

        let seq = crate::record::next_ceremony_seq(self.root, epic, ceremony)?;
        let doc = CeremonyDoc::new(epic, ceremony, participants.clone(), summary, action_items.clone());
        doc.save(self.root, seq)?;

        let rel = paths::ceremony_record_rel(epic, ceremony, seq)
            .display()
            .to_string();
        let mut ceremony_row = CeremonyRow {
            id: 0,
            ceremony_type: ceremony,
            epic_number: epic,
            participants,
            summary_text: summary.to_string(),
            created_at: doc.meta.held_at,
            source_path: rel.clone(),
            synced_revision: String::new(),
        };
        let item_rows: Vec<ActionItemRow> = action_items
            .iter()
            .map(|item| ActionItemRow {
                id: Uuid::new_v4(),
                description: item.description.clone(),
                owner: item.owner.clone(),
                status: crate::types::ActionItemStatus::Open,
                created_at: Utc::now(),
                related_story: item.story.map(|s| (epic, s)),
                synced_revision: String::new(),
            })
            .collect();

        let mut ceremony_id = 0i64;
        let message = format!("ceremony: record {ceremony}-{seq:03} for epic-{epic}");
        let revision = run_protocol(
            self.repo,
            self.index,
            self.config.commit_attempts,
            &[rel],
            &message,
            &mut |txn| {
                ceremony_id = txn.insert_ceremony(&ceremony_row)?;
                for item in &item_rows {
                    txn.insert_action_item(item)?;
                }
                Ok(())
            },
        )?;

        ceremony_row.id = ceremony_id;
        ceremony_row.synced_revision = revision.clone();
        self.cache.invalidate_epic(epic);
        tracing::info!(
            epic,
            ceremony = %ceremony,
            seq,
            actions = item_rows.len(),
            revision = %revision,
            "recorded ceremony"
        );
        Ok(ceremony_row)
    }

    fn load_story(&self, epic: u32, story: u32) -> Result<(StoryRow, StoryDoc, EpicRow)> {
        let row = self
            .index
            .story(epic, story)?
            .ok_or(StateError::StoryNotFound { epic, story })?;
        let doc = StoryDoc::load(self.root, epic, story)?;
        let epic_row = self
            .index
            .epic(epic)?
            .ok_or(StateError::EpicNotFound(epic))?;
        Ok((row, doc, epic_row))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
