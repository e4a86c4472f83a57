//! Checkpointed schema/data migration on an isolated branch.
//!
//! A migration rebuilds the derived index from the record files in ordered
//! phases, each committed to the `cadence-migration` branch with a
//! phase-labeled message. Any phase failure triggers the full rollback path:
//! the branch is deleted, the working tree and head are restored to the
//! checkpoint revision, and the index is restored from its pre-migration
//! copy — no partial phase is ever left merged into the main line. Only a
//! fully validated chain merges.
//!
//! A process restart with an incomplete checkpoint file always rolls the
//! attempt back on the next open; resume is never attempted.

use crate::config::CadenceConfig;
use crate::context::ContextCache;
use crate::error::{MigrationError, Result};
use crate::guard::{self, GuardFlags};
use crate::index::{CeremonyRow, EpicRow, Index, StoryRow};
use crate::paths;
use crate::record::{self, CeremonyDoc, EpicDoc, StoryDoc};
use crate::repo::GitRepo;
use crate::types::{OperationKind, StoryStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    CreateSchema,
    BackfillEpics,
    BackfillStories,
    BackfillCeremonies,
    Validate,
}

impl MigrationPhase {
    pub fn all() -> &'static [MigrationPhase] {
        &[
            MigrationPhase::CreateSchema,
            MigrationPhase::BackfillEpics,
            MigrationPhase::BackfillStories,
            MigrationPhase::BackfillCeremonies,
            MigrationPhase::Validate,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationPhase::CreateSchema => "create_schema",
            MigrationPhase::BackfillEpics => "backfill_epics",
            MigrationPhase::BackfillStories => "backfill_stories",
            MigrationPhase::BackfillCeremonies => "backfill_ceremonies",
            MigrationPhase::Validate => "validate",
        }
    }

    fn commit_label(self) -> &'static str {
        match self {
            MigrationPhase::CreateSchema => "reset index schema",
            MigrationPhase::BackfillEpics => "backfill epic rows",
            MigrationPhase::BackfillStories => "backfill story rows",
            MigrationPhase::BackfillCeremonies => "backfill ceremony rows",
            MigrationPhase::Validate => "validate index totals",
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Committed,
    Validated,
    RolledBack,
}

// ---------------------------------------------------------------------------
// Checkpoint chain (persisted to .cadence/migration.yaml)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCheckpoint {
    pub base_revision: String,
    pub branch_name: String,
    pub phase_index: usize,
    pub phase: MigrationPhase,
    pub phase_status: PhaseStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    pub base_revision: String,
    pub base_branch: String,
    pub branch_name: String,
    pub started_at: DateTime<Utc>,
    pub checkpoints: Vec<MigrationCheckpoint>,
}

impl MigrationState {
    fn new(base_revision: &str, base_branch: &str, branch_name: &str) -> Self {
        let checkpoints = MigrationPhase::all()
            .iter()
            .enumerate()
            .map(|(phase_index, &phase)| MigrationCheckpoint {
                base_revision: base_revision.to_string(),
                branch_name: branch_name.to_string(),
                phase_index,
                phase,
                phase_status: PhaseStatus::Pending,
            })
            .collect();
        Self {
            base_revision: base_revision.to_string(),
            base_branch: base_branch.to_string(),
            branch_name: branch_name.to_string(),
            started_at: Utc::now(),
            checkpoints,
        }
    }

    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = paths::migration_path(root);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_yaml::from_str(&data)?))
    }

    fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&paths::migration_path(root), data.as_bytes())
    }

    fn remove(root: &Path) -> Result<()> {
        let path = paths::migration_path(root);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub merged_revision: String,
    pub epics: u32,
    pub stories: u32,
    pub inferred_stories: u32,
    pub ceremonies: u32,
}

#[derive(Default)]
struct PhaseStats {
    epics: u32,
    stories: u32,
    inferred_stories: u32,
    ceremonies: u32,
}

// ---------------------------------------------------------------------------
// MigrationManager
// ---------------------------------------------------------------------------

pub struct MigrationManager<'a> {
    pub root: &'a Path,
    pub repo: &'a GitRepo,
    pub index: &'a mut Index,
    pub cache: &'a ContextCache,
    pub config: &'a CadenceConfig,
    pub flags: &'a GuardFlags,
}

impl MigrationManager<'_> {
    pub fn run(&mut self) -> Result<MigrationOutcome> {
        let mut state = self.preflight()?;
        let _ticket = self
            .flags
            .begin_exclusive(OperationKind::Migration.as_str())?;

        std::fs::copy(
            paths::index_path(self.root),
            paths::index_backup_path(self.root),
        )?;
        state.save(self.root)?;
        self.repo.create_branch(&state.branch_name, &state.base_revision)?;
        self.repo.checkout(&state.branch_name)?;
        tracing::info!(
            branch = %state.branch_name,
            checkpoint = %state.base_revision,
            "migration started"
        );

        let mut stats = PhaseStats::default();
        let total = MigrationPhase::all().len();
        for (i, &phase) in MigrationPhase::all().iter().enumerate() {
            tracing::info!(phase = %phase, "migration phase running");
            if let Err(e) = self.run_phase(phase, i, total, &mut stats) {
                let cause = match &e {
                    crate::error::CadenceError::Migration(MigrationError::ValidationFailed(
                        reason,
                        _,
                    )) => reason.clone(),
                    other => other.to_string(),
                };
                self.rollback(&state)?;
                tracing::warn!(phase = %phase, error = %cause, "migration phase failed, rolled back");
                return Err(match phase {
                    MigrationPhase::Validate => {
                        MigrationError::ValidationFailed(cause, state.base_revision.clone())
                    }
                    _ => MigrationError::PhaseFailed {
                        phase: phase.to_string(),
                        base_revision: state.base_revision.clone(),
                        cause,
                    },
                }
                .into());
            }
            state.checkpoints[i].phase_status = PhaseStatus::Committed;
            state.save(self.root)?;
        }
        for checkpoint in &mut state.checkpoints {
            checkpoint.phase_status = PhaseStatus::Validated;
        }
        state.save(self.root)?;

        // Only a fully validated chain merges. The checkpoint revision stays
        // in history for manual reversal.
        self.repo.checkout(&state.base_branch)?;
        let merged_revision = self.repo.merge(
            &state.branch_name,
            &format!("migration: merge {}", state.branch_name),
        )?;
        self.repo.delete_branch(&state.branch_name)?;
        let _ = std::fs::remove_file(paths::index_backup_path(self.root));
        MigrationState::remove(self.root)?;
        self.cache.clear();

        tracing::info!(
            revision = %merged_revision,
            epics = stats.epics,
            stories = stats.stories,
            inferred = stats.inferred_stories,
            "migration merged"
        );
        Ok(MigrationOutcome {
            merged_revision,
            epics: stats.epics,
            stories: stats.stories,
            inferred_stories: stats.inferred_stories,
            ceremonies: stats.ceremonies,
        })
    }

    // ---------------------------------------------------------------------------
    // Preflight
    // ---------------------------------------------------------------------------

    fn preflight(&self) -> Result<MigrationState> {
        if let Some(state) = MigrationState::load(self.root)? {
            return Err(MigrationError::AlreadyInProgress {
                branch: state.branch_name,
                base_revision: state.base_revision,
            }
            .into());
        }
        guard::check_before_operation(self.root, self.repo, self.flags, OperationKind::Migration)
            .map_err(MigrationError::Preflight)?;
        self.disk_probe()?;

        let base_branch = self.repo.current_branch()?;
        let base_revision = self.repo.head()?;
        let branch_name = self.config.migration_branch.clone();
        if self.repo.branch_exists(&branch_name)? {
            // Leftover from a rollback that could not delete the branch;
            // the checkpoint file is the source of truth and it is absent.
            tracing::warn!(branch = %branch_name, "deleting stale migration branch");
            self.repo.delete_branch(&branch_name)?;
        }
        Ok(MigrationState::new(&base_revision, &base_branch, &branch_name))
    }

    /// Prove the operational directory can absorb the migration's writes by
    /// writing and deleting a probe file.
    fn disk_probe(&self) -> Result<()> {
        let path = paths::cadence_dir(self.root).join(".preflight-probe");
        let outcome = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&path)?;
            let chunk = vec![0u8; 64 * 1024];
            let mut remaining = self.config.preflight_probe_bytes;
            while remaining > 0 {
                let n = remaining.min(chunk.len() as u64) as usize;
                file.write_all(&chunk[..n])?;
                remaining -= n as u64;
            }
            file.sync_all()
        })();
        let _ = std::fs::remove_file(&path);
        outcome.map_err(|e| {
            MigrationError::DiskSpace {
                path,
                reason: e.to_string(),
            }
            .into()
        })
    }

    // ---------------------------------------------------------------------------
    // Phases
    // ---------------------------------------------------------------------------

    fn run_phase(
        &mut self,
        phase: MigrationPhase,
        i: usize,
        total: usize,
        stats: &mut PhaseStats,
    ) -> Result<()> {
        let message = format!("migration: {} (phase {}/{})", phase.commit_label(), i + 1, total);
        match phase {
            MigrationPhase::CreateSchema => {
                self.index.reset_schema()?;
                self.repo.commit_allow_empty(&message)?;
                Ok(())
            }
            MigrationPhase::BackfillEpics => {
                let epics = record::list_epic_numbers(self.root)?;
                let mut rows = Vec::with_capacity(epics.len());
                for epic in &epics {
                    let doc = EpicDoc::load(self.root, *epic)?;
                    rows.push(EpicRow {
                        epic_number: *epic,
                        title: doc.meta.title,
                        status: doc.meta.status,
                        story_count: 0,
                        completed_story_count: 0,
                        source_path: paths::epic_record_rel(*epic).display().to_string(),
                        synced_revision: String::new(),
                    });
                }
                stats.epics = rows.len() as u32;
                let txn = self.index.begin()?;
                for row in &rows {
                    txn.upsert_epic(row)?;
                }
                let revision = self.repo.commit_allow_empty(&message)?;
                txn.stamp(&revision)?;
                txn.commit()?;
                Ok(())
            }
            MigrationPhase::BackfillStories => self.backfill_stories(&message, stats),
            MigrationPhase::BackfillCeremonies => self.backfill_ceremonies(&message, stats),
            MigrationPhase::Validate => self.validate(&message),
        }
    }

    /// Parse every story file, inferring status from commit history when the
    /// metadata omits it, and write the inferred value back so the record
    /// becomes explicit. Recomputes the parent epics' counts.
    fn backfill_stories(&mut self, message: &str, stats: &mut PhaseStats) -> Result<()> {
        let mut story_rows = Vec::new();
        let mut epic_updates: Vec<EpicRow> = Vec::new();
        let mut normalized: Vec<String> = Vec::new();

        for epic in record::list_epic_numbers(self.root)? {
            let mut story_count = 0;
            let mut completed = 0;
            for story in record::list_story_numbers(self.root, epic)? {
                let mut doc = StoryDoc::load(self.root, epic, story)?;
                let rel = paths::story_record_rel(epic, story).display().to_string();
                let (status, inferred) = match doc.meta.status {
                    Some(status) => (status, false),
                    None => {
                        let status = crate::consistency::infer_story_status(self.repo, &rel)?;
                        doc.meta.status = Some(status);
                        doc.save(self.root)?;
                        normalized.push(rel.clone());
                        (status, true)
                    }
                };
                story_count += 1;
                if status == StoryStatus::Done {
                    completed += 1;
                }
                if inferred {
                    stats.inferred_stories += 1;
                }
                story_rows.push(StoryRow {
                    epic_number: epic,
                    story_number: story,
                    title: doc.meta.title,
                    status,
                    source_path: rel,
                    synced_revision: String::new(),
                    inferred,
                });
            }
            if let Some(mut row) = self.index.epic(epic)? {
                row.story_count = story_count;
                row.completed_story_count = completed;
                row.synced_revision = String::new();
                epic_updates.push(row);
            }
        }
        stats.stories = story_rows.len() as u32;

        let txn = self.index.begin()?;
        for row in &story_rows {
            txn.upsert_story(row)?;
        }
        for row in &epic_updates {
            txn.upsert_epic(row)?;
        }
        if !normalized.is_empty() {
            let refs: Vec<&str> = normalized.iter().map(String::as_str).collect();
            self.repo.stage(&refs)?;
        }
        let revision = self.repo.commit_allow_empty(message)?;
        txn.stamp(&revision)?;
        txn.commit()?;
        Ok(())
    }

    /// Re-derive ceremony summaries and their action items from the ceremony
    /// records. Action items receive fresh ids; their identity lives in the
    /// record files, not the index.
    fn backfill_ceremonies(&mut self, message: &str, stats: &mut PhaseStats) -> Result<()> {
        let mut ceremony_rows = Vec::new();
        let mut action_rows = Vec::new();
        for epic in record::list_epic_numbers(self.root)? {
            let dir = self.root.join(paths::ceremonies_dir_rel(epic));
            if !dir.exists() {
                continue;
            }
            let mut files: Vec<_> = std::fs::read_dir(&dir)?
                .collect::<std::io::Result<Vec<_>>>()?
                .into_iter()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.ends_with(".md"))
                .collect();
            files.sort();
            for name in files {
                let abs = dir.join(&name);
                let rel = paths::ceremonies_dir_rel(epic).join(&name);
                let content = std::fs::read_to_string(&abs)?;
                let doc = CeremonyDoc::parse(&rel, &content)?;
                ceremony_rows.push(CeremonyRow {
                    id: 0,
                    ceremony_type: doc.meta.ceremony,
                    epic_number: epic,
                    participants: doc.meta.participants.clone(),
                    summary_text: doc.body.trim().to_string(),
                    created_at: doc.meta.held_at,
                    source_path: rel.display().to_string(),
                    synced_revision: String::new(),
                });
                for item in &doc.meta.action_items {
                    action_rows.push(crate::index::ActionItemRow {
                        id: uuid::Uuid::new_v4(),
                        description: item.description.clone(),
                        owner: item.owner.clone(),
                        status: crate::types::ActionItemStatus::Open,
                        created_at: doc.meta.held_at,
                        related_story: item.story.map(|s| (epic, s)),
                        synced_revision: String::new(),
                    });
                }
            }
        }
        stats.ceremonies = ceremony_rows.len() as u32;

        let txn = self.index.begin()?;
        for row in &ceremony_rows {
            txn.insert_ceremony(row)?;
        }
        for row in &action_rows {
            txn.insert_action_item(row)?;
        }
        let revision = self.repo.commit_allow_empty(message)?;
        txn.stamp(&revision)?;
        txn.commit()?;
        Ok(())
    }

    /// Referential integrity over the rebuilt index: totals equal the files
    /// present, back-references resolve, every row's revision is reachable.
    fn validate(&mut self, message: &str) -> Result<()> {
        let fail = |reason: String| -> Result<()> {
            Err(MigrationError::ValidationFailed(reason, String::new()).into())
        };

        let epic_numbers = record::list_epic_numbers(self.root)?;
        if self.index.epic_count()? != epic_numbers.len() as u32 {
            return fail(format!(
                "epic rows ({}) do not match epic files ({})",
                self.index.epic_count()?,
                epic_numbers.len()
            ));
        }
        let mut story_files = 0u32;
        for epic in &epic_numbers {
            let stories = record::list_story_numbers(self.root, *epic)?;
            story_files += stories.len() as u32;
            let row = match self.index.epic(*epic)? {
                Some(row) => row,
                None => return fail(format!("no row for epic-{epic}")),
            };
            if row.story_count != stories.len() as u32 {
                return fail(format!(
                    "epic-{epic} story_count {} does not match {} story files",
                    row.story_count,
                    stories.len()
                ));
            }
        }
        if self.index.story_count()? != story_files {
            return fail(format!(
                "story rows ({}) do not match story files ({story_files})",
                self.index.story_count()?
            ));
        }
        for story in self.index.stories()? {
            if self.index.epic(story.epic_number)?.is_none() {
                return fail(format!(
                    "story-{}.{} references missing epic",
                    story.epic_number, story.story_number
                ));
            }
        }
        for item in self.index.action_items()? {
            if let Some((epic, story)) = item.related_story {
                if self.index.story(epic, story)?.is_none() {
                    return fail(format!(
                        "action item {} references missing story-{epic}.{story}",
                        item.id
                    ));
                }
            }
        }
        let head = self.repo.head()?;
        let snapshot = self.index.snapshot()?;
        let revisions = snapshot
            .epics
            .iter()
            .map(|r| &r.synced_revision)
            .chain(snapshot.stories.iter().map(|r| &r.synced_revision))
            .chain(snapshot.ceremonies.iter().map(|r| &r.synced_revision))
            .chain(snapshot.action_items.iter().map(|r| &r.synced_revision));
        for revision in revisions {
            if revision.is_empty() || !self.repo.is_reachable(revision, &head)? {
                return fail(format!("revision {revision} not reachable from head"));
            }
        }
        self.repo.commit_allow_empty(message)?;
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // Rollback
    // ---------------------------------------------------------------------------

    fn rollback(&mut self, state: &MigrationState) -> Result<()> {
        rollback_attempt(self.root, self.repo, self.index, self.cache, state)
    }
}

/// Restore head, working tree and index to the checkpoint. Shared by the
/// in-flight failure path and startup recovery.
fn rollback_attempt(
    root: &Path,
    repo: &GitRepo,
    index: &mut Index,
    cache: &ContextCache,
    state: &MigrationState,
) -> Result<()> {
    let steps = (|| -> Result<()> {
        // A phase can fail with normalized files still unstaged; drop them
        // before switching branches.
        repo.reset_hard("HEAD")?;
        repo.checkout(&state.base_branch)?;
        repo.reset_hard(&state.base_revision)?;
        if repo.branch_exists(&state.branch_name)? {
            repo.delete_branch(&state.branch_name)?;
        }
        let backup = paths::index_backup_path(root);
        if backup.exists() {
            let snapshot = Index::snapshot_from_file(&backup)?;
            index.reset_schema()?;
            index.apply_snapshot(&snapshot)?;
            std::fs::remove_file(&backup)?;
        }
        MigrationState::remove(root)?;
        cache.clear();
        Ok(())
    })();
    steps.map_err(|e| MigrationError::RollbackFailed(e.to_string()).into())
}

/// Roll back an incomplete migration left by a dead process. Returns true
/// when one was found and rolled back.
pub fn recover(
    root: &Path,
    repo: &GitRepo,
    index: &mut Index,
    cache: &ContextCache,
) -> Result<bool> {
    let Some(state) = MigrationState::load(root)? else {
        return Ok(false);
    };
    tracing::warn!(
        branch = %state.branch_name,
        checkpoint = %state.base_revision,
        "rolling back incomplete migration from a previous process"
    );
    rollback_attempt(root, repo, index, cache, &state)?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CadenceError;
    use crate::transaction::testutil::Fixture;
    use crate::types::CeremonyType;

    fn manager(fx: &mut Fixture) -> MigrationManager<'_> {
        MigrationManager {
            root: fx.dir.path(),
            repo: &fx.repo,
            index: &mut fx.index,
            cache: &fx.cache,
            config: &fx.config,
            flags: &fx.flags,
        }
    }

    fn seed_records(fx: &mut Fixture) {
        fx.txm().create_epic(1, "Auth").unwrap();
        fx.txm().create_story(1, 1, "Login").unwrap();
        fx.txm().create_story(1, 2, "Logout").unwrap();
        fx.txm().create_epic(2, "Billing").unwrap();
        fx.txm().create_story(2, 1, "Invoices").unwrap();
        fx.txm()
            .transition_story(1, 1, StoryStatus::InProgress)
            .unwrap();
        fx.txm().complete_story(1, 1).unwrap();
        fx.txm()
            .record_ceremony(
                1,
                CeremonyType::Retrospective,
                vec!["dev-agent".into()],
                "Retro notes.",
                vec![],
            )
            .unwrap();
    }

    #[test]
    fn migration_rebuilds_index_and_merges() {
        let mut fx = Fixture::new();
        seed_records(&mut fx);
        let head_before = fx.repo.head().unwrap();

        // Wipe the index to simulate a store that must be rebuilt.
        fx.index.reset_schema().unwrap();
        assert_eq!(fx.index.epic_count().unwrap(), 0);

        let outcome = manager(&mut fx).run().unwrap();
        assert_eq!(outcome.epics, 2);
        assert_eq!(outcome.stories, 3);
        assert_eq!(outcome.ceremonies, 1);

        // Counts equal the files present at the final phase.
        assert_eq!(fx.index.epic_count().unwrap(), 2);
        assert_eq!(fx.index.story_count().unwrap(), 3);
        let epic = fx.index.epic(1).unwrap().unwrap();
        assert_eq!(epic.story_count, 2);
        assert_eq!(epic.completed_story_count, 1);

        // Merged into the main line; branch and checkpoint gone.
        assert!(fx
            .repo
            .is_reachable(&head_before, &outcome.merged_revision)
            .unwrap());
        assert!(!fx.repo.branch_exists("cadence-migration").unwrap());
        assert!(!paths::migration_path(fx.dir.path()).exists());
        assert!(!paths::index_backup_path(fx.dir.path()).exists());
        assert_eq!(fx.repo.current_branch().unwrap(), "main");

        // Every row's revision is reachable from the merged head.
        for story in fx.index.stories().unwrap() {
            assert!(fx
                .repo
                .is_reachable(&story.synced_revision, "HEAD")
                .unwrap());
        }
    }

    #[test]
    fn malformed_story_rolls_back_to_checkpoint() {
        let mut fx = Fixture::new();
        seed_records(&mut fx);

        // Break one story's metadata block.
        std::fs::write(
            paths::story_record(fx.dir.path(), 2, 1),
            "---\nepic: 2\nstory: [broken\n---\nbody\n",
        )
        .unwrap();
        fx.repo.stage(&["cadence/epic-2/story-2.1.md"]).unwrap();
        fx.repo.commit("break story").unwrap();

        let checkpoint = fx.repo.head().unwrap();
        let snapshot_before = fx.index.snapshot().unwrap();

        let err = manager(&mut fx).run().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("backfill_stories"));
        assert!(msg.contains("story-2.1"));
        assert!(msg.contains("malformed metadata block"));

        // Byte-identical round-trip: head restored, tree clean, branch gone.
        assert_eq!(fx.repo.head().unwrap(), checkpoint);
        assert!(fx.repo.is_clean().unwrap());
        assert!(!fx.repo.branch_exists("cadence-migration").unwrap());
        assert!(!paths::migration_path(fx.dir.path()).exists());

        // Index restored from the pre-migration copy.
        let snapshot_after = fx.index.snapshot().unwrap();
        assert_eq!(snapshot_after.epics, snapshot_before.epics);
        assert_eq!(snapshot_after.stories, snapshot_before.stories);

        // After fixing the record, the migration completes and merges.
        StoryDoc::new(2, 1, "Invoices").save(fx.dir.path()).unwrap();
        fx.repo.stage(&["cadence/epic-2/story-2.1.md"]).unwrap();
        fx.repo.commit("fix story").unwrap();
        let outcome = manager(&mut fx).run().unwrap();
        assert_eq!(outcome.stories, 3);
    }

    #[test]
    fn status_inferred_from_history_and_normalized() {
        let mut fx = Fixture::new();
        fx.txm().create_epic(1, "E").unwrap();
        fx.txm().create_story(1, 1, "S").unwrap();
        fx.txm()
            .transition_story(1, 1, StoryStatus::Review)
            .unwrap();

        // Strip the explicit status, as a record predating tracking would be.
        let doc = StoryDoc::load(fx.dir.path(), 1, 1).unwrap();
        let mut meta = doc.meta.clone();
        meta.status = None;
        let content = crate::record::render_record(&meta, &doc.body).unwrap();
        std::fs::write(paths::story_record(fx.dir.path(), 1, 1), content).unwrap();
        fx.repo.stage(&["cadence/epic-1/story-1.1.md"]).unwrap();
        fx.repo.commit("strip status").unwrap();

        let outcome = manager(&mut fx).run().unwrap();
        assert_eq!(outcome.inferred_stories, 1);

        let row = fx.index.story(1, 1).unwrap().unwrap();
        assert_eq!(row.status, StoryStatus::Review);
        assert!(row.inferred);

        // The record now carries the inferred status explicitly.
        let doc = StoryDoc::load(fx.dir.path(), 1, 1).unwrap();
        assert_eq!(doc.meta.status, Some(StoryStatus::Review));
    }

    #[test]
    fn second_migration_rejected_while_checkpoint_exists() {
        let mut fx = Fixture::new();
        fx.txm().create_epic(1, "E").unwrap();

        let state = MigrationState::new("deadbeef", "main", "cadence-migration");
        state.save(fx.dir.path()).unwrap();

        let err = manager(&mut fx).run().unwrap_err();
        assert!(matches!(
            err,
            CadenceError::Migration(MigrationError::AlreadyInProgress { .. })
        ));
        MigrationState::remove(fx.dir.path()).unwrap();
    }

    #[test]
    fn dirty_tree_fails_preflight() {
        let mut fx = Fixture::new();
        fx.txm().create_epic(1, "E").unwrap();
        std::fs::write(fx.dir.path().join("scratch.txt"), "wip").unwrap();

        let err = manager(&mut fx).run().unwrap_err();
        assert!(matches!(
            err,
            CadenceError::Migration(MigrationError::Preflight(_))
        ));
        // Nothing was touched.
        assert!(!paths::migration_path(fx.dir.path()).exists());
        assert!(!fx.repo.branch_exists("cadence-migration").unwrap());
    }

    #[test]
    fn recover_rolls_back_leftover_attempt() {
        let mut fx = Fixture::new();
        seed_records(&mut fx);
        let checkpoint = fx.repo.head().unwrap();

        // Fake a migration that died after its first phases: branch exists,
        // checkpoint file exists, index backup exists, head on the branch.
        std::fs::copy(
            paths::index_path(fx.dir.path()),
            paths::index_backup_path(fx.dir.path()),
        )
        .unwrap();
        let state = MigrationState::new(&checkpoint, "main", "cadence-migration");
        state.save(fx.dir.path()).unwrap();
        fx.repo.create_branch("cadence-migration", &checkpoint).unwrap();
        fx.repo.checkout("cadence-migration").unwrap();
        fx.repo.commit_allow_empty("migration: phase work").unwrap();
        fx.index.reset_schema().unwrap();

        let recovered = recover(fx.dir.path(), &fx.repo, &mut fx.index, &fx.cache).unwrap();
        assert!(recovered);
        assert_eq!(fx.repo.head().unwrap(), checkpoint);
        assert_eq!(fx.repo.current_branch().unwrap(), "main");
        assert!(!fx.repo.branch_exists("cadence-migration").unwrap());
        assert!(!paths::migration_path(fx.dir.path()).exists());
        // Index restored from the backup copy.
        assert_eq!(fx.index.epic_count().unwrap(), 2);

        assert!(!recover(fx.dir.path(), &fx.repo, &mut fx.index, &fx.cache).unwrap());
    }

    #[test]
    fn checkpoint_chain_is_linear_and_persisted() {
        let state = MigrationState::new("rev", "main", "cadence-migration");
        assert_eq!(state.checkpoints.len(), MigrationPhase::all().len());
        for (i, checkpoint) in state.checkpoints.iter().enumerate() {
            assert_eq!(checkpoint.phase_index, i);
            assert_eq!(checkpoint.phase_status, PhaseStatus::Pending);
            assert_eq!(checkpoint.base_revision, "rev");
        }
    }
}
