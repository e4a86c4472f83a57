//! Drift detection and repair between the record files and the index.
//!
//! The checker re-reads every row's source file as of the head revision,
//! re-parses its metadata through the same logic the write path uses, and
//! compares the derived fields against the row. Repair overwrites drifted
//! rows from the files (the files are canonical), deletes rows whose file is
//! gone, and inserts rows for files that have none. Repair is idempotent: a
//! check immediately after a repair reports zero mismatches.

use crate::context::ContextCache;
use crate::error::Result;
use crate::guard::{self, GuardFlags};
use crate::index::{EpicRow, Index, StoryRow};
use crate::paths;
use crate::record::{EpicMeta, StoryMeta};
use crate::repo::GitRepo;
use crate::types::{OperationKind, StoryStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Mismatch {
    pub entity_key: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub checked_at: DateTime<Utc>,
    pub mismatches: Vec<Mismatch>,
    pub repaired: bool,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Head view — record files as of the head revision
// ---------------------------------------------------------------------------

struct HeadView {
    head: String,
    epics: BTreeMap<u32, EpicMeta>,
    stories: BTreeMap<(u32, u32), StoryMeta>,
    ceremony_paths: BTreeSet<String>,
}

impl HeadView {
    fn load(repo: &GitRepo) -> Result<Self> {
        let head = repo.head()?;
        let mut view = Self {
            head: head.clone(),
            epics: BTreeMap::new(),
            stories: BTreeMap::new(),
            ceremony_paths: BTreeSet::new(),
        };
        for path in repo.ls_tree(&head, paths::RECORDS_DIR)? {
            let name = path.rsplit('/').next().unwrap_or(&path);
            if name == "epic.md" {
                let Some(epic) = epic_number_of(&path) else {
                    continue;
                };
                let content = repo.show(&head, &path)?;
                let (meta, _) = crate::record::parse_record::<EpicMeta>(Path::new(&path), &content)?;
                view.epics.insert(epic, meta);
            } else if let Some((e, s)) = paths::parse_story_file_name(name) {
                let content = repo.show(&head, &path)?;
                let (meta, _) =
                    crate::record::parse_record::<StoryMeta>(Path::new(&path), &content)?;
                view.stories.insert((e, s), meta);
            } else if path.contains(&format!("/{}/", paths::CEREMONIES_DIR)) {
                view.ceremony_paths.insert(path);
            }
        }
        Ok(view)
    }

    fn story_counts(&self, epic: u32) -> (u32, u32) {
        let mut total = 0;
        let mut done = 0;
        for ((e, _), meta) in &self.stories {
            if *e == epic {
                total += 1;
                if meta.status == Some(StoryStatus::Done) {
                    done += 1;
                }
            }
        }
        (total, done)
    }
}

fn epic_number_of(path: &str) -> Option<u32> {
    path.split('/')
        .find_map(paths::parse_epic_dir_name)
}

fn reachable(repo: &GitRepo, rev: &str, head: &str) -> bool {
    !rev.is_empty() && repo.is_reachable(rev, head).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// check_consistency
// ---------------------------------------------------------------------------

pub fn check_consistency(repo: &GitRepo, index: &Index) -> Result<ConsistencyReport> {
    let view = HeadView::load(repo)?;
    let mut mismatches = Vec::new();

    for row in index.epics()? {
        let key = format!("epic-{}", row.epic_number);
        match view.epics.get(&row.epic_number) {
            None => mismatches.push(Mismatch {
                entity_key: key,
                expected: format!("record file at {}", row.source_path),
                actual: "absent".to_string(),
            }),
            Some(meta) => {
                let (story_count, completed) = view.story_counts(row.epic_number);
                compare(&mut mismatches, &key, "title", &meta.title, &row.title);
                compare(&mut mismatches, &key, "status", &meta.status, &row.status);
                compare(&mut mismatches, &key, "story_count", &story_count, &row.story_count);
                compare(
                    &mut mismatches,
                    &key,
                    "completed_story_count",
                    &completed,
                    &row.completed_story_count,
                );
                check_revision(&mut mismatches, repo, &view.head, &key, &row.synced_revision);
            }
        }
    }
    for (epic, meta) in &view.epics {
        if index.epic(*epic)?.is_none() {
            mismatches.push(Mismatch {
                entity_key: format!("epic-{epic}"),
                expected: format!("row derived from {}", meta.title),
                actual: "no row".to_string(),
            });
        }
    }

    for row in index.stories()? {
        let key = format!("story-{}.{}", row.epic_number, row.story_number);
        match view.stories.get(&(row.epic_number, row.story_number)) {
            None => mismatches.push(Mismatch {
                entity_key: key,
                expected: format!("record file at {}", row.source_path),
                actual: "absent".to_string(),
            }),
            Some(meta) => {
                compare(&mut mismatches, &key, "title", &meta.title, &row.title);
                // A file without explicit status constrains nothing; the row
                // carries the inferred value.
                if let Some(status) = meta.status {
                    compare(&mut mismatches, &key, "status", &status, &row.status);
                }
                check_revision(&mut mismatches, repo, &view.head, &key, &row.synced_revision);
            }
        }
    }
    for ((epic, story), _) in &view.stories {
        if index.story(*epic, *story)?.is_none() {
            mismatches.push(Mismatch {
                entity_key: format!("story-{epic}.{story}"),
                expected: "row derived from record file".to_string(),
                actual: "no row".to_string(),
            });
        }
    }

    for row in index.ceremonies()? {
        let key = format!("ceremony-{}", row.id);
        if !view.ceremony_paths.contains(&row.source_path) {
            mismatches.push(Mismatch {
                entity_key: key.clone(),
                expected: format!("record file at {}", row.source_path),
                actual: "absent".to_string(),
            });
            continue;
        }
        check_revision(&mut mismatches, repo, &view.head, &key, &row.synced_revision);
    }

    for row in index.action_items()? {
        let key = format!("action-{}", row.id);
        check_revision(&mut mismatches, repo, &view.head, &key, &row.synced_revision);
    }

    Ok(ConsistencyReport {
        checked_at: Utc::now(),
        mismatches,
        repaired: false,
    })
}

fn compare<T: PartialEq + std::fmt::Display>(
    mismatches: &mut Vec<Mismatch>,
    key: &str,
    field: &str,
    expected: &T,
    actual: &T,
) {
    if expected != actual {
        mismatches.push(Mismatch {
            entity_key: key.to_string(),
            expected: format!("{field} = {expected}"),
            actual: format!("{field} = {actual}"),
        });
    }
}

fn check_revision(
    mismatches: &mut Vec<Mismatch>,
    repo: &GitRepo,
    head: &str,
    key: &str,
    rev: &str,
) {
    if !reachable(repo, rev, head) {
        mismatches.push(Mismatch {
            entity_key: key.to_string(),
            expected: "synced_revision reachable from head".to_string(),
            actual: if rev.is_empty() {
                "empty revision".to_string()
            } else {
                format!("orphan revision {rev}")
            },
        });
    }
}

// ---------------------------------------------------------------------------
// repair_consistency
// ---------------------------------------------------------------------------

/// Re-derive every mismatched row from its record file at head. Runs as an
/// exclusive operation; only the index is written, so no commit is made.
pub fn repair_consistency(
    root: &Path,
    repo: &GitRepo,
    index: &mut Index,
    flags: &GuardFlags,
    cache: &ContextCache,
    report: &ConsistencyReport,
) -> Result<ConsistencyReport> {
    guard::check_before_operation(root, repo, flags, OperationKind::Repair)?;
    let _ticket = flags.begin_exclusive(OperationKind::Repair.as_str())?;

    let view = HeadView::load(repo)?;
    let mut epics_to_fix: BTreeSet<u32> = BTreeSet::new();
    let mut stories_to_fix: BTreeSet<(u32, u32)> = BTreeSet::new();
    let mut ceremonies_to_fix: BTreeSet<i64> = BTreeSet::new();
    let mut actions_to_fix: BTreeSet<String> = BTreeSet::new();
    for mismatch in &report.mismatches {
        let key = mismatch.entity_key.as_str();
        if let Some(n) = key.strip_prefix("epic-").and_then(|n| n.parse().ok()) {
            epics_to_fix.insert(n);
        } else if let Some((e, s)) = key
            .strip_prefix("story-")
            .and_then(|k| k.split_once('.'))
            .and_then(|(e, s)| Some((e.parse().ok()?, s.parse().ok()?)))
        {
            stories_to_fix.insert((e, s));
            // Story drift shifts the parent epic's counts too.
            epics_to_fix.insert(e);
        } else if let Some(id) = key.strip_prefix("ceremony-").and_then(|n| n.parse().ok()) {
            ceremonies_to_fix.insert(id);
        } else if let Some(id) = key.strip_prefix("action-") {
            actions_to_fix.insert(id.to_string());
        }
    }

    let ceremony_rows = index.ceremonies()?;
    let txn = index.begin()?;
    for &(epic, story) in &stories_to_fix {
        match view.stories.get(&(epic, story)) {
            Some(meta) => {
                let rel = paths::story_record_rel(epic, story).display().to_string();
                let (status, inferred) = match meta.status {
                    Some(status) => (status, false),
                    None => (infer_story_status(repo, &rel)?, true),
                };
                let row = StoryRow {
                    epic_number: epic,
                    story_number: story,
                    title: meta.title.clone(),
                    status,
                    source_path: rel,
                    synced_revision: view.head.clone(),
                    inferred,
                };
                tracing::info!(epic, story, status = %status, "repair: rewrote story row");
                txn.upsert_story(&row)?;
            }
            None => {
                tracing::info!(epic, story, "repair: deleted story row without record file");
                txn.delete_story(epic, story)?;
            }
        }
    }
    for &epic in &epics_to_fix {
        match view.epics.get(&epic) {
            Some(meta) => {
                let (story_count, completed_story_count) = view.story_counts(epic);
                let row = EpicRow {
                    epic_number: epic,
                    title: meta.title.clone(),
                    status: meta.status,
                    story_count,
                    completed_story_count,
                    source_path: paths::epic_record_rel(epic).display().to_string(),
                    synced_revision: view.head.clone(),
                };
                tracing::info!(epic, "repair: rewrote epic row");
                txn.upsert_epic(&row)?;
            }
            None => {
                tracing::info!(epic, "repair: deleted epic row without record file");
                txn.delete_epic(epic)?;
            }
        }
    }
    for &id in &ceremonies_to_fix {
        // A ceremony row either still has its file (orphan revision only,
        // re-stamp it) or has lost it (delete).
        let still_present = ceremony_rows
            .iter()
            .find(|c| c.id == id)
            .map(|c| view.ceremony_paths.contains(&c.source_path))
            .unwrap_or(false);
        if still_present {
            tracing::info!(ceremony = id, "repair: re-stamped ceremony row");
            txn.restamp_ceremony(id, &view.head)?;
        } else {
            tracing::info!(ceremony = id, "repair: deleted ceremony row without record file");
            txn.delete_ceremony(id)?;
        }
    }
    for id in &actions_to_fix {
        tracing::info!(action = %id, "repair: re-stamped action item row");
        txn.restamp_action_item(id, &view.head)?;
    }
    txn.commit()?;
    cache.clear();

    Ok(ConsistencyReport {
        checked_at: Utc::now(),
        mismatches: report.mismatches.clone(),
        repaired: true,
    })
}

/// Reconstruct a story's status from the commit subjects that touched it.
/// The write protocol's deterministic messages make the last transition
/// recoverable; a story with no transition history is a draft.
pub(crate) fn infer_story_status(repo: &GitRepo, rel_path: &str) -> Result<StoryStatus> {
    for subject in repo.log_subjects(rel_path)? {
        if let Some(rest) = subject.strip_prefix("story: complete ") {
            if !rest.is_empty() {
                return Ok(StoryStatus::Done);
            }
        }
        if let Some(rest) = subject.strip_prefix("story: transition ") {
            if let Some((_, status)) = rest.rsplit_once(" to ") {
                if let Ok(status) = status.parse::<StoryStatus>() {
                    return Ok(status);
                }
            }
        }
    }
    Ok(StoryStatus::Draft)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
