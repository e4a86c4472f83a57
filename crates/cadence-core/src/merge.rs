//! Index snapshot reconciliation after a three-way history merge.
//!
//! Merges row-by-row per entity table, last-write-wins keyed by the commit
//! recency of each row's `synced_revision`. Rows changed on only one side
//! pass through; rows changed differently on both sides with no common
//! ancestor value are unresolved conflicts returned for manual review, never
//! silently overwritten. At equal recency the row whose revision id sorts
//! lexicographically smaller wins, so resolution is deterministic.

use crate::error::Result;
use crate::index::{ActionItemRow, CeremonyRow, EpicRow, IndexSnapshot, StoryRow};
use crate::repo::GitRepo;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RowConflict {
    pub table: &'static str,
    pub entity_key: String,
    pub ancestor: Option<String>,
    pub ours: String,
    pub theirs: String,
}

#[derive(Debug, Error)]
#[error("{} unresolved merge conflict(s) require manual review", conflicts.len())]
pub struct MergeConflictError {
    pub conflicts: Vec<RowConflict>,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve with commit timestamps taken from `repo`.
pub fn resolve(
    repo: &GitRepo,
    ancestor: &IndexSnapshot,
    ours: &IndexSnapshot,
    theirs: &IndexSnapshot,
) -> Result<IndexSnapshot> {
    let mut timestamps: HashMap<String, i64> = HashMap::new();
    let mut recency = |rev: &str| -> i64 {
        if let Some(ts) = timestamps.get(rev) {
            return *ts;
        }
        let ts = repo.commit_timestamp(rev).unwrap_or_else(|e| {
            tracing::warn!(revision = %rev, error = %e, "revision has no timestamp, ranking last");
            i64::MIN
        });
        timestamps.insert(rev.to_string(), ts);
        ts
    };
    resolve_with(ancestor, ours, theirs, &mut recency)
}

/// Resolve with an explicit recency function (seconds since epoch per
/// revision id).
pub fn resolve_with(
    ancestor: &IndexSnapshot,
    ours: &IndexSnapshot,
    theirs: &IndexSnapshot,
    recency: &mut dyn FnMut(&str) -> i64,
) -> Result<IndexSnapshot> {
    let mut conflicts = Vec::new();

    let epics = merge_table(
        "epics",
        &ancestor.epics,
        &ours.epics,
        &theirs.epics,
        |r| r.epic_number,
        |r| format!("epic-{}", r.epic_number),
        |r| &r.synced_revision,
        recency,
        &mut conflicts,
    );
    let stories = merge_table(
        "stories",
        &ancestor.stories,
        &ours.stories,
        &theirs.stories,
        |r| (r.epic_number, r.story_number),
        |r| format!("story-{}.{}", r.epic_number, r.story_number),
        |r| &r.synced_revision,
        recency,
        &mut conflicts,
    );
    let action_items = merge_table(
        "action_items",
        &ancestor.action_items,
        &ours.action_items,
        &theirs.action_items,
        |r| r.id,
        |r| format!("action-{}", r.id),
        |r| &r.synced_revision,
        recency,
        &mut conflicts,
    );
    // Ceremony identity is the record path; row ids are assigned per index
    // and differ across sides.
    let ceremonies = merge_table(
        "ceremonies",
        &ancestor.ceremonies,
        &ours.ceremonies,
        &theirs.ceremonies,
        |r| r.source_path.clone(),
        |r| format!("ceremony {}", r.source_path),
        |r| &r.synced_revision,
        recency,
        &mut conflicts,
    );

    if !conflicts.is_empty() {
        return Err(MergeConflictError { conflicts }.into());
    }
    Ok(IndexSnapshot {
        epics,
        stories,
        action_items,
        ceremonies,
    })
}

/// Three-way merge of one table. Appends unresolved conflicts instead of
/// guessing; the caller fails the whole resolution if any accumulate.
#[allow(clippy::too_many_arguments)]
fn merge_table<R, K>(
    table: &'static str,
    ancestor: &[R],
    ours: &[R],
    theirs: &[R],
    key_of: impl Fn(&R) -> K,
    label_of: impl Fn(&R) -> String,
    revision_of: impl Fn(&R) -> &str,
    recency: &mut dyn FnMut(&str) -> i64,
    conflicts: &mut Vec<RowConflict>,
) -> Vec<R>
where
    R: Clone + PartialEq + Serialize,
    K: Ord + Clone,
{
    let by_key = |rows: &[R]| -> BTreeMap<K, R> {
        rows.iter().map(|r| (key_of(r), r.clone())).collect()
    };
    let anc = by_key(ancestor);
    let our = by_key(ours);
    let their = by_key(theirs);

    let mut keys: Vec<K> = anc.keys().chain(our.keys()).chain(their.keys()).cloned().collect();
    keys.sort();
    keys.dedup();

    let mut merged = Vec::new();
    for key in keys {
        match (anc.get(&key), our.get(&key), their.get(&key)) {
            (_, None, None) => {}
            (None, Some(o), None) => merged.push(o.clone()),
            (None, None, Some(t)) => merged.push(t.clone()),
            (Some(a), Some(o), None) => {
                if o == a {
                    // Deleted on theirs, unchanged on ours: deletion wins.
                } else {
                    conflicts.push(RowConflict {
                        table,
                        entity_key: label_of(o),
                        ancestor: Some(render(a)),
                        ours: render(o),
                        theirs: "deleted".to_string(),
                    });
                }
            }
            (Some(a), None, Some(t)) => {
                if t != a {
                    conflicts.push(RowConflict {
                        table,
                        entity_key: label_of(t),
                        ancestor: Some(render(a)),
                        ours: "deleted".to_string(),
                        theirs: render(t),
                    });
                }
            }
            (None, Some(o), Some(t)) => {
                if o == t {
                    merged.push(o.clone());
                } else {
                    // Both sides created the entity differently; there is no
                    // ancestor value to arbitrate with.
                    conflicts.push(RowConflict {
                        table,
                        entity_key: label_of(o),
                        ancestor: None,
                        ours: render(o),
                        theirs: render(t),
                    });
                }
            }
            (Some(a), Some(o), Some(t)) => {
                if o == t || t == a {
                    merged.push(o.clone());
                } else if o == a {
                    merged.push(t.clone());
                } else {
                    merged.push(pick_most_recent(o, t, &revision_of, recency).clone());
                }
            }
        }
    }
    merged
}

fn pick_most_recent<'r, R>(
    ours: &'r R,
    theirs: &'r R,
    revision_of: &impl Fn(&R) -> &str,
    recency: &mut dyn FnMut(&str) -> i64,
) -> &'r R {
    let our_rev = revision_of(ours);
    let their_rev = revision_of(theirs);
    let our_ts = recency(our_rev);
    let their_ts = recency(their_rev);
    if our_ts != their_ts {
        if our_ts > their_ts {
            ours
        } else {
            theirs
        }
    } else if our_rev <= their_rev {
        // Documented tie-break: the lexicographically smaller revision wins.
        ours
    } else {
        theirs
    }
}

fn render<R: Serialize>(row: &R) -> String {
    serde_json::to_string(row).unwrap_or_else(|_| "<unrenderable>".to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CadenceError;
    use crate::types::{EpicStatus, StoryStatus};

    fn epic(n: u32, title: &str, rev: &str) -> EpicRow {
        EpicRow {
            epic_number: n,
            title: title.to_string(),
            status: EpicStatus::InProgress,
            story_count: 0,
            completed_story_count: 0,
            source_path: format!("cadence/epic-{n}/epic.md"),
            synced_revision: rev.to_string(),
        }
    }

    fn story(e: u32, s: u32, status: StoryStatus, rev: &str) -> StoryRow {
        StoryRow {
            epic_number: e,
            story_number: s,
            title: format!("Story {e}.{s}"),
            status,
            source_path: format!("cadence/epic-{e}/story-{e}.{s}.md"),
            synced_revision: rev.to_string(),
            inferred: false,
        }
    }

    fn snapshot(epics: Vec<EpicRow>, stories: Vec<StoryRow>) -> IndexSnapshot {
        IndexSnapshot {
            epics,
            stories,
            ..Default::default()
        }
    }

    fn fixed_recency(map: &[(&str, i64)]) -> impl FnMut(&str) -> i64 {
        let owned: Vec<(String, i64)> = map.iter().map(|(r, t)| (r.to_string(), *t)).collect();
        move |rev: &str| {
            owned
                .iter()
                .find(|(r, _)| r == rev)
                .map(|(_, t)| *t)
                .unwrap_or(i64::MIN)
        }
    }

    #[test]
    fn one_sided_changes_pass_through() {
        let anc = snapshot(vec![epic(1, "A", "r0")], vec![]);
        let ours = snapshot(vec![epic(1, "A renamed", "r1")], vec![]);
        let theirs = snapshot(
            vec![epic(1, "A", "r0")],
            vec![story(1, 1, StoryStatus::Draft, "r2")],
        );

        let mut recency = fixed_recency(&[("r0", 0), ("r1", 1), ("r2", 2)]);
        let merged = resolve_with(&anc, &ours, &theirs, &mut recency).unwrap();
        assert_eq!(merged.epics[0].title, "A renamed");
        assert_eq!(merged.stories.len(), 1);
    }

    #[test]
    fn last_write_wins_by_revision_recency() {
        let anc = snapshot(vec![], vec![story(1, 1, StoryStatus::Draft, "r0")]);
        let ours = snapshot(vec![], vec![story(1, 1, StoryStatus::InProgress, "r1")]);
        let theirs = snapshot(vec![], vec![story(1, 1, StoryStatus::Review, "r2")]);

        let mut recency = fixed_recency(&[("r0", 0), ("r1", 10), ("r2", 20)]);
        let merged = resolve_with(&anc, &ours, &theirs, &mut recency).unwrap();
        assert_eq!(merged.stories[0].status, StoryStatus::Review);

        let mut recency = fixed_recency(&[("r0", 0), ("r1", 30), ("r2", 20)]);
        let merged = resolve_with(&anc, &ours, &theirs, &mut recency).unwrap();
        assert_eq!(merged.stories[0].status, StoryStatus::InProgress);
    }

    #[test]
    fn equal_recency_tie_break_is_deterministic() {
        let anc = snapshot(vec![], vec![story(1, 1, StoryStatus::Draft, "r0")]);
        let ours = snapshot(vec![], vec![story(1, 1, StoryStatus::InProgress, "bbb")]);
        let theirs = snapshot(vec![], vec![story(1, 1, StoryStatus::Review, "aaa")]);

        // Same timestamp on both sides: "aaa" < "bbb", so theirs wins.
        let mut recency = fixed_recency(&[("r0", 0), ("bbb", 5), ("aaa", 5)]);
        let merged = resolve_with(&anc, &ours, &theirs, &mut recency).unwrap();
        assert_eq!(merged.stories[0].status, StoryStatus::Review);
        assert_eq!(merged.stories[0].synced_revision, "aaa");
    }

    #[test]
    fn both_added_differently_is_a_conflict() {
        let anc = snapshot(vec![], vec![]);
        let ours = snapshot(vec![epic(1, "Ours", "r1")], vec![]);
        let theirs = snapshot(vec![epic(1, "Theirs", "r2")], vec![]);

        let mut recency = fixed_recency(&[("r1", 1), ("r2", 2)]);
        let err = resolve_with(&anc, &ours, &theirs, &mut recency).unwrap_err();
        match err {
            CadenceError::MergeConflict(e) => {
                assert_eq!(e.conflicts.len(), 1);
                assert_eq!(e.conflicts[0].entity_key, "epic-1");
                assert!(e.conflicts[0].ancestor.is_none());
            }
            other => panic!("expected MergeConflict, got {other}"),
        }
    }

    #[test]
    fn modify_vs_delete_is_a_conflict() {
        let anc = snapshot(vec![epic(1, "A", "r0")], vec![]);
        let ours = snapshot(vec![epic(1, "A changed", "r1")], vec![]);
        let theirs = snapshot(vec![], vec![]);

        let mut recency = fixed_recency(&[("r0", 0), ("r1", 1)]);
        let err = resolve_with(&anc, &ours, &theirs, &mut recency).unwrap_err();
        match err {
            CadenceError::MergeConflict(e) => {
                assert_eq!(e.conflicts[0].theirs, "deleted");
            }
            other => panic!("expected MergeConflict, got {other}"),
        }
    }

    #[test]
    fn clean_delete_passes_through() {
        let anc = snapshot(vec![epic(1, "A", "r0")], vec![]);
        let ours = snapshot(vec![], vec![]);
        let theirs = snapshot(vec![epic(1, "A", "r0")], vec![]);

        let mut recency = fixed_recency(&[("r0", 0)]);
        let merged = resolve_with(&anc, &ours, &theirs, &mut recency).unwrap();
        assert!(merged.epics.is_empty());
    }

    #[test]
    fn identical_additions_merge_cleanly() {
        let row = story(2, 1, StoryStatus::Draft, "r5");
        let anc = snapshot(vec![], vec![]);
        let ours = snapshot(vec![], vec![row.clone()]);
        let theirs = snapshot(vec![], vec![row]);

        let mut recency = fixed_recency(&[("r5", 5)]);
        let merged = resolve_with(&anc, &ours, &theirs, &mut recency).unwrap();
        assert_eq!(merged.stories.len(), 1);
    }
}
