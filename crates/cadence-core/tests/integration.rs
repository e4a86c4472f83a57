use cadence_core::error::{CadenceError, StateError};
use cadence_core::record::StoryDoc;
use cadence_core::types::{CeremonyType, EpicStatus, StoryStatus};
use cadence_core::Project;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn init_project(dir: &TempDir) -> Project {
    git(dir.path(), &["init", "-q", "-b", "main"]);
    git(dir.path(), &["config", "user.name", "test"]);
    git(dir.path(), &["config", "user.email", "test@example.com"]);
    Project::init(dir.path(), "integration").unwrap()
}

// ---------------------------------------------------------------------------
// Story creation
// ---------------------------------------------------------------------------

#[test]
fn create_story_produces_file_row_and_commit() {
    let dir = TempDir::new().unwrap();
    let mut project = init_project(&dir);
    project.create_epic(3, "Payments").unwrap();

    let commits_before = commit_count(dir.path());
    let row = project.create_story(3, 5, "X").unwrap();

    assert!(dir.path().join("cadence/epic-3/story-3.5.md").exists());
    assert_eq!(row.status, StoryStatus::Draft);
    assert_eq!(commit_count(dir.path()), commits_before + 1);

    // A subsequent mutation passes the guard: the tree is clean.
    project.create_story(3, 6, "Y").unwrap();
}

#[test]
fn dirty_tree_blocks_mutations_and_names_files() {
    let dir = TempDir::new().unwrap();
    let mut project = init_project(&dir);
    project.create_epic(1, "E").unwrap();

    std::fs::write(dir.path().join("notes.txt"), "scratch").unwrap();
    let err = project.create_story(1, 1, "Blocked").unwrap_err();
    match err {
        CadenceError::State(StateError::DirtyWorkingTree { files }) => {
            assert_eq!(files, vec!["notes.txt"]);
        }
        other => panic!("expected DirtyWorkingTree, got {other}"),
    }
    // Nothing was mutated.
    assert!(!dir.path().join("cadence/epic-1/story-1.1.md").exists());

    std::fs::remove_file(dir.path().join("notes.txt")).unwrap();
    project.create_story(1, 1, "Unblocked").unwrap();
}

// ---------------------------------------------------------------------------
// Migration over many records, with a malformed story
// ---------------------------------------------------------------------------

#[test]
fn migration_fails_on_malformed_story_then_succeeds_after_fix() {
    let dir = TempDir::new().unwrap();
    let mut project = init_project(&dir);
    for epic in 1..=3u32 {
        project.create_epic(epic, &format!("Epic {epic}")).unwrap();
        for story in 1..=4u32 {
            project
                .create_story(epic, story, &format!("Story {epic}.{story}"))
                .unwrap();
        }
    }

    // Break one story's metadata block and record the checkpoint.
    std::fs::write(
        dir.path().join("cadence/epic-2/story-2.3.md"),
        "---\nepic: 2\nstory: [oops\n---\nbody\n",
    )
    .unwrap();
    git(dir.path(), &["add", "cadence/epic-2/story-2.3.md"]);
    git(dir.path(), &["commit", "-q", "-m", "corrupt story"]);
    let checkpoint = head(dir.path());

    let err = project.run_migration().unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("story-2.3"), "{msg}");
    assert!(msg.contains("malformed metadata block"), "{msg}");

    // Head restored to the pre-migration checkpoint; no isolated branch left.
    assert_eq!(head(dir.path()), checkpoint);
    assert!(project.repo().is_clean().unwrap());
    assert!(!project.repo().branch_exists("cadence-migration").unwrap());

    // Fix the record, re-run: all phases complete and merge.
    StoryDoc::new(2, 3, "Story 2.3").save(dir.path()).unwrap();
    git(dir.path(), &["add", "cadence/epic-2/story-2.3.md"]);
    git(dir.path(), &["commit", "-q", "-m", "fix story"]);

    let outcome = project.run_migration().unwrap();
    assert_eq!(outcome.epics, 3);
    assert_eq!(outcome.stories, 12);
    assert_eq!(project.index().epic_count().unwrap(), 3);
    assert_eq!(project.index().story_count().unwrap(), 12);
    assert!(project.check_consistency().unwrap().is_consistent());
}

// ---------------------------------------------------------------------------
// Consistency is deterministic and side-effect-free
// ---------------------------------------------------------------------------

#[test]
fn consecutive_checks_report_zero_mismatches() {
    let dir = TempDir::new().unwrap();
    let mut project = init_project(&dir);
    project.create_epic(1, "E").unwrap();
    project.create_story(1, 1, "S").unwrap();
    project
        .record_ceremony(
            1,
            CeremonyType::Planning,
            vec!["dev-agent".into()],
            "Planned the work.",
            vec![],
        )
        .unwrap();

    let head_before = head(dir.path());
    let first = project.check_consistency().unwrap();
    let second = project.check_consistency().unwrap();
    assert!(first.is_consistent(), "{:?}", first.mismatches);
    assert!(second.is_consistent());
    // No side effects: no new commits, tree untouched.
    assert_eq!(head(dir.path()), head_before);
    assert!(project.repo().is_clean().unwrap());
}

// ---------------------------------------------------------------------------
// Reads never observe a torn epic view
// ---------------------------------------------------------------------------

#[test]
fn epic_view_is_consistent_across_a_transition() {
    let dir = TempDir::new().unwrap();
    let mut project = init_project(&dir);
    project.create_epic(3, "Payments").unwrap();
    project.create_story(3, 1, "S1").unwrap();
    project.create_story(3, 2, "S2").unwrap();
    project
        .transition_story(3, 1, StoryStatus::InProgress)
        .unwrap();

    let before = project.get_epic_context(3).unwrap();
    project.complete_story(3, 1).unwrap();
    let after = project.get_epic_context(3).unwrap();

    // Each view's progress count matches its stories' stated statuses.
    for view in [&before, &after] {
        let done = view
            .stories
            .iter()
            .filter(|s| s.status == StoryStatus::Done)
            .count() as u32;
        assert_eq!(view.epic.completed_story_count, done);
    }
    assert_eq!(before.epic.completed_story_count, 0);
    assert_eq!(after.epic.completed_story_count, 1);
    assert_eq!(after.epic.status, EpicStatus::InProgress);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn head(dir: &Path) -> String {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn commit_count(dir: &Path) -> u32 {
    let output = Command::new("git")
        .args(["rev-list", "--count", "HEAD"])
        .current_dir(dir)
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout).trim().parse().unwrap()
}
