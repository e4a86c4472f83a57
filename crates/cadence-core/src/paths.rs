use crate::error::{CadenceError, Result, StateError};
use crate::types::CeremonyType;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const CADENCE_DIR: &str = ".cadence";
pub const RECORDS_DIR: &str = "cadence";
pub const CEREMONIES_DIR: &str = "ceremonies";

pub const CONFIG_FILE: &str = ".cadence/config.yaml";
pub const INDEX_FILE: &str = ".cadence/index.db";
pub const INDEX_BACKUP_FILE: &str = ".cadence/index.db.pre-migration";
pub const MIGRATION_FILE: &str = ".cadence/migration.yaml";

/// `.gitignore` entries written by init: the index (with its journal and
/// pre-migration copy) and the migration checkpoint are derived operational
/// state, never committed.
pub const GITIGNORE_ENTRIES: &[&str] = &[".cadence/index.db*", ".cadence/migration.yaml"];

// ---------------------------------------------------------------------------
// Repo-relative record paths (stored in index rows, passed to git)
// ---------------------------------------------------------------------------

pub fn epic_dir_rel(epic: u32) -> PathBuf {
    PathBuf::from(RECORDS_DIR).join(format!("epic-{epic}"))
}

pub fn epic_record_rel(epic: u32) -> PathBuf {
    epic_dir_rel(epic).join("epic.md")
}

pub fn story_record_rel(epic: u32, story: u32) -> PathBuf {
    epic_dir_rel(epic).join(format!("story-{epic}.{story}.md"))
}

pub fn ceremonies_dir_rel(epic: u32) -> PathBuf {
    epic_dir_rel(epic).join(CEREMONIES_DIR)
}

pub fn ceremony_record_rel(epic: u32, ceremony: CeremonyType, seq: u32) -> PathBuf {
    ceremonies_dir_rel(epic).join(format!("{ceremony}-{seq:03}.md"))
}

// ---------------------------------------------------------------------------
// Absolute paths
// ---------------------------------------------------------------------------

pub fn cadence_dir(root: &Path) -> PathBuf {
    root.join(CADENCE_DIR)
}

pub fn records_dir(root: &Path) -> PathBuf {
    root.join(RECORDS_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn index_path(root: &Path) -> PathBuf {
    root.join(INDEX_FILE)
}

pub fn index_backup_path(root: &Path) -> PathBuf {
    root.join(INDEX_BACKUP_FILE)
}

pub fn migration_path(root: &Path) -> PathBuf {
    root.join(MIGRATION_FILE)
}

pub fn epic_record(root: &Path, epic: u32) -> PathBuf {
    root.join(epic_record_rel(epic))
}

pub fn story_record(root: &Path, epic: u32, story: u32) -> PathBuf {
    root.join(story_record_rel(epic, story))
}

pub fn ceremony_record(root: &Path, epic: u32, ceremony: CeremonyType, seq: u32) -> PathBuf {
    root.join(ceremony_record_rel(epic, ceremony, seq))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

static IDENT_RE: OnceLock<Regex> = OnceLock::new();

fn ident_re() -> &'static Regex {
    IDENT_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Validate an agent identifier (ceremony participant, action item owner).
pub fn validate_agent_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 || !ident_re().is_match(id) {
        return Err(CadenceError::State(StateError::InvalidIdentifier(
            id.to_string(),
        )));
    }
    Ok(())
}

/// Epic and story numbers are 1-based.
pub fn validate_number(n: u32) -> Result<()> {
    if n == 0 {
        return Err(CadenceError::State(StateError::ZeroNumber));
    }
    Ok(())
}

/// Parse the epic number out of an `epic-N` directory name.
pub fn parse_epic_dir_name(name: &str) -> Option<u32> {
    name.strip_prefix("epic-")?.parse().ok()
}

/// Parse `(epic, story)` out of a `story-N.M.md` file name.
pub fn parse_story_file_name(name: &str) -> Option<(u32, u32)> {
    let stem = name.strip_suffix(".md")?.strip_prefix("story-")?;
    let (e, s) = stem.split_once('.')?;
    Some((e.parse().ok()?, s.parse().ok()?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_paths() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            epic_record(root, 3),
            PathBuf::from("/tmp/proj/cadence/epic-3/epic.md")
        );
        assert_eq!(
            story_record(root, 3, 5),
            PathBuf::from("/tmp/proj/cadence/epic-3/story-3.5.md")
        );
        assert_eq!(
            ceremony_record(root, 3, CeremonyType::Retrospective, 1),
            PathBuf::from("/tmp/proj/cadence/epic-3/ceremonies/retrospective-001.md")
        );
    }

    #[test]
    fn relative_paths_have_no_root() {
        assert_eq!(
            story_record_rel(3, 5),
            PathBuf::from("cadence/epic-3/story-3.5.md")
        );
    }

    #[test]
    fn valid_agent_ids() {
        for id in ["dev-agent", "a", "qa-2", "x1"] {
            validate_agent_id(id).unwrap_or_else(|_| panic!("expected valid: {id}"));
        }
    }

    #[test]
    fn invalid_agent_ids() {
        for id in ["", "-lead", "lead-", "has spaces", "UPPER", "a_b"] {
            assert!(validate_agent_id(id).is_err(), "expected invalid: {id}");
        }
    }

    #[test]
    fn parse_epic_dir_names() {
        assert_eq!(parse_epic_dir_name("epic-3"), Some(3));
        assert_eq!(parse_epic_dir_name("epic-"), None);
        assert_eq!(parse_epic_dir_name("notes"), None);
    }

    #[test]
    fn parse_story_file_names() {
        assert_eq!(parse_story_file_name("story-3.5.md"), Some((3, 5)));
        assert_eq!(parse_story_file_name("story-12.40.md"), Some((12, 40)));
        assert_eq!(parse_story_file_name("story-3.md"), None);
        assert_eq!(parse_story_file_name("epic.md"), None);
    }

    #[test]
    fn zero_numbers_rejected() {
        assert!(validate_number(0).is_err());
        assert!(validate_number(1).is_ok());
    }
}
