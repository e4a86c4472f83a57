//! The context object holding the repository handle, index handle, cache and
//! configuration. Every consumer operation goes through a [`Project`]; there
//! is no global mutable state, while the single-process exclusivity model is
//! preserved by the guard flags it owns.

use crate::config::CadenceConfig;
use crate::consistency::{self, ConsistencyReport};
use crate::context::{ContextCache, EpicContext, StoryContext};
use crate::error::Result;
use crate::guard::GuardFlags;
use crate::index::{CeremonyRow, EpicRow, Index, IndexSnapshot, StoryRow};
use crate::migration::{self, MigrationManager, MigrationOutcome};
use crate::paths;
use crate::record::CeremonyActionItem;
use crate::repo::GitRepo;
use crate::transaction::TransactionManager;
use crate::types::{CeremonyType, StoryStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct Project {
    root: PathBuf,
    repo: GitRepo,
    index: Index,
    cache: ContextCache,
    config: CadenceConfig,
    flags: GuardFlags,
}

impl Project {
    /// Initialize the state layer inside an existing git repository: the
    /// record directory, the hidden operational directory, a default config
    /// and the gitignore entries for derived state, committed so the first
    /// operation starts from a clean tree. Idempotent.
    pub fn init(root: &Path, name: &str) -> Result<Self> {
        if paths::config_path(root).exists() {
            return Self::open(root);
        }
        let repo = GitRepo::open(root)?;
        crate::io::ensure_dir(&paths::cadence_dir(root))?;
        crate::io::ensure_dir(&paths::records_dir(root))?;

        let config = CadenceConfig::new(name);
        config.save(root)?;
        for entry in paths::GITIGNORE_ENTRIES {
            crate::io::ensure_gitignore_entry(root, entry)?;
        }
        let index = Index::open(&paths::index_path(root))?;

        repo.stage(&[paths::CONFIG_FILE, ".gitignore"])?;
        repo.commit("cadence: initialize project")?;
        tracing::info!(project = %name, root = %root.display(), "initialized project");

        let cache_enabled = config.cache_enabled;
        Ok(Self {
            root: root.to_path_buf(),
            repo,
            index,
            cache: ContextCache::new(cache_enabled),
            config,
            flags: GuardFlags::default(),
        })
    }

    /// Open an initialized project. Rolls back any migration a previous
    /// process left incomplete before returning.
    pub fn open(root: &Path) -> Result<Self> {
        let config = CadenceConfig::load(root)?;
        let repo = GitRepo::open(root)?;
        let index = Index::open(&paths::index_path(root))?;
        let cache = ContextCache::new(config.cache_enabled);
        let mut project = Self {
            root: root.to_path_buf(),
            repo,
            index,
            cache,
            config,
            flags: GuardFlags::default(),
        };
        migration::recover(
            &project.root,
            &project.repo,
            &mut project.index,
            &project.cache,
        )?;
        Ok(project)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    pub fn repo(&self) -> &GitRepo {
        &self.repo
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    // ---------------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------------

    fn transactions(&mut self) -> TransactionManager<'_> {
        TransactionManager {
            root: &self.root,
            repo: &self.repo,
            index: &mut self.index,
            cache: &self.cache,
            config: &self.config,
            flags: &self.flags,
        }
    }

    pub fn create_epic(&mut self, epic: u32, title: &str) -> Result<EpicRow> {
        self.transactions().create_epic(epic, title)
    }

    pub fn create_story(&mut self, epic: u32, story: u32, title: &str) -> Result<StoryRow> {
        self.transactions().create_story(epic, story, title)
    }

    pub fn transition_story(
        &mut self,
        epic: u32,
        story: u32,
        target: StoryStatus,
    ) -> Result<StoryRow> {
        self.transactions().transition_story(epic, story, target)
    }

    pub fn complete_story(&mut self, epic: u32, story: u32) -> Result<StoryRow> {
        self.transactions().complete_story(epic, story)
    }

    pub fn record_ceremony(
        &mut self,
        epic: u32,
        ceremony: CeremonyType,
        participants: Vec<String>,
        summary: &str,
        action_items: Vec<CeremonyActionItem>,
    ) -> Result<CeremonyRow> {
        self.transactions()
            .record_ceremony(epic, ceremony, participants, summary, action_items)
    }

    pub fn run_migration(&mut self) -> Result<MigrationOutcome> {
        MigrationManager {
            root: &self.root,
            repo: &self.repo,
            index: &mut self.index,
            cache: &self.cache,
            config: &self.config,
            flags: &self.flags,
        }
        .run()
    }

    // ---------------------------------------------------------------------------
    // Consistency
    // ---------------------------------------------------------------------------

    pub fn check_consistency(&self) -> Result<ConsistencyReport> {
        consistency::check_consistency(&self.repo, &self.index)
    }

    pub fn repair_consistency(&mut self, report: &ConsistencyReport) -> Result<ConsistencyReport> {
        consistency::repair_consistency(
            &self.root,
            &self.repo,
            &mut self.index,
            &self.flags,
            &self.cache,
            report,
        )
    }

    // ---------------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------------

    pub fn get_epic_context(&self, epic: u32) -> Result<Arc<EpicContext>> {
        self.cache.epic_context(&self.index, epic)
    }

    pub fn get_story_context(&self, epic: u32, story: u32) -> Result<Arc<StoryContext>> {
        self.cache.story_context(&self.index, epic, story)
    }

    // ---------------------------------------------------------------------------
    // Merge resolution
    // ---------------------------------------------------------------------------

    /// Reconcile this index with a divergent one after a history merge,
    /// using the current index as "ours". On success the merged snapshot
    /// replaces the index contents.
    pub fn resolve_index_merge(
        &mut self,
        ancestor: &IndexSnapshot,
        theirs: &IndexSnapshot,
    ) -> Result<IndexSnapshot> {
        let ours = self.index.snapshot()?;
        let merged = crate::merge::resolve(&self.repo, ancestor, &ours, theirs)?;
        self.index.apply_snapshot(&merged)?;
        self.cache.clear();
        tracing::info!(
            epics = merged.epics.len(),
            stories = merged.stories.len(),
            "applied merged index snapshot"
        );
        Ok(merged)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CadenceError, StateError};
    use crate::repo::testutil::init_repo;
    use crate::types::EpicStatus;
    use tempfile::TempDir;

    #[test]
    fn init_creates_layout_and_commits() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let project = Project::init(dir.path(), "demo").unwrap();

        assert!(dir.path().join(".cadence/config.yaml").exists());
        assert!(dir.path().join(".cadence/index.db").exists());
        assert!(dir.path().join("cadence").is_dir());
        let gitignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(gitignore.contains(".cadence/index.db"));
        assert!(project.repo().is_clean().unwrap());
    }

    #[test]
    fn init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        Project::init(dir.path(), "demo").unwrap();
        let again = Project::init(dir.path(), "ignored").unwrap();
        assert_eq!(again.config().project, "demo");
    }

    #[test]
    fn open_without_init_fails() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        assert!(matches!(
            Project::open(dir.path()),
            Err(CadenceError::State(StateError::NotInitialized))
        ));
    }

    #[test]
    fn full_story_lifecycle() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mut project = Project::init(dir.path(), "demo").unwrap();

        project.create_epic(3, "Payments").unwrap();
        project.create_story(3, 5, "Checkout").unwrap();
        project
            .transition_story(3, 5, StoryStatus::InProgress)
            .unwrap();
        project.complete_story(3, 5).unwrap();

        let ctx = project.get_epic_context(3).unwrap();
        assert_eq!(ctx.epic.status, EpicStatus::Complete);
        assert_eq!(ctx.epic.completed_story_count, 1);
        assert_eq!(ctx.stories[0].status, StoryStatus::Done);

        assert!(project.check_consistency().unwrap().is_consistent());
    }

    #[test]
    fn cached_read_sees_pre_commit_then_post_commit_view() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let mut project = Project::init(dir.path(), "demo").unwrap();
        project.create_epic(3, "Payments").unwrap();
        project.create_story(3, 5, "Checkout").unwrap();

        // A read before the commit observes the old, fully-consistent view.
        let before = project.get_epic_context(3).unwrap();
        assert_eq!(before.stories[0].status, StoryStatus::Draft);

        project
            .transition_story(3, 5, StoryStatus::InProgress)
            .unwrap();

        // A read after the commit observes the new view, never a torn one.
        let after = project.get_epic_context(3).unwrap();
        assert_eq!(after.stories[0].status, StoryStatus::InProgress);
        assert_eq!(after.epic.status, EpicStatus::InProgress);
        // The pre-commit snapshot the earlier reader holds is still intact.
        assert_eq!(before.stories[0].status, StoryStatus::Draft);
        assert_eq!(before.epic.status, EpicStatus::NotStarted);
    }

    #[test]
    fn reopen_preserves_state() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        {
            let mut project = Project::init(dir.path(), "demo").unwrap();
            project.create_epic(1, "E").unwrap();
        }
        let project = Project::open(dir.path()).unwrap();
        assert_eq!(project.index().epic_count().unwrap(), 1);
        assert!(project.check_consistency().unwrap().is_consistent());
    }
}
