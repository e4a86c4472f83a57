//! Thin wrapper over the `git` binary.
//!
//! The state layer assumes a version-control client exists and exposes
//! commit/branch/merge/checkout/revert primitives; this module shells out to
//! `git` for them. Every failure carries the subcommand and stderr.

use crate::error::GitError;
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    /// Open the repository at `root`. Fails if `root` is not inside a git
    /// working tree.
    pub fn open(root: &Path) -> Result<Self, GitError> {
        let repo = Self {
            root: root.to_path_buf(),
        };
        match repo.run(&["rev-parse", "--git-dir"]) {
            Ok(_) => Ok(repo),
            Err(GitError::CommandFailed { .. }) => {
                Err(GitError::NotARepository(root.to_path_buf()))
            }
            Err(e) => Err(e),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ---------------------------------------------------------------------------
    // Plumbing
    // ---------------------------------------------------------------------------

    fn output(&self, args: &[&str]) -> Result<std::process::Output, GitError> {
        Ok(Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()?)
    }

    fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.output(args)?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    // ---------------------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------------------

    /// Paths with uncommitted changes (staged, unstaged or untracked).
    pub fn dirty_paths(&self) -> Result<Vec<String>, GitError> {
        let out = self.run(&["status", "--porcelain"])?;
        let mut paths = Vec::new();
        for line in out.lines() {
            if line.len() < 4 {
                continue;
            }
            let path = &line[3..];
            // Renames are reported as "old -> new"; the new path is the dirty one.
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            paths.push(path.trim_matches('"').to_string());
        }
        Ok(paths)
    }

    pub fn is_clean(&self) -> Result<bool, GitError> {
        Ok(self.dirty_paths()?.is_empty())
    }

    // ---------------------------------------------------------------------------
    // Revisions
    // ---------------------------------------------------------------------------

    pub fn head(&self) -> Result<String, GitError> {
        self.run(&["rev-parse", "HEAD"])
            .map_err(|_| GitError::RevisionNotFound("HEAD".to_string()))
    }

    /// Whether `rev` is reachable from `from`.
    pub fn is_reachable(&self, rev: &str, from: &str) -> Result<bool, GitError> {
        let output = self.output(&["merge-base", "--is-ancestor", rev, from])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(GitError::CommandFailed {
                command: "merge-base".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    /// Committer timestamp of `rev` in seconds since the epoch.
    pub fn commit_timestamp(&self, rev: &str) -> Result<i64, GitError> {
        let out = self.run(&["show", "-s", "--format=%ct", rev])?;
        out.parse()
            .map_err(|_| GitError::RevisionNotFound(rev.to_string()))
    }

    /// File content at a given revision (`git show rev:path`).
    pub fn show(&self, rev: &str, rel_path: &str) -> Result<String, GitError> {
        self.run(&["show", &format!("{rev}:{rel_path}")])
    }

    /// Repo-relative paths under `prefix` at `rev`.
    pub fn ls_tree(&self, rev: &str, prefix: &str) -> Result<Vec<String>, GitError> {
        let out = self.run(&["ls-tree", "-r", "--name-only", rev, "--", prefix])?;
        Ok(out.lines().map(|l| l.to_string()).collect())
    }

    /// Commit subjects touching `rel_path`, newest first.
    pub fn log_subjects(&self, rel_path: &str) -> Result<Vec<String>, GitError> {
        let out = self.run(&["log", "--format=%s", "--", rel_path])?;
        Ok(out.lines().map(|l| l.to_string()).collect())
    }

    fn tracked_in_head(&self, rel_path: &str) -> Result<bool, GitError> {
        let output = self.output(&["cat-file", "-e", &format!("HEAD:{rel_path}")])?;
        Ok(output.status.success())
    }

    // ---------------------------------------------------------------------------
    // Staging and committing
    // ---------------------------------------------------------------------------

    pub fn stage(&self, rel_paths: &[&str]) -> Result<(), GitError> {
        let mut args = vec!["add", "--"];
        args.extend(rel_paths);
        self.run(&args)?;
        Ok(())
    }

    /// Commit staged changes and return the resulting revision id.
    pub fn commit(&self, message: &str) -> Result<String, GitError> {
        self.run(&["commit", "-q", "-m", message])?;
        self.head()
    }

    /// Commit even when nothing changed — used to keep a migration's phase
    /// chain strictly linear.
    pub fn commit_allow_empty(&self, message: &str) -> Result<String, GitError> {
        self.run(&["commit", "-q", "--allow-empty", "-m", message])?;
        self.head()
    }

    /// Discard uncommitted changes to the given paths: tracked files are
    /// restored from HEAD, files new in this transaction are removed.
    pub fn discard_paths(&self, rel_paths: &[&str]) -> Result<(), GitError> {
        if rel_paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["reset", "-q", "HEAD", "--"];
        args.extend(rel_paths);
        // Fails in an empty repository; there is nothing staged to keep then.
        let _ = self.run(&args);
        for rel in rel_paths {
            if self.tracked_in_head(rel)? {
                self.run(&["checkout", "-q", "--", rel])?;
            } else {
                let abs = self.root.join(rel);
                if abs.exists() {
                    std::fs::remove_file(&abs).map_err(GitError::Spawn)?;
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // Branches and merges
    // ---------------------------------------------------------------------------

    pub fn current_branch(&self) -> Result<String, GitError> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn branch_exists(&self, name: &str) -> Result<bool, GitError> {
        let output = self.output(&["rev-parse", "--verify", "-q", &format!("refs/heads/{name}")])?;
        Ok(output.status.success())
    }

    pub fn create_branch(&self, name: &str, at: &str) -> Result<(), GitError> {
        self.run(&["branch", name, at])?;
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        self.run(&["branch", "-q", "-D", name])?;
        Ok(())
    }

    pub fn checkout(&self, rev: &str) -> Result<(), GitError> {
        self.run(&["checkout", "-q", rev])?;
        Ok(())
    }

    pub fn reset_hard(&self, rev: &str) -> Result<(), GitError> {
        self.run(&["reset", "-q", "--hard", rev])?;
        Ok(())
    }

    /// Merge `branch` into the current branch with an explicit merge commit.
    pub fn merge(&self, branch: &str, message: &str) -> Result<String, GitError> {
        self.run(&["merge", "-q", "--no-ff", "-m", message, branch])?;
        self.head()
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::testutil::init_repo;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_outside_repository_fails() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            GitRepo::open(dir.path()),
            Err(GitError::NotARepository(_))
        ));
    }

    #[test]
    fn dirty_paths_lists_untracked_and_modified() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        assert!(repo.is_clean().unwrap());

        std::fs::write(dir.path().join("new.txt"), "x").unwrap();
        std::fs::write(dir.path().join("README.md"), "changed").unwrap();

        let dirty = repo.dirty_paths().unwrap();
        assert!(dirty.contains(&"new.txt".to_string()));
        assert!(dirty.contains(&"README.md".to_string()));
    }

    #[test]
    fn commit_returns_new_head() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        let before = repo.head().unwrap();

        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        repo.stage(&["a.txt"]).unwrap();
        let rev = repo.commit("add a").unwrap();

        assert_ne!(rev, before);
        assert_eq!(rev, repo.head().unwrap());
        assert!(repo.is_reachable(&before, &rev).unwrap());
    }

    #[test]
    fn show_reads_file_at_revision() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "v1").unwrap();
        repo.stage(&["a.txt"]).unwrap();
        let rev1 = repo.commit("v1").unwrap();

        std::fs::write(dir.path().join("a.txt"), "v2").unwrap();
        repo.stage(&["a.txt"]).unwrap();
        repo.commit("v2").unwrap();

        assert_eq!(repo.show(&rev1, "a.txt").unwrap(), "v1");
        assert_eq!(repo.show("HEAD", "a.txt").unwrap(), "v2");
    }

    #[test]
    fn discard_removes_new_and_restores_tracked() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());

        std::fs::write(dir.path().join("README.md"), "changed").unwrap();
        std::fs::write(dir.path().join("fresh.txt"), "new").unwrap();
        repo.stage(&["README.md", "fresh.txt"]).unwrap();

        repo.discard_paths(&["README.md", "fresh.txt"]).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "# test\n"
        );
        assert!(!dir.path().join("fresh.txt").exists());
        assert!(repo.is_clean().unwrap());
    }

    #[test]
    fn branch_create_merge_delete() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        let base = repo.head().unwrap();

        repo.create_branch("work", &base).unwrap();
        assert!(repo.branch_exists("work").unwrap());
        repo.checkout("work").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        repo.stage(&["b.txt"]).unwrap();
        let on_branch = repo.commit("branch work").unwrap();

        repo.checkout("main").unwrap();
        let merged = repo.merge("work", "merge work").unwrap();
        assert!(repo.is_reachable(&on_branch, &merged).unwrap());

        repo.delete_branch("work").unwrap();
        assert!(!repo.branch_exists("work").unwrap());
    }

    #[test]
    fn is_reachable_false_for_unmerged_branch() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        let base = repo.head().unwrap();

        repo.create_branch("side", &base).unwrap();
        repo.checkout("side").unwrap();
        std::fs::write(dir.path().join("s.txt"), "s").unwrap();
        repo.stage(&["s.txt"]).unwrap();
        let side_rev = repo.commit("side").unwrap();
        repo.checkout("main").unwrap();

        assert!(!repo.is_reachable(&side_rev, "HEAD").unwrap());
    }

    #[test]
    fn log_subjects_newest_first() {
        let dir = TempDir::new().unwrap();
        let repo = init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "1").unwrap();
        repo.stage(&["a.txt"]).unwrap();
        repo.commit("first touch").unwrap();
        std::fs::write(dir.path().join("a.txt"), "2").unwrap();
        repo.stage(&["a.txt"]).unwrap();
        repo.commit("second touch").unwrap();

        let subjects = repo.log_subjects("a.txt").unwrap();
        assert_eq!(subjects, vec!["second touch", "first touch"]);
    }
}
