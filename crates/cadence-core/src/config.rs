use crate::error::{Result, StateError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// CadenceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: String,
    /// Total attempts for a commit hitting lock-contention-class failures.
    #[serde(default = "default_commit_attempts")]
    pub commit_attempts: u32,
    /// Name of the isolated branch migrations run on.
    #[serde(default = "default_migration_branch")]
    pub migration_branch: String,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    /// Size of the preflight probe file proving the operational directory
    /// is writable before a migration starts.
    #[serde(default = "default_preflight_probe_bytes")]
    pub preflight_probe_bytes: u64,
}

fn default_version() -> u32 {
    1
}

fn default_commit_attempts() -> u32 {
    3
}

fn default_migration_branch() -> String {
    "cadence-migration".to_string()
}

fn default_cache_enabled() -> bool {
    true
}

fn default_preflight_probe_bytes() -> u64 {
    4 * 1024 * 1024
}

impl CadenceConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            version: 1,
            project: project.into(),
            commit_attempts: default_commit_attempts(),
            migration_branch: default_migration_branch(),
            cache_enabled: default_cache_enabled(),
            preflight_probe_bytes: default_preflight_probe_bytes(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(StateError::NotInitialized.into());
        }
        let data = std::fs::read_to_string(&path)?;
        let config: CadenceConfig = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CadenceError;
    use tempfile::TempDir;

    #[test]
    fn config_roundtrip() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".cadence")).unwrap();

        let config = CadenceConfig::new("my-project");
        config.save(dir.path()).unwrap();

        let loaded = CadenceConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.project, "my-project");
        assert_eq!(loaded.commit_attempts, 3);
        assert_eq!(loaded.migration_branch, "cadence-migration");
    }

    #[test]
    fn load_without_init_fails() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            CadenceConfig::load(dir.path()),
            Err(CadenceError::State(StateError::NotInitialized))
        ));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".cadence")).unwrap();
        std::fs::write(
            dir.path().join(".cadence/config.yaml"),
            "project: sparse\n",
        )
        .unwrap();

        let loaded = CadenceConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.commit_attempts, 3);
        assert!(loaded.cache_enabled);
    }
}
