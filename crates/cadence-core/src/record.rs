//! Canonical record files: epics, stories, ceremony notes.
//!
//! Each record is a prose markdown document with a YAML metadata block
//! between `---` delimiters. Parsing is strict: a block that fails to parse
//! is a fatal, file-identified error — migration and consistency checks
//! never skip a malformed record.

use crate::error::RecordError;
use crate::paths;
use crate::types::{CeremonyType, EpicStatus, StoryStatus};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Metadata blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicMeta {
    pub epic: u32,
    pub title: String,
    pub status: EpicStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryMeta {
    pub epic: u32,
    pub story: u32,
    pub title: String,
    /// Absent in records predating explicit status tracking; migration
    /// infers the value from commit history and writes it back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StoryStatus>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CeremonyActionItem {
    pub description: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CeremonyMeta {
    pub ceremony: CeremonyType,
    pub epic: u32,
    /// Ordered: facilitation order matters for the summary.
    pub participants: Vec<String>,
    pub held_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_items: Vec<CeremonyActionItem>,
}

// ---------------------------------------------------------------------------
// Frontmatter parsing
// ---------------------------------------------------------------------------

/// Extract the YAML content between the first pair of `---` delimiters.
fn extract_metadata(content: &str) -> Option<&str> {
    let rest = content.strip_prefix("---")?;
    let rest = if let Some(r) = rest.strip_prefix('\n') {
        r
    } else if let Some(r) = rest.strip_prefix("\r\n") {
        r
    } else {
        return None;
    };
    let end = rest.find("\n---")?;
    Some(&rest[..end])
}

/// The prose body following the metadata block.
fn extract_body(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("---") else {
        return content;
    };
    let Some(end) = rest.find("\n---") else {
        return content;
    };
    let after = &rest[end + 4..];
    after.trim_start_matches(['\r', '\n'])
}

/// Parse a record's metadata block and body. `path` is only used to name the
/// file in errors.
pub fn parse_record<M: DeserializeOwned>(path: &Path, content: &str) -> Result<(M, String), RecordError> {
    let yaml = extract_metadata(content).ok_or_else(|| RecordError::MissingMetadata {
        path: path.to_path_buf(),
    })?;
    let meta = serde_yaml::from_str(yaml).map_err(|e| RecordError::MalformedMetadata {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok((meta, extract_body(content).to_string()))
}

/// Render a record: metadata block followed by the prose body.
pub fn render_record<M: Serialize>(meta: &M, body: &str) -> Result<String, RecordError> {
    let yaml = serde_yaml::to_string(meta).map_err(|e| RecordError::MalformedMetadata {
        path: PathBuf::new(),
        reason: e.to_string(),
    })?;
    Ok(format!("---\n{yaml}---\n\n{body}"))
}

// ---------------------------------------------------------------------------
// Typed documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EpicDoc {
    pub meta: EpicMeta,
    pub body: String,
}

impl EpicDoc {
    pub fn new(epic: u32, title: impl Into<String>) -> Self {
        let title = title.into();
        let body = format!("# Epic {epic}: {title}\n\n## Goal\n\n_To be written._\n");
        Self {
            meta: EpicMeta {
                epic,
                title,
                status: EpicStatus::NotStarted,
                created_at: Utc::now(),
            },
            body,
        }
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, RecordError> {
        let (meta, body): (EpicMeta, String) = parse_record(path, content)?;
        Ok(Self { meta, body })
    }

    pub fn load(root: &Path, epic: u32) -> Result<Self, RecordError> {
        let path = paths::epic_record(root, epic);
        let content =
            std::fs::read_to_string(&path).map_err(|_| RecordError::NotFound(path.clone()))?;
        let doc = Self::parse(&path, &content)?;
        if doc.meta.epic != epic {
            return Err(RecordError::WrongEntity {
                path,
                expected: format!("epic-{epic}"),
                found: format!("epic-{}", doc.meta.epic),
            });
        }
        Ok(doc)
    }

    pub fn save(&self, root: &Path) -> crate::error::Result<()> {
        let path = paths::epic_record(root, self.meta.epic);
        let content = render_record(&self.meta, &self.body)?;
        crate::io::atomic_write(&path, content.as_bytes())
    }
}

#[derive(Debug, Clone)]
pub struct StoryDoc {
    pub meta: StoryMeta,
    pub body: String,
}

impl StoryDoc {
    pub fn new(epic: u32, story: u32, title: impl Into<String>) -> Self {
        let title = title.into();
        let body = format!(
            "# Story {epic}.{story}: {title}\n\n## Acceptance Criteria\n\n_To be written._\n"
        );
        Self {
            meta: StoryMeta {
                epic,
                story,
                title,
                status: Some(StoryStatus::Draft),
                created_at: Utc::now(),
            },
            body,
        }
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, RecordError> {
        let (meta, body): (StoryMeta, String) = parse_record(path, content)?;
        Ok(Self { meta, body })
    }

    pub fn load(root: &Path, epic: u32, story: u32) -> Result<Self, RecordError> {
        let path = paths::story_record(root, epic, story);
        let content =
            std::fs::read_to_string(&path).map_err(|_| RecordError::NotFound(path.clone()))?;
        let doc = Self::parse(&path, &content)?;
        if doc.meta.epic != epic || doc.meta.story != story {
            return Err(RecordError::WrongEntity {
                path,
                expected: format!("story-{epic}.{story}"),
                found: format!("story-{}.{}", doc.meta.epic, doc.meta.story),
            });
        }
        Ok(doc)
    }

    pub fn save(&self, root: &Path) -> crate::error::Result<()> {
        let path = paths::story_record(root, self.meta.epic, self.meta.story);
        let content = render_record(&self.meta, &self.body)?;
        crate::io::atomic_write(&path, content.as_bytes())
    }
}

#[derive(Debug, Clone)]
pub struct CeremonyDoc {
    pub meta: CeremonyMeta,
    pub body: String,
}

impl CeremonyDoc {
    pub fn new(
        epic: u32,
        ceremony: CeremonyType,
        participants: Vec<String>,
        summary: impl Into<String>,
        action_items: Vec<CeremonyActionItem>,
    ) -> Self {
        let summary = summary.into();
        let body = format!("# {ceremony} — epic {epic}\n\n{summary}\n");
        Self {
            meta: CeremonyMeta {
                ceremony,
                epic,
                participants,
                held_at: Utc::now(),
                action_items,
            },
            body,
        }
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, RecordError> {
        let (meta, body): (CeremonyMeta, String) = parse_record(path, content)?;
        Ok(Self { meta, body })
    }

    pub fn save(&self, root: &Path, seq: u32) -> crate::error::Result<()> {
        let path = paths::ceremony_record(root, self.meta.epic, self.meta.ceremony, seq);
        let content = render_record(&self.meta, &self.body)?;
        crate::io::atomic_write(&path, content.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Directory scans
// ---------------------------------------------------------------------------

/// Epic numbers present in the working tree, ascending.
pub fn list_epic_numbers(root: &Path) -> crate::error::Result<Vec<u32>> {
    let dir = paths::records_dir(root);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut epics = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(n) = paths::parse_epic_dir_name(&entry.file_name().to_string_lossy()) {
            epics.push(n);
        }
    }
    epics.sort_unstable();
    Ok(epics)
}

/// Story numbers for one epic in the working tree, ascending.
pub fn list_story_numbers(root: &Path, epic: u32) -> crate::error::Result<Vec<u32>> {
    let dir = root.join(paths::epic_dir_rel(epic));
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut stories = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some((e, s)) = paths::parse_story_file_name(&name.to_string_lossy()) {
            if e == epic {
                stories.push(s);
            }
        }
    }
    stories.sort_unstable();
    Ok(stories)
}

/// Next sequence number for a ceremony record of the given type.
pub fn next_ceremony_seq(root: &Path, epic: u32, ceremony: CeremonyType) -> crate::error::Result<u32> {
    let dir = root.join(paths::ceremonies_dir_rel(epic));
    if !dir.exists() {
        return Ok(1);
    }
    let prefix = format!("{ceremony}-");
    let mut max = 0u32;
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".md") {
            if let Some(num) = stem.strip_prefix(&prefix) {
                if let Ok(n) = num.parse::<u32>() {
                    max = max.max(n);
                }
            }
        }
    }
    Ok(max + 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
