//! The derived relational index.
//!
//! An embedded SQLite database at `.cadence/index.db` holding one row per
//! epic, story, action item and ceremony, each pinned to the revision it
//! reflects. Rows are written inside an [`IndexTxn`] that is committed only
//! after the history commit succeeds; an uncommitted transaction left by a
//! crash is discarded by the SQLite journal on the next open, which is
//! exactly the recovery the write protocol requires.

use crate::error::Result;
use crate::types::{ActionItemStatus, CeremonyType, EpicStatus, StoryStatus};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const SCHEMA_VERSION: i64 = 1;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpicRow {
    pub epic_number: u32,
    pub title: String,
    pub status: EpicStatus,
    pub story_count: u32,
    pub completed_story_count: u32,
    pub source_path: String,
    pub synced_revision: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryRow {
    pub epic_number: u32,
    pub story_number: u32,
    pub title: String,
    pub status: StoryStatus,
    pub source_path: String,
    pub synced_revision: String,
    /// True when the status was reconstructed from history rather than read
    /// from explicit metadata.
    pub inferred: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionItemRow {
    pub id: Uuid,
    pub description: String,
    pub owner: String,
    pub status: ActionItemStatus,
    pub created_at: DateTime<Utc>,
    /// Lookup-only back-reference, never an ownership relation.
    pub related_story: Option<(u32, u32)>,
    pub synced_revision: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CeremonyRow {
    pub id: i64,
    pub ceremony_type: CeremonyType,
    pub epic_number: u32,
    pub participants: Vec<String>,
    pub summary_text: String,
    pub created_at: DateTime<Utc>,
    pub source_path: String,
    pub synced_revision: String,
}

/// All rows of one index, extracted for merge resolution.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    pub epics: Vec<EpicRow>,
    pub stories: Vec<StoryRow>,
    pub action_items: Vec<ActionItemRow>,
    pub ceremonies: Vec<CeremonyRow>,
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schema_meta (
    version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS epics (
    epic_number           INTEGER PRIMARY KEY,
    title                 TEXT NOT NULL,
    status                TEXT NOT NULL,
    story_count           INTEGER NOT NULL DEFAULT 0,
    completed_story_count INTEGER NOT NULL DEFAULT 0,
    source_path           TEXT NOT NULL,
    synced_revision       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS stories (
    epic_number     INTEGER NOT NULL,
    story_number    INTEGER NOT NULL,
    title           TEXT NOT NULL,
    status          TEXT NOT NULL,
    source_path     TEXT NOT NULL,
    synced_revision TEXT NOT NULL,
    inferred        INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (epic_number, story_number)
);
CREATE TABLE IF NOT EXISTS action_items (
    id              TEXT PRIMARY KEY,
    description     TEXT NOT NULL,
    owner           TEXT NOT NULL,
    status          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    related_epic    INTEGER,
    related_story   INTEGER,
    synced_revision TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ceremonies (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    ceremony_type   TEXT NOT NULL,
    epic_number     INTEGER NOT NULL,
    participants    TEXT NOT NULL,
    summary_text    TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    source_path     TEXT NOT NULL,
    synced_revision TEXT NOT NULL
);
";

fn install_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_meta", [], |r| r.get(0))
        .optional()?;
    if version.is_none() {
        conn.execute("INSERT INTO schema_meta (version) VALUES (?1)", [SCHEMA_VERSION])?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

fn parse_col<T: FromStr>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn epic_from_row(row: &Row<'_>) -> rusqlite::Result<EpicRow> {
    Ok(EpicRow {
        epic_number: row.get(0)?,
        title: row.get(1)?,
        status: parse_col(row, 2)?,
        story_count: row.get(3)?,
        completed_story_count: row.get(4)?,
        source_path: row.get(5)?,
        synced_revision: row.get(6)?,
    })
}

fn story_from_row(row: &Row<'_>) -> rusqlite::Result<StoryRow> {
    Ok(StoryRow {
        epic_number: row.get(0)?,
        story_number: row.get(1)?,
        title: row.get(2)?,
        status: parse_col(row, 3)?,
        source_path: row.get(4)?,
        synced_revision: row.get(5)?,
        inferred: row.get(6)?,
    })
}

fn action_item_from_row(row: &Row<'_>) -> rusqlite::Result<ActionItemRow> {
    let id: String = row.get(0)?;
    let related_epic: Option<u32> = row.get(5)?;
    let related_story: Option<u32> = row.get(6)?;
    Ok(ActionItemRow {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?,
        description: row.get(1)?,
        owner: row.get(2)?,
        status: parse_col(row, 3)?,
        created_at: parse_timestamp(row, 4)?,
        related_story: related_epic.zip(related_story),
        synced_revision: row.get(7)?,
    })
}

fn ceremony_from_row(row: &Row<'_>) -> rusqlite::Result<CeremonyRow> {
    let participants: String = row.get(3)?;
    Ok(CeremonyRow {
        id: row.get(0)?,
        ceremony_type: parse_col(row, 1)?,
        epic_number: row.get(2)?,
        participants: serde_json::from_str(&participants)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        summary_text: row.get(4)?,
        created_at: parse_timestamp(row, 5)?,
        source_path: row.get(6)?,
        synced_revision: row.get(7)?,
    })
}

const EPIC_COLS: &str = "epic_number, title, status, story_count, completed_story_count, source_path, synced_revision";
const STORY_COLS: &str = "epic_number, story_number, title, status, source_path, synced_revision, inferred";
const ACTION_COLS: &str = "id, description, owner, status, created_at, related_epic, related_story, synced_revision";
const CEREMONY_COLS: &str = "id, ceremony_type, epic_number, participants, summary_text, created_at, source_path, synced_revision";

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

pub struct Index {
    conn: Connection,
}

impl Index {
    /// Open or create the index database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        install_schema(&conn)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        install_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Drop and recreate every table. Used by migration's schema phase.
    pub fn reset_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS epics;
             DROP TABLE IF EXISTS stories;
             DROP TABLE IF EXISTS action_items;
             DROP TABLE IF EXISTS ceremonies;
             DROP TABLE IF EXISTS schema_meta;",
        )?;
        install_schema(&self.conn)
    }

    pub fn begin(&mut self) -> Result<IndexTxn<'_>> {
        Ok(IndexTxn {
            tx: self.conn.transaction()?,
        })
    }

    // ---------------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------------

    pub fn epic(&self, epic: u32) -> Result<Option<EpicRow>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {EPIC_COLS} FROM epics WHERE epic_number = ?1"),
                [epic],
                epic_from_row,
            )
            .optional()?)
    }

    pub fn epics(&self) -> Result<Vec<EpicRow>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {EPIC_COLS} FROM epics ORDER BY epic_number"))?;
        let rows = stmt.query_map([], epic_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn story(&self, epic: u32, story: u32) -> Result<Option<StoryRow>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {STORY_COLS} FROM stories WHERE epic_number = ?1 AND story_number = ?2"
                ),
                [epic, story],
                story_from_row,
            )
            .optional()?)
    }

    pub fn stories_for_epic(&self, epic: u32) -> Result<Vec<StoryRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STORY_COLS} FROM stories WHERE epic_number = ?1 ORDER BY story_number"
        ))?;
        let rows = stmt.query_map([epic], story_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn stories(&self) -> Result<Vec<StoryRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STORY_COLS} FROM stories ORDER BY epic_number, story_number"
        ))?;
        let rows = stmt.query_map([], story_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn action_items_for_story(&self, epic: u32, story: u32) -> Result<Vec<ActionItemRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ACTION_COLS} FROM action_items
             WHERE related_epic = ?1 AND related_story = ?2 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([epic, story], action_item_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn action_items(&self) -> Result<Vec<ActionItemRow>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ACTION_COLS} FROM action_items ORDER BY id"))?;
        let rows = stmt.query_map([], action_item_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn ceremonies_for_epic(&self, epic: u32, limit: u32) -> Result<Vec<CeremonyRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CEREMONY_COLS} FROM ceremonies
             WHERE epic_number = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map([epic, limit], ceremony_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn ceremonies(&self) -> Result<Vec<CeremonyRow>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {CEREMONY_COLS} FROM ceremonies ORDER BY id"))?;
        let rows = stmt.query_map([], ceremony_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn epic_count(&self) -> Result<u32> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM epics", [], |r| r.get(0))?)
    }

    pub fn story_count(&self) -> Result<u32> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM stories", [], |r| r.get(0))?)
    }

    // ---------------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------------

    pub fn snapshot(&self) -> Result<IndexSnapshot> {
        Ok(IndexSnapshot {
            epics: self.epics()?,
            stories: self.stories()?,
            action_items: self.action_items()?,
            ceremonies: self.ceremonies()?,
        })
    }

    /// Read a snapshot out of another index file (e.g. the ancestor or
    /// theirs side of a merge) without keeping it open.
    pub fn snapshot_from_file(path: &Path) -> Result<IndexSnapshot> {
        let index = Index::open(path)?;
        index.snapshot()
    }

    /// Replace the entire contents with `snapshot`, atomically.
    pub fn apply_snapshot(&mut self, snapshot: &IndexSnapshot) -> Result<()> {
        let txn = self.begin()?;
        txn.tx.execute_batch(
            "DELETE FROM epics;
             DELETE FROM stories;
             DELETE FROM action_items;
             DELETE FROM ceremonies;",
        )?;
        for epic in &snapshot.epics {
            txn.upsert_epic(epic)?;
        }
        for story in &snapshot.stories {
            txn.upsert_story(story)?;
        }
        for item in &snapshot.action_items {
            txn.insert_action_item(item)?;
        }
        for ceremony in &snapshot.ceremonies {
            txn.insert_ceremony_with_id(ceremony)?;
        }
        txn.commit()
    }
}

// ---------------------------------------------------------------------------
// IndexTxn
// ---------------------------------------------------------------------------

/// An open index transaction. Dropping it without calling [`IndexTxn::commit`]
/// rolls every mutation back.
pub struct IndexTxn<'a> {
    tx: Transaction<'a>,
}

impl IndexTxn<'_> {
    pub fn upsert_epic(&self, row: &EpicRow) -> Result<()> {
        self.tx.execute(
            "INSERT INTO epics (epic_number, title, status, story_count, completed_story_count, source_path, synced_revision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(epic_number) DO UPDATE SET
                 title = excluded.title,
                 status = excluded.status,
                 story_count = excluded.story_count,
                 completed_story_count = excluded.completed_story_count,
                 source_path = excluded.source_path,
                 synced_revision = excluded.synced_revision",
            params![
                row.epic_number,
                row.title,
                row.status.as_str(),
                row.story_count,
                row.completed_story_count,
                row.source_path,
                row.synced_revision,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_story(&self, row: &StoryRow) -> Result<()> {
        self.tx.execute(
            "INSERT INTO stories (epic_number, story_number, title, status, source_path, synced_revision, inferred)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(epic_number, story_number) DO UPDATE SET
                 title = excluded.title,
                 status = excluded.status,
                 source_path = excluded.source_path,
                 synced_revision = excluded.synced_revision,
                 inferred = excluded.inferred",
            params![
                row.epic_number,
                row.story_number,
                row.title,
                row.status.as_str(),
                row.source_path,
                row.synced_revision,
                row.inferred,
            ],
        )?;
        Ok(())
    }

    pub fn delete_epic(&self, epic: u32) -> Result<()> {
        self.tx
            .execute("DELETE FROM epics WHERE epic_number = ?1", [epic])?;
        Ok(())
    }

    pub fn delete_story(&self, epic: u32, story: u32) -> Result<()> {
        self.tx.execute(
            "DELETE FROM stories WHERE epic_number = ?1 AND story_number = ?2",
            [epic, story],
        )?;
        Ok(())
    }

    pub fn insert_action_item(&self, row: &ActionItemRow) -> Result<()> {
        self.tx.execute(
            "INSERT INTO action_items (id, description, owner, status, created_at, related_epic, related_story, synced_revision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.id.to_string(),
                row.description,
                row.owner,
                row.status.as_str(),
                row.created_at.to_rfc3339(),
                row.related_story.map(|(e, _)| e),
                row.related_story.map(|(_, s)| s),
                row.synced_revision,
            ],
        )?;
        Ok(())
    }

    /// Insert a ceremony, letting SQLite assign the id. Returns the id.
    pub fn insert_ceremony(&self, row: &CeremonyRow) -> Result<i64> {
        self.tx.execute(
            "INSERT INTO ceremonies (ceremony_type, epic_number, participants, summary_text, created_at, source_path, synced_revision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.ceremony_type.as_str(),
                row.epic_number,
                serde_json::to_string(&row.participants)?,
                row.summary_text,
                row.created_at.to_rfc3339(),
                row.source_path,
                row.synced_revision,
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Insert a ceremony preserving its id (snapshot application).
    fn insert_ceremony_with_id(&self, row: &CeremonyRow) -> Result<()> {
        self.tx.execute(
            "INSERT INTO ceremonies (id, ceremony_type, epic_number, participants, summary_text, created_at, source_path, synced_revision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.id,
                row.ceremony_type.as_str(),
                row.epic_number,
                serde_json::to_string(&row.participants)?,
                row.summary_text,
                row.created_at.to_rfc3339(),
                row.source_path,
                row.synced_revision,
            ],
        )?;
        Ok(())
    }

    pub fn delete_ceremony(&self, id: i64) -> Result<()> {
        self.tx
            .execute("DELETE FROM ceremonies WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Pin an unchanged ceremony row to a reachable revision.
    pub fn restamp_ceremony(&self, id: i64, revision: &str) -> Result<()> {
        self.tx.execute(
            "UPDATE ceremonies SET synced_revision = ?1 WHERE id = ?2",
            params![revision, id],
        )?;
        Ok(())
    }

    /// Pin an unchanged action item row to a reachable revision.
    pub fn restamp_action_item(&self, id: &str, revision: &str) -> Result<()> {
        self.tx.execute(
            "UPDATE action_items SET synced_revision = ?1 WHERE id = ?2",
            params![revision, id],
        )?;
        Ok(())
    }

    /// Stamp every row written by this transaction with the revision the
    /// history commit produced. Rows are written with an empty
    /// `synced_revision` placeholder and must be stamped before commit.
    pub fn stamp(&self, revision: &str) -> Result<()> {
        for table in ["epics", "stories", "action_items", "ceremonies"] {
            self.tx.execute(
                &format!("UPDATE {table} SET synced_revision = ?1 WHERE synced_revision = ''"),
                [revision],
            )?;
        }
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
