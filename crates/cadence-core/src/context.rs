//! Read-optimized context loading over the index.
//!
//! An in-memory cache keyed by entity identifier, invalidated precisely by
//! the write protocol when a commit touches that identifier — never by time.
//! Reads are read-committed: a read started before a commit may return the
//! pre-commit view, a read started after always sees the new data, and a
//! partially-written row is never observable because rows only become
//! visible when their index transaction commits.

use crate::error::{Result, StateError};
use crate::index::{ActionItemRow, CeremonyRow, EpicRow, Index, StoryRow};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Ceremonies returned with an epic context, newest first.
const RECENT_CEREMONIES: u32 = 5;

// ---------------------------------------------------------------------------
// Context views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EpicContext {
    pub epic: EpicRow,
    pub stories: Vec<StoryRow>,
    pub recent_ceremonies: Vec<CeremonyRow>,
}

#[derive(Debug, Clone)]
pub struct StoryContext {
    pub story: StoryRow,
    pub epic: EpicRow,
    pub action_items: Vec<ActionItemRow>,
}

// ---------------------------------------------------------------------------
// ContextCache
// ---------------------------------------------------------------------------

/// Owned by the read layer; only ever invalidated by the write layer.
pub struct ContextCache {
    enabled: bool,
    epics: RwLock<HashMap<u32, Arc<EpicContext>>>,
    stories: RwLock<HashMap<(u32, u32), Arc<StoryContext>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContextCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            epics: RwLock::new(HashMap::new()),
            stories: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    // ---------------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------------

    pub fn epic_context(&self, index: &Index, epic: u32) -> Result<Arc<EpicContext>> {
        if self.enabled {
            if let Some(ctx) = self.read_epics().get(&epic) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(ctx));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let row = index.epic(epic)?.ok_or(StateError::EpicNotFound(epic))?;
        let ctx = Arc::new(EpicContext {
            stories: index.stories_for_epic(epic)?,
            recent_ceremonies: index.ceremonies_for_epic(epic, RECENT_CEREMONIES)?,
            epic: row,
        });
        if self.enabled {
            self.write_epics().insert(epic, Arc::clone(&ctx));
        }
        Ok(ctx)
    }

    pub fn story_context(&self, index: &Index, epic: u32, story: u32) -> Result<Arc<StoryContext>> {
        if self.enabled {
            if let Some(ctx) = self.read_stories().get(&(epic, story)) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(ctx));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let story_row = index
            .story(epic, story)?
            .ok_or(StateError::StoryNotFound { epic, story })?;
        let epic_row = index.epic(epic)?.ok_or(StateError::EpicNotFound(epic))?;
        let ctx = Arc::new(StoryContext {
            action_items: index.action_items_for_story(epic, story)?,
            story: story_row,
            epic: epic_row,
        });
        if self.enabled {
            self.write_stories().insert((epic, story), Arc::clone(&ctx));
        }
        Ok(ctx)
    }

    // ---------------------------------------------------------------------------
    // Invalidation (write layer only)
    // ---------------------------------------------------------------------------

    /// Drop the cached epic and every story context under it.
    pub fn invalidate_epic(&self, epic: u32) {
        self.write_epics().remove(&epic);
        self.write_stories().retain(|(e, _), _| *e != epic);
    }

    pub fn invalidate_story(&self, epic: u32, story: u32) {
        self.write_stories().remove(&(epic, story));
    }

    /// Drop everything. Used after repair, migration and merge resolution.
    pub fn clear(&self) {
        self.write_epics().clear();
        self.write_stories().clear();
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    // Lock poisoning cannot corrupt a pure cache; recover the guard.
    fn read_epics(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u32, Arc<EpicContext>>> {
        self.epics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_epics(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u32, Arc<EpicContext>>> {
        self.epics.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_stories(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<(u32, u32), Arc<StoryContext>>> {
        self.stories.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_stories(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<(u32, u32), Arc<StoryContext>>> {
        self.stories.write().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
