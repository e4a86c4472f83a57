use crate::error::RecordError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// EpicStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    NotStarted,
    InProgress,
    Complete,
}

impl EpicStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EpicStatus::NotStarted => "not_started",
            EpicStatus::InProgress => "in_progress",
            EpicStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for EpicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EpicStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(EpicStatus::NotStarted),
            "in_progress" => Ok(EpicStatus::InProgress),
            "complete" => Ok(EpicStatus::Complete),
            _ => Err(RecordError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// StoryStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Draft,
    InProgress,
    Review,
    Done,
}

impl StoryStatus {
    pub fn all() -> &'static [StoryStatus] {
        &[
            StoryStatus::Draft,
            StoryStatus::InProgress,
            StoryStatus::Review,
            StoryStatus::Done,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StoryStatus::Draft => "draft",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Review => "review",
            StoryStatus::Done => "done",
        }
    }

    /// Whether a transition from `self` to `target` is allowed.
    ///
    /// Transitions follow the sequence draft < in_progress < review < done,
    /// forward-only, except review → in_progress for rework. `done` is
    /// terminal.
    pub fn can_transition_to(self, target: StoryStatus) -> Result<(), String> {
        if self == StoryStatus::Done {
            return Err("story is done and immutable".to_string());
        }
        if target == self {
            return Err("already in that status".to_string());
        }
        if self == StoryStatus::Review && target == StoryStatus::InProgress {
            return Ok(());
        }
        if target < self {
            return Err("transitions are forward-only".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StoryStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(StoryStatus::Draft),
            "in_progress" => Ok(StoryStatus::InProgress),
            "review" => Ok(StoryStatus::Review),
            "done" => Ok(StoryStatus::Done),
            _ => Err(RecordError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// CeremonyType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyType {
    Planning,
    Standup,
    Review,
    Retrospective,
}

impl CeremonyType {
    pub fn as_str(self) -> &'static str {
        match self {
            CeremonyType::Planning => "planning",
            CeremonyType::Standup => "standup",
            CeremonyType::Review => "review",
            CeremonyType::Retrospective => "retrospective",
        }
    }
}

impl fmt::Display for CeremonyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CeremonyType {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(CeremonyType::Planning),
            "standup" => Ok(CeremonyType::Standup),
            "review" => Ok(CeremonyType::Review),
            "retrospective" => Ok(CeremonyType::Retrospective),
            _ => Err(RecordError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionItemStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionItemStatus {
    Open,
    InProgress,
    Done,
}

impl ActionItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionItemStatus::Open => "open",
            ActionItemStatus::InProgress => "in_progress",
            ActionItemStatus::Done => "done",
        }
    }
}

impl fmt::Display for ActionItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionItemStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ActionItemStatus::Open),
            "in_progress" => Ok(ActionItemStatus::InProgress),
            "done" => Ok(ActionItemStatus::Done),
            _ => Err(RecordError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

/// The mutating operations the guard serializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CreateEpic,
    CreateStory,
    TransitionStory,
    CompleteStory,
    RecordCeremony,
    Repair,
    Migration,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::CreateEpic => "create_epic",
            OperationKind::CreateStory => "create_story",
            OperationKind::TransitionStory => "transition_story",
            OperationKind::CompleteStory => "complete_story",
            OperationKind::RecordCeremony => "record_ceremony",
            OperationKind::Repair => "repair",
            OperationKind::Migration => "migration",
        }
    }

    /// Exclusive operations block all other mutations while they run.
    pub fn is_exclusive(self) -> bool {
        matches!(self, OperationKind::Repair | OperationKind::Migration)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn story_status_ordering() {
        assert!(StoryStatus::Draft < StoryStatus::InProgress);
        assert!(StoryStatus::Review < StoryStatus::Done);
    }

    #[test]
    fn story_status_roundtrip() {
        for status in StoryStatus::all() {
            let parsed = StoryStatus::from_str(status.as_str()).unwrap();
            assert_eq!(*status, parsed);
        }
    }

    #[test]
    fn done_is_terminal() {
        assert!(StoryStatus::Done
            .can_transition_to(StoryStatus::InProgress)
            .is_err());
    }

    #[test]
    fn forward_transitions_allowed() {
        assert!(StoryStatus::Draft
            .can_transition_to(StoryStatus::InProgress)
            .is_ok());
        assert!(StoryStatus::InProgress
            .can_transition_to(StoryStatus::Review)
            .is_ok());
        assert!(StoryStatus::Review
            .can_transition_to(StoryStatus::Done)
            .is_ok());
    }

    #[test]
    fn rework_from_review_allowed() {
        assert!(StoryStatus::Review
            .can_transition_to(StoryStatus::InProgress)
            .is_ok());
    }

    #[test]
    fn backward_transitions_rejected() {
        assert!(StoryStatus::Review
            .can_transition_to(StoryStatus::Draft)
            .is_err());
        assert!(StoryStatus::InProgress
            .can_transition_to(StoryStatus::Draft)
            .is_err());
    }

    #[test]
    fn epic_status_roundtrip() {
        for s in ["not_started", "in_progress", "complete"] {
            assert_eq!(EpicStatus::from_str(s).unwrap().as_str(), s);
        }
        assert!(EpicStatus::from_str("bogus").is_err());
    }

    #[test]
    fn exclusive_operations() {
        assert!(OperationKind::Migration.is_exclusive());
        assert!(OperationKind::Repair.is_exclusive());
        assert!(!OperationKind::CreateStory.is_exclusive());
    }
}
