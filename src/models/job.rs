use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::provider::Provider;
use super::track::{Candidate, SourceTrack};

/// Import job lifecycle. `Done` and `Failed` are terminal; `Failed` is
/// reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    WaitingReview,
    Importing,
    Done,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::WaitingReview => "waiting_review",
            JobState::Importing => "importing",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition(&self, next: JobState) -> bool {
        if next == JobState::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Running, JobState::WaitingReview)
                | (JobState::WaitingReview, JobState::Importing)
                | (JobState::Importing, JobState::Done)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "waiting_review" => Ok(JobState::WaitingReview),
            "importing" => Ok(JobState::Importing),
            "done" => Ok(JobState::Done),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// Pipeline stages dispatched through the job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Match,
    Finalize,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStage::Match => f.write_str("match"),
            JobStage::Finalize => f.write_str("finalize"),
        }
    }
}

/// Verdict the matcher (or the reviewer) assigned to an item.
/// `Skipped` is reserved for the UI and never produced by the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Matched,
    Uncertain,
    NotFound,
    Skipped,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Matched => "matched",
            Classification::Uncertain => "uncertain",
            Classification::NotFound => "not_found",
            Classification::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "matched" => Ok(Classification::Matched),
            "uncertain" => Ok(Classification::Uncertain),
            "not_found" => Ok(Classification::NotFound),
            "skipped" => Ok(Classification::Skipped),
            other => Err(format!("unknown classification: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source_playlist_id: String,
    pub source_playlist_name: Option<String>,
    pub target_provider: Provider,
    pub state: JobState,
    pub error_message: Option<String>,
    pub target_playlist_id: Option<String>,
    pub report: Option<ImportReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportItem {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Index of the track in the source playlist.
    pub position: i32,
    pub source_track: SourceTrack,
    pub best_match: Option<Candidate>,
    pub classification: Classification,
    pub selected_target_id: Option<String>,
}

/// Finalize outcome persisted on the job and served to the UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportReport {
    pub target_playlist_id: String,
    pub missed: MissedReport,
    pub inserted_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MissedReport {
    pub count: usize,
    pub tracks: Vec<String>,
    pub duplicates: DuplicateReport,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DuplicateReport {
    pub count: usize,
    pub items: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(JobState::Queued.can_transition(JobState::Running));
        assert!(JobState::Running.can_transition(JobState::WaitingReview));
        assert!(JobState::WaitingReview.can_transition(JobState::Importing));
        assert!(JobState::Importing.can_transition(JobState::Done));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_only() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::WaitingReview,
            JobState::Importing,
        ] {
            assert!(state.can_transition(JobState::Failed), "{} -> failed", state);
        }
        assert!(!JobState::Done.can_transition(JobState::Failed));
        assert!(!JobState::Failed.can_transition(JobState::Failed));
    }

    #[test]
    fn test_illegal_transitions_refused() {
        assert!(!JobState::Queued.can_transition(JobState::WaitingReview));
        assert!(!JobState::Running.can_transition(JobState::Done));
        assert!(!JobState::Done.can_transition(JobState::Running));
        assert!(!JobState::WaitingReview.can_transition(JobState::Running));
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::WaitingReview,
            JobState::Importing,
            JobState::Done,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
    }

    #[test]
    fn test_classification_round_trip() {
        for classification in [
            Classification::Matched,
            Classification::Uncertain,
            Classification::NotFound,
            Classification::Skipped,
        ] {
            assert_eq!(
                classification.as_str().parse::<Classification>().unwrap(),
                classification
            );
        }
    }
}
