//! Domain types shared by the Store, Task Processor, Worker and Control API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusion cutoff enforced by the Normaliser regardless of the LLM's stated boolean.
pub const SCORE_THRESHOLD: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Paused,
    FullScreening,
    Done,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }

    pub fn is_processable(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::FullScreening)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::FullScreening => "full_screening",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Progress {
    pub total: u64,
    pub current: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerClaim {
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub user_id: String,
    pub search_query: String,
    pub criteria: String,
    pub model: String,
    pub status: TaskStatus,
    pub progress: Progress,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub remaining_articles: Vec<String>,
    pub processing_lock: Option<String>,
    pub worker_claim: Option<WorkerClaim>,
    pub name: String,
    #[serde(default = "Utc::now")]
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub task_id: String,
    pub article_id: String,
    pub title: String,
    pub abstract_text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub title: String,
    pub abstract_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningResult {
    pub task_id: String,
    pub article_id: String,
    pub included: bool,
    pub reason: String,
    pub relevance_score: f64,
    pub metadata: ResultMetadata,
    pub updated_at: DateTime<Utc>,
}

/// One article's normalised screening verdict, prior to being written as a
/// `ScreeningResult` (it still needs `task_id`/`article_id`/`metadata` bound on).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub included: bool,
    pub reason: String,
    pub relevance_score: f64,
}

impl Decision {
    /// Enforces `included == (relevance_score >= SCORE_THRESHOLD)`, flipping
    /// `included` and swapping an `Included:`/`Excluded:` reason prefix to match.
    pub fn reconcile(mut self) -> Self {
        let correct = self.relevance_score >= SCORE_THRESHOLD;
        if correct != self.included {
            self.included = correct;
            self.reason = swap_prefix(&self.reason, correct);
        }
        self
    }
}

fn swap_prefix(reason: &str, included: bool) -> String {
    const INCLUDED: &str = "Included:";
    const EXCLUDED: &str = "Excluded:";
    if included && reason.starts_with(EXCLUDED) {
        format!("{INCLUDED}{}", &reason[EXCLUDED.len()..])
    } else if !included && reason.starts_with(INCLUDED) {
        format!("{EXCLUDED}{}", &reason[INCLUDED.len()..])
    } else {
        reason.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ArticleInput {
    pub article_id: String,
    pub title: String,
    pub abstract_text: String,
}
