//! Durable storage abstraction (C1).
//!
//! Every mutating operation here is conditional — a plain "replace the
//! document" write is never exposed, because concurrent cancellation,
//! full-screening requests and worker progress updates race on every task
//! (spec §4.1). `MongoStore` is the production backend; `MemoryStore` backs
//! the deterministic tests in §8.

pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::StoreError;
use crate::model::{Article, ArticleInput, ScreeningResult, Task, TaskStatus};

#[derive(Debug, Clone, Default)]
pub struct TaskListFilter {
    pub status: Option<TaskStatus>,
    pub page: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ResultListFilter {
    pub included: Option<bool>,
    pub page: u64,
    pub limit: u64,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: String,
    pub search_query: String,
    pub criteria: String,
    pub model: String,
    pub name: String,
    pub declared_total: u64,
}

/// A conditional status transition, applied only if the task is currently in
/// one of `from` and still owns `lock_id` (when given). `None` fields are
/// left untouched; `Some(None)` on `error` clears it.
#[derive(Debug, Clone, Default)]
pub struct StatusTransition {
    pub error: Option<Option<String>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress_total: Option<u64>,
    pub progress_current: Option<u64>,
    pub remaining_articles: Option<Vec<String>>,
    pub clear_processing_lock: bool,
    pub clear_worker_claim: bool,
}

impl StatusTransition {
    pub fn to_error(message: impl Into<String>, now: DateTime<Utc>) -> Self {
        StatusTransition {
            error: Some(Some(message.into())),
            completed_at: Some(now),
            clear_processing_lock: true,
            clear_worker_claim: true,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Verifies the backend is reachable; called once at worker startup
    /// (spec §6 — a fatal startup error maps to a non-zero exit code).
    async fn ping(&self) -> Result<(), StoreError>;

    async fn create_task(&self, new: NewTask) -> Result<Task, StoreError>;
    async fn get_task(&self, task_id: &str) -> Result<Task, StoreError>;
    async fn list_tasks(&self, filter: TaskListFilter) -> Result<(Vec<Task>, u64), StoreError>;

    /// Only succeeds if the task is currently `running`; returns the number
    /// of articles actually inserted so the caller can verify it matches
    /// the request (spec's "article-save verification").
    async fn attach_articles(
        &self,
        task_id: &str,
        articles: Vec<ArticleInput>,
    ) -> Result<u64, StoreError>;

    async fn list_articles(&self, task_id: &str) -> Result<Vec<Article>, StoreError>;
    async fn count_results(&self, task_id: &str) -> Result<u64, StoreError>;

    /// Ids of articles that already have a `ScreeningResult` — used by the
    /// Task Processor to compute the resume-friendly `remaining` set.
    async fn processed_article_ids(
        &self,
        task_id: &str,
    ) -> Result<std::collections::HashSet<String>, StoreError>;
    async fn get_results(
        &self,
        task_id: &str,
        filter: ResultListFilter,
    ) -> Result<(Vec<ScreeningResult>, u64), StoreError>;

    /// Upsert keyed on `(task_id, article_id)` — naturally idempotent.
    async fn upsert_result(&self, result: ScreeningResult) -> Result<(), StoreError>;

    /// Atomically claims one task with `status ∈ {running, full_screening}`
    /// whose `worker_claim` is absent or older than `stale_ttl`, excluding
    /// ids the caller is already processing. FIFO by `started_at`.
    async fn claim_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_ttl: Duration,
        exclude: &[String],
    ) -> Result<Option<Task>, StoreError>;

    /// Clears `worker_claim` only if currently owned by `worker_id`.
    async fn release_claim(&self, task_id: &str, worker_id: &str) -> Result<(), StoreError>;

    /// Acquires `processing_lock` only if the task is `running` or
    /// `full_screening` and currently unlocked.
    async fn acquire_lock(&self, task_id: &str, lock_id: &str) -> Result<bool, StoreError>;

    /// Clears `processing_lock` only if currently held by `lock_id`.
    async fn release_lock(&self, task_id: &str, lock_id: &str) -> Result<(), StoreError>;

    /// Clears a stale `error` field but preserves `progress.current`
    /// (resume-friendly — spec §4.5 step 3). No-op if `error` is already unset.
    async fn clear_stale_error(&self, task_id: &str) -> Result<(), StoreError>;

    /// Re-reads the task, bumping `last_activity_at`, only if it still
    /// holds `lock_id` and is in a processable status. `None` means the
    /// caller has lost the lock or the task moved to a non-processable
    /// state — the processing loop must abort.
    async fn touch_and_check(
        &self,
        task_id: &str,
        lock_id: &str,
    ) -> Result<Option<Task>, StoreError>;

    /// Conditionally bumps `progress.current`, only if the task still holds
    /// `lock_id`. Returns whether the update applied.
    async fn bump_progress(
        &self,
        task_id: &str,
        lock_id: &str,
        current: u64,
    ) -> Result<bool, StoreError>;

    async fn set_progress_total(&self, task_id: &str, total: u64) -> Result<(), StoreError>;

    /// Conditional status transition: applies only if `task.status` is one
    /// of `from` (and, when `lock_id` is given, the task still holds that
    /// lock). Returns whether it applied.
    async fn cas_status(
        &self,
        task_id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        lock_id: Option<&str>,
        extra: StatusTransition,
    ) -> Result<bool, StoreError>;

    /// `paused -> full_screening`, preserving progress, setting
    /// `remaining_articles`. Returns whether it applied.
    async fn request_full_screening(
        &self,
        task_id: &str,
        remaining: Vec<String>,
    ) -> Result<bool, StoreError>;

    /// Any non-terminal status -> `error`. Returns whether it applied
    /// (`false` means the task was already terminal — a 409 conflict).
    async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<bool, StoreError>;
}
