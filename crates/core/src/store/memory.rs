//! In-memory `Store` used by `#[cfg(test)]` code (S1–S6, the Jepsen-style
//! mutual-exclusion test, and anything else that needs deterministic,
//! Mongo-free storage) — same conditional semantics as `MongoStore`,
//! enforced with a single `std::sync::Mutex` instead of database atomics.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::StoreError;
use crate::model::{Article, ArticleInput, Progress, ScreeningResult, Task, TaskStatus, WorkerClaim};

use super::{NewTask, ResultListFilter, StatusTransition, Store, TaskListFilter};

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    articles: HashMap<String, Vec<Article>>,
    results: HashMap<(String, String), ScreeningResult>,
    next_id: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_task(&self, new: NewTask) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let task_id = format!("task-{}", inner.next_id);
        let task = Task {
            task_id: task_id.clone(),
            user_id: new.user_id,
            search_query: new.search_query,
            criteria: new.criteria,
            model: new.model,
            status: TaskStatus::Running,
            progress: Progress {
                total: new.declared_total,
                current: 0,
            },
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            remaining_articles: Vec::new(),
            processing_lock: None,
            worker_claim: None,
            name: new.name,
            last_activity_at: Utc::now(),
        };
        inner.tasks.insert(task_id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let actual = inner
            .results
            .keys()
            .filter(|(t, _)| t == task_id)
            .count() as u64;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        if task.progress.current != actual {
            task.progress.current = actual;
        }
        Ok(task.clone())
    }

    async fn list_tasks(&self, filter: TaskListFilter) -> Result<(Vec<Task>, u64), StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut matched: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        matched.sort_by_key(|t| t.started_at);
        let total = matched.len() as u64;
        let skip = (filter.page.saturating_sub(1) * filter.limit) as usize;
        let page = matched
            .into_iter()
            .skip(skip)
            .take(filter.limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn attach_articles(
        &self,
        task_id: &str,
        articles: Vec<ArticleInput>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let status = inner
            .tasks
            .get(task_id)
            .map(|t| t.status)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        if status != TaskStatus::Running {
            return Err(StoreError::Conflict(format!("task {task_id} not running")));
        }
        let now = Utc::now();
        let count = articles.len() as u64;
        let entry = inner.articles.entry(task_id.to_string()).or_default();
        for a in articles {
            entry.push(Article {
                task_id: task_id.to_string(),
                article_id: a.article_id,
                title: a.title,
                abstract_text: a.abstract_text,
                created_at: now,
            });
        }
        Ok(count)
    }

    async fn list_articles(&self, task_id: &str) -> Result<Vec<Article>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .articles
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn count_results(&self, task_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .results
            .keys()
            .filter(|(t, _)| t == task_id)
            .count() as u64)
    }

    async fn processed_article_ids(
        &self,
        task_id: &str,
    ) -> Result<std::collections::HashSet<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .results
            .keys()
            .filter(|(t, _)| t == task_id)
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn get_results(
        &self,
        task_id: &str,
        filter: ResultListFilter,
    ) -> Result<(Vec<ScreeningResult>, u64), StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut matched: Vec<ScreeningResult> = inner
            .results
            .values()
            .filter(|r| r.task_id == task_id)
            .filter(|r| filter.included.is_none_or(|i| r.included == i))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        let total = matched.len() as u64;
        let skip = (filter.page.saturating_sub(1) * filter.limit) as usize;
        let page = matched
            .into_iter()
            .skip(skip)
            .take(filter.limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn upsert_result(&self, result: ScreeningResult) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .results
            .insert((result.task_id.clone(), result.article_id.clone()), result);
        Ok(())
    }

    async fn claim_task(
        &self,
        worker_id: &str,
        now: chrono::DateTime<Utc>,
        stale_ttl: Duration,
        exclude: &[String],
    ) -> Result<Option<Task>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stale_before = now - chrono::Duration::from_std(stale_ttl).unwrap();
        let mut candidates: Vec<String> = inner
            .tasks
            .values()
            .filter(|t| t.status.is_processable())
            .filter(|t| !exclude.contains(&t.task_id))
            .filter(|t| match &t.worker_claim {
                None => true,
                Some(c) => c.claimed_at < stale_before,
            })
            .map(|t| t.task_id.clone())
            .collect();
        candidates.sort_by_key(|id| inner.tasks[id].started_at);
        let Some(task_id) = candidates.into_iter().next() else {
            return Ok(None);
        };
        let task = inner.tasks.get_mut(&task_id).unwrap();
        task.worker_claim = Some(WorkerClaim {
            worker_id: worker_id.to_string(),
            claimed_at: now,
        });
        Ok(Some(task.clone()))
    }

    async fn release_claim(&self, task_id: &str, worker_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.tasks.get_mut(task_id) {
            if task.worker_claim.as_ref().map(|c| c.worker_id.as_str()) == Some(worker_id) {
                task.worker_claim = None;
            }
        }
        Ok(())
    }

    async fn acquire_lock(&self, task_id: &str, lock_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(task_id) {
            Some(task) if task.status.is_processable() && task.processing_lock.is_none() => {
                task.processing_lock = Some(lock_id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, task_id: &str, lock_id: &str) -> Result<(), StoreError> {
        if let Some(task) = self.inner.lock().unwrap().tasks.get_mut(task_id) {
            if task.processing_lock.as_deref() == Some(lock_id) {
                task.processing_lock = None;
            }
        }
        Ok(())
    }

    async fn clear_stale_error(&self, task_id: &str) -> Result<(), StoreError> {
        if let Some(task) = self.inner.lock().unwrap().tasks.get_mut(task_id) {
            task.error = None;
        }
        Ok(())
    }

    async fn touch_and_check(
        &self,
        task_id: &str,
        lock_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(task_id) {
            Some(task)
                if task.processing_lock.as_deref() == Some(lock_id)
                    && task.status.is_processable() =>
            {
                task.last_activity_at = Utc::now();
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn bump_progress(
        &self,
        task_id: &str,
        lock_id: &str,
        current: u64,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(task_id) {
            Some(task) if task.processing_lock.as_deref() == Some(lock_id) => {
                task.progress.current = current;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_progress_total(&self, task_id: &str, total: u64) -> Result<(), StoreError> {
        if let Some(task) = self.inner.lock().unwrap().tasks.get_mut(task_id) {
            task.progress.total = total;
        }
        Ok(())
    }

    async fn cas_status(
        &self,
        task_id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        lock_id: Option<&str>,
        extra: StatusTransition,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(task) = inner.tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if !from.contains(&task.status) {
            return Ok(false);
        }
        if let Some(lock_id) = lock_id {
            if task.processing_lock.as_deref() != Some(lock_id) {
                return Ok(false);
            }
        }
        task.status = to;
        match extra.error {
            Some(Some(msg)) => task.error = Some(msg),
            Some(None) => task.error = None,
            None => {}
        }
        if let Some(completed_at) = extra.completed_at {
            task.completed_at = Some(completed_at);
        }
        if let Some(total) = extra.progress_total {
            task.progress.total = total;
        }
        if let Some(current) = extra.progress_current {
            task.progress.current = current;
        }
        if let Some(remaining) = extra.remaining_articles {
            task.remaining_articles = remaining;
        }
        if extra.clear_processing_lock {
            task.processing_lock = None;
        }
        if extra.clear_worker_claim {
            task.worker_claim = None;
        }
        Ok(true)
    }

    async fn request_full_screening(
        &self,
        task_id: &str,
        remaining: Vec<String>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(task_id) {
            Some(task) if task.status == TaskStatus::Paused => {
                task.status = TaskStatus::FullScreening;
                task.remaining_articles = remaining;
                task.error = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get_mut(task_id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = TaskStatus::Error;
                task.error = Some(reason.to_string());
                task.completed_at = Some(Utc::now());
                task.processing_lock = None;
                task.worker_claim = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task_req() -> NewTask {
        NewTask {
            user_id: "u1".into(),
            search_query: "q".into(),
            criteria: "c".into(),
            model: "m".into(),
            name: "n".into(),
            declared_total: 5,
        }
    }

    #[tokio::test]
    async fn claim_task_is_exclusive_across_concurrent_callers() {
        let store = MemoryStore::new();
        let task = store.create_task(new_task_req()).await.unwrap();

        let a = store
            .claim_task("worker-a", Utc::now(), Duration::from_secs(300), &[])
            .await
            .unwrap();
        let b = store
            .claim_task("worker-b", Utc::now(), Duration::from_secs(300), &[])
            .await
            .unwrap();

        assert_eq!(a.unwrap().task_id, task.task_id);
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn acquire_lock_rejects_second_caller() {
        let store = MemoryStore::new();
        let task = store.create_task(new_task_req()).await.unwrap();

        assert!(store.acquire_lock(&task.task_id, "lock-1").await.unwrap());
        assert!(!store.acquire_lock(&task.task_id, "lock-2").await.unwrap());
    }

    #[tokio::test]
    async fn bump_progress_fails_once_lock_is_lost() {
        let store = MemoryStore::new();
        let task = store.create_task(new_task_req()).await.unwrap();
        store.acquire_lock(&task.task_id, "lock-1").await.unwrap();
        store.release_lock(&task.task_id, "lock-1").await.unwrap();

        let applied = store
            .bump_progress(&task.task_id, "lock-1", 3)
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn cancel_task_is_idempotent_and_reports_conflict_when_terminal() {
        let store = MemoryStore::new();
        let task = store.create_task(new_task_req()).await.unwrap();

        assert!(store.cancel_task(&task.task_id, "by user").await.unwrap());
        assert!(!store.cancel_task(&task.task_id, "again").await.unwrap());
    }
}
