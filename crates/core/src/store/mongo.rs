//! MongoDB-backed `Store`. Every write goes through `find_one_and_update`
//! (or `update_one` with a predicate that makes it conditional) — never a
//! bare replace — per the mutual-exclusion requirements in spec §4.1.

use async_trait::async_trait;
use bson::{doc, Document};
use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument};
use mongodb::{Client, Collection, Database};
use std::time::Duration;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Article, ArticleInput, ScreeningResult, Task, TaskStatus};

use super::{NewTask, ResultListFilter, StatusTransition, Store, TaskListFilter};

#[derive(Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await?;
        Ok(MongoStore {
            db: client.database(db_name),
        })
    }

    fn tasks(&self) -> Collection<Task> {
        self.db.collection("tasks")
    }

    fn articles(&self) -> Collection<Article> {
        self.db.collection("articles")
    }

    fn results(&self) -> Collection<ScreeningResult> {
        self.db.collection("screening_results")
    }
}

fn status_str(s: TaskStatus) -> String {
    s.to_string()
}

fn transition_to_update(to: TaskStatus, extra: StatusTransition) -> Document {
    let mut set = doc! { "status": status_str(to) };
    let mut unset = Document::new();

    match extra.error {
        Some(Some(msg)) => {
            set.insert("error", msg);
        }
        Some(None) => {
            unset.insert("error", "");
        }
        None => {}
    }
    if let Some(completed_at) = extra.completed_at {
        set.insert("completed_at", bson::to_bson(&completed_at).unwrap());
    }
    if let Some(total) = extra.progress_total {
        set.insert("progress.total", total as i64);
    }
    if let Some(current) = extra.progress_current {
        set.insert("progress.current", current as i64);
    }
    if let Some(remaining) = extra.remaining_articles {
        set.insert("remaining_articles", remaining);
    }
    if extra.clear_processing_lock {
        unset.insert("processing_lock", "");
    }
    if extra.clear_worker_claim {
        unset.insert("worker_claim", "");
    }

    let mut update = doc! { "$set": set };
    if !unset.is_empty() {
        update.insert("$unset", unset);
    }
    update
}

#[async_trait]
impl Store for MongoStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn create_task(&self, new: NewTask) -> Result<Task, StoreError> {
        let task = Task {
            task_id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            search_query: new.search_query,
            criteria: new.criteria,
            model: new.model,
            status: TaskStatus::Running,
            progress: crate::model::Progress {
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
        self.tasks().insert_one(&task).await?;
        Ok(task)
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, StoreError> {
        let mut task = self
            .tasks()
            .find_one(doc! { "task_id": task_id })
            .await?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        let actual = self
            .results()
            .count_documents(doc! { "task_id": task_id })
            .await?;
        if task.progress.current != actual {
            self.tasks()
                .update_one(
                    doc! { "task_id": task_id },
                    doc! { "$set": { "progress.current": actual as i64 } },
                )
                .await?;
            task.progress.current = actual;
        }
        Ok(task)
    }

    async fn list_tasks(&self, filter: TaskListFilter) -> Result<(Vec<Task>, u64), StoreError> {
        let mut query = Document::new();
        if let Some(status) = filter.status {
            query.insert("status", status_str(status));
        }
        let total = self.tasks().count_documents(query.clone()).await?;
        let skip = (filter.page.saturating_sub(1)) * filter.limit;
        let opts = FindOptions::builder()
            .sort(doc! { "started_at": 1 })
            .skip(skip)
            .limit(filter.limit as i64)
            .build();
        let tasks: Vec<Task> = self
            .tasks()
            .find(query)
            .with_options(opts)
            .await?
            .try_collect()
            .await?;
        Ok((tasks, total))
    }

    async fn attach_articles(
        &self,
        task_id: &str,
        articles: Vec<ArticleInput>,
    ) -> Result<u64, StoreError> {
        let task = self
            .tasks()
            .find_one(doc! { "task_id": task_id, "status": status_str(TaskStatus::Running) })
            .await?
            .ok_or_else(|| StoreError::Conflict(format!("task {task_id} not running")))?;
        drop(task);

        let now = Utc::now();
        let docs: Vec<Article> = articles
            .into_iter()
            .map(|a| Article {
                task_id: task_id.to_string(),
                article_id: a.article_id,
                title: a.title,
                abstract_text: a.abstract_text,
                created_at: now,
            })
            .collect();
        let requested = docs.len() as u64;
        if docs.is_empty() {
            return Ok(0);
        }
        let result = self.articles().insert_many(&docs).await?;
        let saved = result.inserted_ids.len() as u64;
        if saved != requested {
            return Err(StoreError::Backend(format!(
                "article save mismatch: expected {requested}, got {saved}"
            )));
        }
        Ok(saved)
    }

    async fn list_articles(&self, task_id: &str) -> Result<Vec<Article>, StoreError> {
        let opts = FindOptions::builder().sort(doc! { "created_at": 1 }).build();
        let articles: Vec<Article> = self
            .articles()
            .find(doc! { "task_id": task_id })
            .with_options(opts)
            .await?
            .try_collect()
            .await?;
        Ok(articles)
    }

    async fn count_results(&self, task_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .results()
            .count_documents(doc! { "task_id": task_id })
            .await?)
    }

    async fn processed_article_ids(
        &self,
        task_id: &str,
    ) -> Result<std::collections::HashSet<String>, StoreError> {
        let results: Vec<ScreeningResult> = self
            .results()
            .find(doc! { "task_id": task_id })
            .await?
            .try_collect()
            .await?;
        Ok(results.into_iter().map(|r| r.article_id).collect())
    }

    async fn get_results(
        &self,
        task_id: &str,
        filter: ResultListFilter,
    ) -> Result<(Vec<ScreeningResult>, u64), StoreError> {
        let mut query = doc! { "task_id": task_id };
        if let Some(included) = filter.included {
            query.insert("included", included);
        }
        let total = self.results().count_documents(query.clone()).await?;
        let skip = (filter.page.saturating_sub(1)) * filter.limit;
        let opts = FindOptions::builder()
            .sort(doc! { "relevance_score": -1 })
            .skip(skip)
            .limit(filter.limit as i64)
            .build();
        let results: Vec<ScreeningResult> = self
            .results()
            .find(query)
            .with_options(opts)
            .await?
            .try_collect()
            .await?;
        Ok((results, total))
    }

    async fn upsert_result(&self, result: ScreeningResult) -> Result<(), StoreError> {
        let filter = doc! { "task_id": &result.task_id, "article_id": &result.article_id };
        let doc = bson::to_document(&result).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.results()
            .update_one(filter, doc! { "$set": doc })
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn claim_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_ttl: Duration,
        exclude: &[String],
    ) -> Result<Option<Task>, StoreError> {
        let stale_before = now - chrono::Duration::from_std(stale_ttl).unwrap();
        let filter = doc! {
            "status": { "$in": [status_str(TaskStatus::Running), status_str(TaskStatus::FullScreening)] },
            "task_id": { "$nin": exclude },
            "$or": [
                { "worker_claim": null },
                { "worker_claim.claimed_at": { "$lt": bson::to_bson(&stale_before).unwrap() } },
            ],
        };
        let update = doc! {
            "$set": {
                "worker_claim": { "worker_id": worker_id, "claimed_at": bson::to_bson(&now).unwrap() }
            }
        };
        let opts = FindOneAndUpdateOptions::builder()
            .sort(doc! { "started_at": 1 })
            .return_document(ReturnDocument::After)
            .build();
        let task = self
            .tasks()
            .find_one_and_update(filter, update)
            .with_options(opts)
            .await?;
        Ok(task)
    }

    async fn release_claim(&self, task_id: &str, worker_id: &str) -> Result<(), StoreError> {
        self.tasks()
            .update_one(
                doc! { "task_id": task_id, "worker_claim.worker_id": worker_id },
                doc! { "$unset": { "worker_claim": "" } },
            )
            .await?;
        Ok(())
    }

    async fn acquire_lock(&self, task_id: &str, lock_id: &str) -> Result<bool, StoreError> {
        let filter = doc! {
            "task_id": task_id,
            "status": { "$in": [status_str(TaskStatus::Running), status_str(TaskStatus::FullScreening)] },
            "processing_lock": null,
        };
        let update = doc! { "$set": { "processing_lock": lock_id } };
        let result = self.tasks().find_one_and_update(filter, update).await?;
        Ok(result.is_some())
    }

    async fn release_lock(&self, task_id: &str, lock_id: &str) -> Result<(), StoreError> {
        self.tasks()
            .update_one(
                doc! { "task_id": task_id, "processing_lock": lock_id },
                doc! { "$unset": { "processing_lock": "" } },
            )
            .await?;
        Ok(())
    }

    async fn clear_stale_error(&self, task_id: &str) -> Result<(), StoreError> {
        self.tasks()
            .update_one(
                doc! { "task_id": task_id },
                doc! { "$unset": { "error": "" } },
            )
            .await?;
        Ok(())
    }

    async fn touch_and_check(
        &self,
        task_id: &str,
        lock_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        let filter = doc! {
            "task_id": task_id,
            "processing_lock": lock_id,
            "status": { "$in": [status_str(TaskStatus::Running), status_str(TaskStatus::FullScreening)] },
        };
        let update = doc! { "$set": { "last_activity_at": bson::to_bson(&Utc::now()).unwrap() } };
        let opts = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let task = self
            .tasks()
            .find_one_and_update(filter, update)
            .with_options(opts)
            .await?;
        Ok(task)
    }

    async fn bump_progress(
        &self,
        task_id: &str,
        lock_id: &str,
        current: u64,
    ) -> Result<bool, StoreError> {
        let result = self
            .tasks()
            .update_one(
                doc! { "task_id": task_id, "processing_lock": lock_id },
                doc! { "$set": { "progress.current": current as i64 } },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn set_progress_total(&self, task_id: &str, total: u64) -> Result<(), StoreError> {
        self.tasks()
            .update_one(
                doc! { "task_id": task_id },
                doc! { "$set": { "progress.total": total as i64 } },
            )
            .await?;
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
        let mut filter = doc! {
            "task_id": task_id,
            "status": { "$in": from.iter().map(|s| status_str(*s)).collect::<Vec<_>>() },
        };
        if let Some(lock_id) = lock_id {
            filter.insert("processing_lock", lock_id);
        }
        let update = transition_to_update(to, extra);
        let result = self.tasks().update_one(filter, update).await?;
        Ok(result.modified_count > 0)
    }

    async fn request_full_screening(
        &self,
        task_id: &str,
        remaining: Vec<String>,
    ) -> Result<bool, StoreError> {
        let filter = doc! { "task_id": task_id, "status": status_str(TaskStatus::Paused) };
        let update = doc! {
            "$set": {
                "status": status_str(TaskStatus::FullScreening),
                "remaining_articles": remaining,
            },
            "$unset": { "error": "" },
        };
        let result = self.tasks().update_one(filter, update).await?;
        Ok(result.modified_count > 0)
    }

    async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<bool, StoreError> {
        let filter = doc! {
            "task_id": task_id,
            "status": { "$nin": [status_str(TaskStatus::Done), status_str(TaskStatus::Error)] },
        };
        let update = doc! {
            "$set": {
                "status": status_str(TaskStatus::Error),
                "error": reason,
                "completed_at": bson::to_bson(&Utc::now()).unwrap(),
            },
            "$unset": { "processing_lock": "", "worker_claim": "" },
        };
        let result = self.tasks().update_one(filter, update).await?;
        Ok(result.modified_count > 0)
    }
}
