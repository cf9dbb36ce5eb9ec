//! Task Processor (C5): drives one task end-to-end (spec §4.5).

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{ProcessError, ScreenError};
use crate::llm::LlmClient;
use crate::model::{Task, TaskStatus};
use crate::screener::{self, BatchArticle};
use crate::store::{StatusTransition, Store};

/// Drives `task_id` through (at most) one processing pass: claiming the
/// lock, running batches to completion or cap, and finalising the task's
/// terminal (or paused) state. Never panics — every internal failure is
/// translated into the task's `error` field before returning.
///
/// `attempt` is the 1-based count of processing attempts the caller (the
/// Worker) has made for this task, folded into the `error` message on
/// failure so a task's history shows which attempt failed (spec §4.6).
pub async fn process(
    store: &dyn Store,
    llm: &LlmClient,
    settings: &Settings,
    task_id: &str,
    attempt: u32,
    cancel: &CancellationToken,
) {
    let lock_id = Uuid::new_v4().to_string();

    match store.acquire_lock(task_id, &lock_id).await {
        Ok(true) => {}
        Ok(false) => {
            info!(task_id, "could not acquire processing lock, skipping");
            return;
        }
        Err(e) => {
            error!(task_id, error = %e, "error acquiring lock");
            return;
        }
    }

    info!(task_id, lock_id, "acquired processing lock");

    if let Err(err) = run(store, llm, settings, task_id, &lock_id, cancel).await {
        handle_failure(store, task_id, attempt, &err).await;
    }

    if let Err(e) = store.release_lock(task_id, &lock_id).await {
        warn!(task_id, error = %e, "error releasing lock");
    }
}

async fn handle_failure(store: &dyn Store, task_id: &str, attempt: u32, err: &ProcessError) {
    match err {
        ProcessError::Cancelled | ProcessError::LockLost => {
            // No state mutation: the lock owner (or cancel) already decided
            // the task's fate; writing an error here would race it.
            info!(task_id, %err, "processing halted without a task-level error");
        }
        other => {
            error!(task_id, attempt, error = %other, "task failed, marking error");
            let now = chrono::Utc::now();
            let message = format!("attempt {attempt} failed: {other}");
            let _ = store
                .cas_status(
                    task_id,
                    &[TaskStatus::Running, TaskStatus::FullScreening],
                    TaskStatus::Error,
                    None,
                    StatusTransition::to_error(message, now),
                )
                .await;
        }
    }
}

async fn run(
    store: &dyn Store,
    llm: &LlmClient,
    settings: &Settings,
    task_id: &str,
    lock_id: &str,
    cancel: &CancellationToken,
) -> Result<(), ProcessError> {
    let task = store.get_task(task_id).await?;
    if !task.status.is_processable() {
        info!(task_id, status = %task.status, "task not in a processable state");
        return Ok(());
    }
    store.clear_stale_error(task_id).await?;

    let all_articles = store.list_articles(task_id).await?;
    if all_articles.is_empty() {
        return Err(ProcessError::NoArticles);
    }
    let processed_ids = store.processed_article_ids(task_id).await?;
    let remaining: Vec<_> = all_articles
        .iter()
        .filter(|a| !processed_ids.contains(&a.article_id))
        .collect();

    let starting_status = task.status;
    let (plan, total, overflow) = match starting_status {
        TaskStatus::Running => {
            let cap = (settings.article_limit as i64 - processed_ids.len() as i64).max(0) as usize;
            let plan: Vec<_> = remaining.iter().take(cap).cloned().collect();
            let overflow: Vec<String> = remaining
                .iter()
                .skip(cap)
                .map(|a| a.article_id.clone())
                .collect();
            (plan, settings.article_limit, overflow)
        }
        TaskStatus::FullScreening => {
            let plan: Vec<_> = remaining.iter().cloned().collect();
            (plan, all_articles.len() as u64, Vec::new())
        }
        _ => unreachable!("checked processable above"),
    };

    store.set_progress_total(task_id, total).await?;

    let mut processed_count = processed_ids.len() as u64;
    let mut paused_via_cap = false;

    for chunk in plan.chunks(settings.batch_size.max(1) as usize) {
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        let current = store
            .touch_and_check(task_id, lock_id)
            .await?
            .ok_or(ProcessError::LockLost)?;
        if current.status == TaskStatus::Error {
            return Err(ProcessError::LockLost);
        }

        let decisions = run_batch_with_retry(store, llm, settings, &task, chunk, task_id, lock_id, cancel)
            .await?;

        for article in chunk {
            if cancel.is_cancelled() {
                return Err(ProcessError::Cancelled);
            }
            let Some(decision) = decisions.get(&article.article_id) else {
                continue;
            };
            store
                .upsert_result(crate::model::ScreeningResult {
                    task_id: task_id.to_string(),
                    article_id: article.article_id.clone(),
                    included: decision.included,
                    reason: decision.reason.clone(),
                    relevance_score: decision.relevance_score,
                    metadata: crate::model::ResultMetadata {
                        title: article.title.clone(),
                        abstract_text: article.abstract_text.clone(),
                    },
                    updated_at: chrono::Utc::now(),
                })
                .await?;
            processed_count += 1;
            if !store.bump_progress(task_id, lock_id, processed_count).await? {
                return Err(ProcessError::LockLost);
            }
        }

        if starting_status == TaskStatus::Running && processed_count >= settings.article_limit {
            store
                .cas_status(
                    task_id,
                    &[TaskStatus::Running],
                    TaskStatus::Paused,
                    Some(lock_id),
                    StatusTransition {
                        progress_total: Some(settings.article_limit),
                        remaining_articles: Some(overflow.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            paused_via_cap = true;
            break;
        }
    }

    let at_cap = starting_status == TaskStatus::Running && processed_count >= settings.article_limit;
    if at_cap && !paused_via_cap {
        // Defensive: a resumed task can start already at (or past) the cap
        // without the loop running a single iteration.
        store
            .cas_status(
                task_id,
                &[TaskStatus::Running],
                TaskStatus::Paused,
                Some(lock_id),
                StatusTransition {
                    progress_total: Some(settings.article_limit),
                    remaining_articles: Some(overflow),
                    ..Default::default()
                },
            )
            .await?;
        paused_via_cap = true;
    }

    if paused_via_cap {
        info!(task_id, processed_count, "paused at article cap");
        return Ok(());
    }

    let now = chrono::Utc::now();
    match starting_status {
        TaskStatus::Running => {
            store
                .cas_status(
                    task_id,
                    &[TaskStatus::Running],
                    TaskStatus::Done,
                    Some(lock_id),
                    StatusTransition {
                        completed_at: Some(now),
                        progress_current: Some(processed_count),
                        ..Default::default()
                    },
                )
                .await?;
            info!(task_id, processed_count, "initial screening complete");
        }
        TaskStatus::FullScreening => {
            store
                .cas_status(
                    task_id,
                    &[TaskStatus::FullScreening],
                    TaskStatus::Done,
                    Some(lock_id),
                    StatusTransition {
                        completed_at: Some(now),
                        progress_current: Some(processed_count),
                        remaining_articles: Some(Vec::new()),
                        ..Default::default()
                    },
                )
                .await?;
            info!(task_id, processed_count, "full screening complete");
        }
        _ => unreachable!(),
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_batch_with_retry(
    store: &dyn Store,
    llm: &LlmClient,
    settings: &Settings,
    task: &Task,
    chunk: &[&crate::model::Article],
    task_id: &str,
    lock_id: &str,
    cancel: &CancellationToken,
) -> Result<std::collections::BTreeMap<String, crate::model::Decision>, ProcessError> {
    let batch: Vec<BatchArticle> = chunk
        .iter()
        .map(|a| BatchArticle {
            id: a.article_id.clone(),
            title: a.title.clone(),
            abstract_text: a.abstract_text.clone(),
        })
        .collect();

    let mut attempt = 0u32;
    loop {
        match screener::screen(llm, &batch, &task.criteria, &task.model, cancel).await {
            Ok(decisions) => return Ok(decisions),
            Err(ScreenError::Llm(crate::error::LlmError::Cancelled)) => {
                return Err(ProcessError::Cancelled)
            }
            Err(err) => {
                attempt += 1;
                if attempt > settings.max_retries {
                    return Err(ProcessError::BatchExhausted(err));
                }
                warn!(task_id, attempt, error = %err, "batch failed, retrying");
                let delay = settings.retry_delay * attempt;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ProcessError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                // re-read the lock before retrying so a lost lock is caught
                // promptly rather than after another full batch attempt.
                if store.touch_and_check(task_id, lock_id).await?.is_none() {
                    return Err(ProcessError::LockLost);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{memory::MemoryStore, NewTask};

    fn settings() -> Settings {
        Settings {
            mongodb_uri: String::new(),
            mongodb_db: String::new(),
            ollama_api_url: "http://localhost:0".into(),
            ollama_model: "test-model".into(),
            article_limit: 10,
            batch_size: 2,
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
            request_timeout: Duration::from_secs(1),
        }
    }

    async fn seed_task(store: &MemoryStore, n_articles: usize) -> String {
        let task = store
            .create_task(NewTask {
                user_id: "u".into(),
                search_query: "q".into(),
                criteria: "c".into(),
                model: "m".into(),
                name: "n".into(),
                declared_total: n_articles as u64,
            })
            .await
            .unwrap();
        let articles = (0..n_articles)
            .map(|i| crate::model::ArticleInput {
                article_id: format!("a{i}"),
                title: format!("title {i}"),
                abstract_text: "abstract".into(),
            })
            .collect();
        store.attach_articles(&task.task_id, articles).await.unwrap();
        task.task_id
    }

    #[tokio::test]
    async fn no_articles_marks_task_error() {
        let store = MemoryStore::new();
        let task = store
            .create_task(NewTask {
                user_id: "u".into(),
                search_query: "q".into(),
                criteria: "c".into(),
                model: "m".into(),
                name: "n".into(),
                declared_total: 5,
            })
            .await
            .unwrap();

        let llm = LlmClient::new("http://localhost:0", 0);
        let cancel = CancellationToken::new();
        process(&store, &llm, &settings(), &task.task_id, 1, &cancel).await;

        let reloaded = store.get_task(&task.task_id).await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Error);
        assert_eq!(reloaded.error.as_deref(), Some("no articles found for task"));
    }

    #[tokio::test]
    async fn acquire_lock_failure_leaves_task_untouched() {
        let store = MemoryStore::new();
        let task_id = seed_task(&store, 3).await;
        store.acquire_lock(&task_id, "someone-else").await.unwrap();

        let llm = LlmClient::new("http://localhost:0", 0);
        let cancel = CancellationToken::new();
        process(&store, &llm, &settings(), &task_id, 1, &cancel).await;

        let reloaded = store.get_task(&task_id).await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Running);
        assert_eq!(reloaded.processing_lock.as_deref(), Some("someone-else"));
    }

    #[tokio::test]
    async fn non_processable_status_is_a_silent_noop() {
        let store = MemoryStore::new();
        let task_id = seed_task(&store, 3).await;
        store.cancel_task(&task_id, "already done").await.unwrap();

        let llm = LlmClient::new("http://localhost:0", 0);
        let cancel = CancellationToken::new();
        process(&store, &llm, &settings(), &task_id, 1, &cancel).await;

        let reloaded = store.get_task(&task_id).await.unwrap();
        assert_eq!(reloaded.error.as_deref(), Some("already done"));
    }
}
