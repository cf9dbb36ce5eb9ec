//! End-to-end scenarios from spec §8: the task processor driven against a
//! `MemoryStore` and a wiremock-backed fake Ollama endpoint, covering the
//! illustrative S1-S6 walkthroughs and the mutual-exclusion property.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use screening_core::store::NewTask;
use screening_core::store::memory::MemoryStore;
use screening_core::{ArticleInput, LlmClient, Settings, Store, TaskStatus};

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn settings_for(base_url: String, article_limit: u64, batch_size: u64) -> Settings {
    Settings {
        mongodb_uri: String::new(),
        mongodb_db: String::new(),
        ollama_api_url: base_url,
        ollama_model: "test-model".into(),
        article_limit,
        batch_size,
        max_retries: 2,
        retry_delay: Duration::from_millis(1),
        request_timeout: Duration::from_secs(5),
    }
}

async fn seed_task(store: &MemoryStore, n: usize) -> String {
    let task = store
        .create_task(NewTask {
            user_id: "u1".into(),
            search_query: "cats in shelters".into(),
            criteria: "must be about domestic cats".into(),
            model: "test-model".into(),
            name: "cats review".into(),
            declared_total: n as u64,
        })
        .await
        .unwrap();
    let articles = (0..n)
        .map(|i| ArticleInput {
            article_id: format!("a{i}"),
            title: format!("Title {i}"),
            abstract_text: "An abstract about cats.".into(),
        })
        .collect();
    store.attach_articles(&task.task_id, articles).await.unwrap();
    task.task_id
}

/// One canned `included` decision per id, all well above `SCORE_THRESHOLD`.
fn included_body(ids: impl Iterator<Item = String>) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for id in ids {
        obj.insert(
            id,
            serde_json::json!({"included": true, "reason": "Included: strong match", "relevance_score": 95}),
        );
    }
    serde_json::json!({"message": {"content": serde_json::Value::Object(obj).to_string()}})
}

async fn mount_all_included(server: &MockServer, ids: Vec<String>, delay: Option<Duration>) {
    let mut template = ResponseTemplate::new(200).set_body_json(included_body(ids.into_iter()));
    if let Some(d) = delay {
        template = template.set_delay(d);
    }
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(template)
        .mount(server)
        .await;
}

#[tokio::test]
async fn s1_happy_path_initial_cap() {
    let server = MockServer::start().await;
    let ids: Vec<String> = (0..25).map(|i| format!("a{i}")).collect();
    mount_all_included(&server, ids, None).await;

    let store = MemoryStore::new();
    let task_id = seed_task(&store, 25).await;
    let llm = LlmClient::new(server.uri(), 2);
    let settings = settings_for(server.uri(), 10, 2);
    let cancel = CancellationToken::new();

    screening_core::processor::process(&store, &llm, &settings, &task_id, 1, &cancel).await;

    let task = store.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.progress.current, 10);
    assert_eq!(task.progress.total, 10);
    assert_eq!(task.remaining_articles.len(), 15);
    assert_eq!(store.count_results(&task_id).await.unwrap(), 10);
}

#[tokio::test]
async fn s2_full_screening_after_initial_cap() {
    let server = MockServer::start().await;
    let ids: Vec<String> = (0..25).map(|i| format!("a{i}")).collect();
    mount_all_included(&server, ids, None).await;

    let store = MemoryStore::new();
    let task_id = seed_task(&store, 25).await;
    let llm = LlmClient::new(server.uri(), 2);
    let settings = settings_for(server.uri(), 10, 2);
    let cancel = CancellationToken::new();

    screening_core::processor::process(&store, &llm, &settings, &task_id, 1, &cancel).await;
    let paused = store.get_task(&task_id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert_eq!(paused.remaining_articles.len(), 15);

    let applied = store
        .request_full_screening(&task_id, paused.remaining_articles.clone())
        .await
        .unwrap();
    assert!(applied);
    assert_eq!(
        store.get_task(&task_id).await.unwrap().status,
        TaskStatus::FullScreening
    );

    screening_core::processor::process(&store, &llm, &settings, &task_id, 1, &cancel).await;

    let done = store.get_task(&task_id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Done);
    assert_eq!(done.progress.current, 25);
    assert!(done.completed_at.is_some());
    assert_eq!(store.count_results(&task_id).await.unwrap(), 25);
}

#[tokio::test]
async fn s3_reconciliation_flip_on_contradictory_score() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": {
                "content": r#"{"id7":{"included":true,"reason":"Included: borderline","relevanceScore":"40%"}}"#
            }
        })))
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let task = store
        .create_task(NewTask {
            user_id: "u".into(),
            search_query: "q".into(),
            criteria: "c".into(),
            model: "m".into(),
            name: "n".into(),
            declared_total: 1,
        })
        .await
        .unwrap();
    store
        .attach_articles(
            &task.task_id,
            vec![ArticleInput {
                article_id: "id7".into(),
                title: "t".into(),
                abstract_text: "a".into(),
            }],
        )
        .await
        .unwrap();

    let llm = LlmClient::new(server.uri(), 2);
    let settings = settings_for(server.uri(), 10, 2);
    let cancel = CancellationToken::new();
    screening_core::processor::process(&store, &llm, &settings, &task.task_id, 1, &cancel).await;

    let (results, _) = store
        .get_results(&task.task_id, Default::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    let r = &results[0];
    assert!(!r.included);
    assert_eq!(r.relevance_score, 40.0);
    assert!(r.reason.starts_with("Excluded:"));
}

#[tokio::test]
async fn s4_cancellation_liveness() {
    let server = MockServer::start().await;
    let ids: Vec<String> = (0..10).map(|i| format!("a{i}")).collect();
    mount_all_included(&server, ids, Some(Duration::from_millis(40))).await;

    let store = Arc::new(MemoryStore::new());
    let task_id = seed_task(&store, 10).await;
    let llm = LlmClient::new(server.uri(), 2);
    let settings = settings_for(server.uri(), 10, 2);
    let cancel = CancellationToken::new();

    let worker_store = store.clone();
    let worker_task_id = task_id.clone();
    let handle = tokio::spawn(async move {
        screening_core::processor::process(
            worker_store.as_ref(),
            &llm,
            &settings,
            &worker_task_id,
            1,
            &cancel,
        )
        .await;
    });

    // Cancel as soon as the first batch has landed a result, mimicking a
    // user's `cancel_task` request racing the worker.
    loop {
        if store.count_results(&task_id).await.unwrap() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    store
        .cancel_task(&task_id, "Task cancelled by user")
        .await
        .unwrap();

    handle.await.unwrap();

    let task = store.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.error.as_deref(), Some("Task cancelled by user"));
    let final_count = store.count_results(&task_id).await.unwrap();
    assert!(final_count >= 1 && final_count < 10);

    // No further writes occur once the task is terminal.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.count_results(&task_id).await.unwrap(), final_count);
}

/// A `Respond` that fails with 404 on its first two calls, then succeeds —
/// the wire-level shape of S5 ("LLM transient failure").
struct FailTwiceThenSucceed {
    calls: AtomicUsize,
    success_body: serde_json::Value,
}

impl Respond for FailTwiceThenSucceed {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= 2 {
            ResponseTemplate::new(404)
        } else {
            ResponseTemplate::new(200).set_body_json(self.success_body.clone())
        }
    }
}

/// Exercises the hardcoded `attempt * 10s` linear backoff on retryable 404s
/// (spec §4.2), so it genuinely takes ~30s of wall time. Run explicitly with
/// `cargo test -- --ignored`.
#[ignore]
#[tokio::test]
async fn s5_llm_transient_failure_then_success() {
    let server = MockServer::start().await;
    let success_body = included_body(std::iter::once("a0".to_string()));
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(FailTwiceThenSucceed {
            calls: AtomicUsize::new(0),
            success_body,
        })
        .mount(&server)
        .await;

    let store = MemoryStore::new();
    let task_id = seed_task(&store, 1).await;
    let llm = LlmClient::new(server.uri(), 2);
    let settings = settings_for(server.uri(), 10, 2);
    let cancel = CancellationToken::new();

    screening_core::processor::process(&store, &llm, &settings, &task_id, 1, &cancel).await;

    let task = store.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task.error.is_none());
    assert_eq!(store.count_results(&task_id).await.unwrap(), 1);
}

#[tokio::test]
async fn s6_mutual_exclusion_under_concurrent_claims_and_locks() {
    let store = Arc::new(MemoryStore::new());
    let task_id = seed_task(&store, 3).await;

    let mut claim_handles = Vec::new();
    for i in 0..5 {
        let store = store.clone();
        claim_handles.push(tokio::spawn(async move {
            store
                .claim_task(
                    &format!("worker-{i}"),
                    chrono::Utc::now(),
                    Duration::from_secs(300),
                    &[],
                )
                .await
                .unwrap()
        }));
    }
    let mut claimed = 0;
    for handle in claim_handles {
        if handle.await.unwrap().is_some() {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1, "exactly one worker claims the sole eligible task");

    let mut lock_handles = Vec::new();
    for i in 0..5 {
        let store = store.clone();
        let task_id = task_id.clone();
        lock_handles.push(tokio::spawn(async move {
            store.acquire_lock(&task_id, &format!("lock-{i}")).await.unwrap()
        }));
    }
    let mut locked = 0;
    for handle in lock_handles {
        if handle.await.unwrap() {
            locked += 1;
        }
    }
    assert_eq!(locked, 1, "exactly one caller acquires the processing lock");
}
