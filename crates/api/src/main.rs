//! Control API (C7): the HTTP surface for creating and monitoring screening
//! tasks. All routes are thin — every mutation is delegated to a single
//! conditional `Store` method, so this binary owns no state-machine logic
//! of its own (spec §4.7).

use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use screening_core::model::ArticleInput;
use screening_core::store::{NewTask, ResultListFilter, TaskListFilter};
use screening_core::store::mongo::MongoStore;
use screening_core::{LlmClient, Settings, Store, TaskStatus};

#[derive(Parser, Debug)]
#[command(name = "screening-api", about = "Control API for article screening tasks")]
struct Args {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "0.0.0.0:8000", env = "BIND_ADDR")]
    bind: String,
}

#[derive(Clone)]
struct ServerState {
    store: Arc<dyn Store>,
    // Kept for symmetry with a future synchronous-screen endpoint; unused
    // by any route today.
    #[allow(dead_code)]
    llm: Arc<LlmClient>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn err(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "success": false, "detail": message.into() })))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("screening_api=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let settings = Settings::load();

    info!(bind = %args.bind, mongodb_db = %settings.mongodb_db, "starting control api");

    let store: Arc<dyn Store> =
        Arc::new(MongoStore::connect(&settings.mongodb_uri, &settings.mongodb_db).await?);
    store.ping().await?;

    let llm = Arc::new(LlmClient::new(
        settings.ollama_api_url.clone(),
        settings.max_retries,
    ));

    let state = ServerState { store, llm };

    let app = Router::new()
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/screen", post(start_screening))
        .route(
            "/api/tasks/:id/request-full-screening",
            post(request_full_screening),
        )
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route("/api/tasks/:id/results", get(get_results))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize, Default)]
struct Pagination {
    page: u64,
    limit: u64,
    total: u64,
    pages: u64,
}

impl Pagination {
    fn new(page: u64, limit: u64, total: u64) -> Self {
        let pages = if limit == 0 { 0 } else { total.div_ceil(limit) };
        Pagination { page, limit, total, pages }
    }
}

fn clamp_page(page: Option<u64>) -> u64 {
    page.unwrap_or(1).max(1)
}

fn clamp_limit(limit: Option<u64>, default: u64) -> u64 {
    limit.unwrap_or(default).clamp(1, 100)
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    user_id: String,
    search_query: String,
    criteria: String,
    model: String,
    total_articles: u64,
}

async fn create_task(
    State(state): State<ServerState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Response, ApiError> {
    if req.total_articles == 0 {
        return Err(err(StatusCode::BAD_REQUEST, "total_articles must be > 0"));
    }

    let name = format!(
        "Screening: {}",
        req.search_query.chars().take(50).collect::<String>()
    );

    let task = state
        .store
        .create_task(NewTask {
            user_id: req.user_id,
            search_query: req.search_query,
            criteria: req.criteria,
            model: req.model,
            name,
            declared_total: req.total_articles,
        })
        .await
        .map_err(|e| {
            error!(error = %e, "failed to create task");
            err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok((StatusCode::CREATED, Json(json!({ "success": true, "task": task }))).into_response())
}

#[derive(Deserialize)]
struct TaskListQuery {
    status: Option<String>,
    page: Option<u64>,
    limit: Option<u64>,
}

async fn list_tasks(
    State(state): State<ServerState>,
    Query(q): Query<TaskListQuery>,
) -> Result<Response, ApiError> {
    let status = match q.status.as_deref() {
        None | Some("all") | Some("") => None,
        Some(other) => Some(parse_status(other)?),
    };
    let page = clamp_page(q.page);
    let limit = clamp_limit(q.limit, 20);

    let (tasks, total) = state
        .store
        .list_tasks(TaskListFilter { status, page, limit })
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({
        "success": true,
        "tasks": tasks,
        "pagination": Pagination::new(page, limit, total),
    }))
    .into_response())
}

async fn get_task(
    State(state): State<ServerState>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let task = state.store.get_task(&task_id).await.map_err(task_err)?;

    // Unpaginated: every result is needed to compute the included/excluded split.
    let (results, _) = state
        .store
        .get_results(
            &task_id,
            ResultListFilter { included: None, page: 1, limit: i64::MAX as u64 },
        )
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let included = results.iter().filter(|r| r.included).count();
    let excluded = results.len() - included;

    let article_count = state
        .store
        .list_articles(&task_id)
        .await
        .map(|a| a.len())
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({
        "success": true,
        "task": task,
        "stats": { "included": included, "excluded": excluded },
        "article_count": article_count,
        "processed_count": results.len(),
    }))
    .into_response())
}

#[derive(Deserialize)]
struct ArticlePayload {
    id: String,
    title: String,
    #[serde(rename = "abstract")]
    abstract_text: String,
}

#[derive(Deserialize)]
struct ScreenRequest {
    articles: Vec<ArticlePayload>,
}

async fn start_screening(
    State(state): State<ServerState>,
    Path(task_id): Path<String>,
    Json(req): Json<ScreenRequest>,
) -> Result<Response, ApiError> {
    if req.articles.is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "no articles provided"));
    }

    let task = state.store.get_task(&task_id).await.map_err(task_err)?;
    if task.status != TaskStatus::Running {
        return Err(err(
            StatusCode::BAD_REQUEST,
            format!("task cannot be started in {} state", task.status),
        ));
    }

    let expected = req.articles.len() as u64;
    let inputs = req
        .articles
        .into_iter()
        .map(|a| ArticleInput {
            article_id: a.id,
            title: a.title,
            abstract_text: a.abstract_text,
        })
        .collect();

    match state.store.attach_articles(&task_id, inputs).await {
        Ok(saved) if saved == expected => Ok(Json(json!({ "success": true })).into_response()),
        Ok(saved) => {
            let message = format!("article save mismatch: expected {expected}, got {saved}");
            mark_error(&state, &task_id, &message).await;
            Err(err(StatusCode::INTERNAL_SERVER_ERROR, message))
        }
        Err(e) => {
            mark_error(&state, &task_id, &e.to_string()).await;
            Err(err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

async fn mark_error(state: &ServerState, task_id: &str, message: &str) {
    use screening_core::store::StatusTransition;
    let _ = state
        .store
        .cas_status(
            task_id,
            &[TaskStatus::Running],
            TaskStatus::Error,
            None,
            StatusTransition::to_error(message.to_string(), chrono::Utc::now()),
        )
        .await;
}

#[derive(Deserialize)]
struct FullScreeningRequest {
    remaining_articles: Vec<String>,
}

async fn request_full_screening(
    State(state): State<ServerState>,
    Path(task_id): Path<String>,
    Json(req): Json<FullScreeningRequest>,
) -> Result<Response, ApiError> {
    if req.remaining_articles.is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "no remaining articles provided"));
    }

    let applied = state
        .store
        .request_full_screening(&task_id, req.remaining_articles)
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if !applied {
        return Err(err(
            StatusCode::NOT_FOUND,
            "task not found or not in paused state",
        ));
    }

    Ok(Json(json!({ "success": true, "message": "full screening started successfully" })).into_response())
}

async fn cancel_task(
    State(state): State<ServerState>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let applied = state
        .store
        .cancel_task(&task_id, "Task cancelled by user")
        .await
        .map_err(task_err)?;

    if !applied {
        return Err(err(StatusCode::CONFLICT, "task cannot be cancelled in its current state"));
    }

    Ok(Json(json!({ "success": true, "message": "task cancelled successfully" })).into_response())
}

#[derive(Deserialize)]
struct ResultsQuery {
    included: Option<bool>,
    page: Option<u64>,
    limit: Option<u64>,
}

async fn get_results(
    State(state): State<ServerState>,
    Path(task_id): Path<String>,
    Query(q): Query<ResultsQuery>,
) -> Result<Response, ApiError> {
    state.store.get_task(&task_id).await.map_err(task_err)?;

    let page = clamp_page(q.page);
    let limit = clamp_limit(q.limit, 50);

    let (results, total) = state
        .store
        .get_results(
            &task_id,
            ResultListFilter { included: q.included, page, limit },
        )
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({
        "success": true,
        "results": results,
        "pagination": Pagination::new(page, limit, total),
    }))
    .into_response())
}

fn parse_status(raw: &str) -> Result<TaskStatus, ApiError> {
    match raw {
        "running" => Ok(TaskStatus::Running),
        "paused" => Ok(TaskStatus::Paused),
        "full_screening" => Ok(TaskStatus::FullScreening),
        "done" => Ok(TaskStatus::Done),
        "error" => Ok(TaskStatus::Error),
        other => Err(err(StatusCode::BAD_REQUEST, format!("unknown status: {other}"))),
    }
}

fn task_err(e: screening_core::StoreError) -> ApiError {
    match e {
        screening_core::StoreError::TaskNotFound(_) => err(StatusCode::NOT_FOUND, "task not found"),
        other => err(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}
