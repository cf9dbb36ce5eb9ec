//! Long-running worker process that claims and drives screening tasks.
//!
//! Each iteration: reload config if due, claim one task with a stale
//! worker-claim TTL, and hand it to the Task Processor. A per-task error
//! counter caps retries before a task is marked permanently failed so one
//! bad task can't spin a worker forever. Shutdown is cooperative: ctrl-c or
//! SIGTERM cancels a root `CancellationToken`; every task's token is a child
//! of it, so the in-flight task's token is cancelled immediately, even
//! mid-call, and every claimed task is released before the process exits.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use screening_core::config::{ConfigHolder, MAX_TASK_ATTEMPTS, STALE_CLAIM_TTL};
use screening_core::store::mongo::MongoStore;
use screening_core::store::{Store, StatusTransition};
use screening_core::{LlmClient, Settings, TaskStatus};

#[derive(Parser, Debug)]
#[command(name = "screening-worker", about = "Claims and screens tasks")]
struct Args {
    /// Number of worker loops to run concurrently in this process.
    #[arg(long, default_value = "1")]
    workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::load();

    info!(
        mongodb_db = %settings.mongodb_db,
        ollama_api_url = %settings.ollama_api_url,
        workers = args.workers,
        "starting screening worker"
    );

    let store: Arc<dyn Store> =
        Arc::new(MongoStore::connect(&settings.mongodb_uri, &settings.mongodb_db).await?);
    store.ping().await?;
    info!("store reachable");

    let llm = Arc::new(LlmClient::new(
        settings.ollama_api_url.clone(),
        settings.max_retries,
    ));
    llm.connect().await;

    let config = Arc::new(ConfigHolder::new(settings));
    let shutdown = CancellationToken::new();

    let mut handles = Vec::with_capacity(args.workers);
    for n in 0..args.workers {
        let worker_id = format!("worker-{}-{}", std::process::id(), n);
        let store = store.clone();
        let llm = llm.clone();
        let config = config.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            run_worker_loop(worker_id, store, llm, config, shutdown).await
        }));
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining workers");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "worker loop panicked");
        }
    }

    info!("all workers drained, exiting");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler, relying on ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// One worker's claim/process/release loop, running until `shutdown` is cancelled.
async fn run_worker_loop(
    worker_id: String,
    store: Arc<dyn Store>,
    llm: Arc<LlmClient>,
    config: Arc<ConfigHolder>,
    shutdown: CancellationToken,
) {
    let mut attempts: HashMap<String, u32> = HashMap::new();

    while !shutdown.is_cancelled() {
        config.reload_if_changed();
        let settings = config.current();

        let claimed = match store
            .claim_task(&worker_id, chrono::Utc::now(), STALE_CLAIM_TTL, &[])
            .await
        {
            Ok(task) => task,
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "claim failed");
                sleep_idle(&shutdown).await;
                continue;
            }
        };

        let Some(task) = claimed else {
            sleep_idle(&shutdown).await;
            continue;
        };

        let attempt_count = attempts.get(&task.task_id).copied().unwrap_or(0);
        if attempt_count >= MAX_TASK_ATTEMPTS {
            warn!(
                task_id = %task.task_id,
                attempts = attempt_count,
                "task exceeded max attempts, marking permanently failed"
            );
            let _ = store
                .cas_status(
                    &task.task_id,
                    &[TaskStatus::Running, TaskStatus::FullScreening],
                    TaskStatus::Error,
                    None,
                    StatusTransition::to_error(
                        format!("exceeded {MAX_TASK_ATTEMPTS} processing attempts"),
                        chrono::Utc::now(),
                    ),
                )
                .await;
            let _ = store.release_claim(&task.task_id, &worker_id).await;
            attempts.remove(&task.task_id);
            continue;
        }

        info!(task_id = %task.task_id, worker_id = %worker_id, attempt = attempt_count + 1, "processing task");

        // A child of `shutdown`: already cancelled if shutdown fired before
        // this task was claimed, and cancelled live if it fires mid-`process`.
        let cancel = shutdown.child_token();
        let task_id = task.task_id.clone();

        screening_core::processor::process(
            store.as_ref(),
            &llm,
            &settings,
            &task_id,
            attempt_count + 1,
            &cancel,
        )
        .await;

        let reloaded = store.get_task(&task_id).await.ok();
        let failed = reloaded
            .as_ref()
            .map(|t| t.status == TaskStatus::Error)
            .unwrap_or(false);

        if failed {
            attempts.insert(task_id.clone(), attempt_count + 1);
        } else {
            attempts.remove(&task_id);
        }

        if let Err(e) = store.release_claim(&task_id, &worker_id).await {
            warn!(task_id = %task_id, error = %e, "error releasing claim");
        }

        if shutdown.is_cancelled() {
            mark_interrupted(store.as_ref(), &task_id).await;
        }
    }
}

/// Sleeps a jittered 2-5s idle interval, waking early if shutdown is signalled.
async fn sleep_idle(shutdown: &CancellationToken) {
    let secs: f64 = {
        let mut rng = rand::thread_rng();
        rng.gen_range(2.0..=5.0)
    };
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(tokio::time::Duration::from_secs_f64(secs)) => {}
    }
}

/// Best-effort: on shutdown mid-processing, leave the task in a state a
/// future worker can resume rather than stuck `running` with a dead claim.
async fn mark_interrupted(store: &dyn Store, task_id: &str) {
    let Ok(task) = store.get_task(task_id).await else {
        return;
    };
    if task.status.is_terminal() {
        return;
    }
    let _ = store
        .cas_status(
            task_id,
            &[TaskStatus::Running, TaskStatus::FullScreening],
            TaskStatus::Error,
            None,
            StatusTransition::to_error("Worker stopped".to_string(), chrono::Utc::now()),
        )
        .await;
}
