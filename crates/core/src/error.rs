use thiserror::Error;

/// Errors surfaced by the Store. Conflict is distinguished from a generic
/// backend error because callers (Control API, Task Processor) treat a lost
/// conditional update as "someone else changed it" rather than a fault.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error("conditional update rejected: {0}")]
    Conflict(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Errors surfaced by the LLM Client.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("response envelope missing message.content")]
    EmptyContent,
    #[error("operation cancelled")]
    Cancelled,
    #[error("exhausted {0} retries")]
    RetriesExhausted(usize),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

/// Errors surfaced by the Response Normaliser.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("could not locate a JSON object in the model's response")]
    NoJsonFound,
    #[error("root value is not a JSON object of per-article records")]
    InvalidStructure,
    #[error("article {article_id} is missing required field {field}")]
    MissingField { article_id: String, field: &'static str },
}

/// Errors surfaced by the Batch Screener.
#[derive(Debug, Error)]
pub enum ScreenError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

/// Errors the Task Processor surfaces as a task-level failure (§7).
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("batch failed after retries: {0}")]
    BatchExhausted(#[from] ScreenError),
    #[error("no articles found for task")]
    NoArticles,
    #[error("lock lost mid-processing")]
    LockLost,
    #[error("cancelled")]
    Cancelled,
}
