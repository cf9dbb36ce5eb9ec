//! Task execution engine for LLM-driven article screening.
//!
//! Durable state machine (`store`), worker claim/lock primitives, the LLM
//! client with retry/cancel semantics, response normalisation, the batch
//! screener and the task processor that ties them together for one task's
//! full lifecycle.

pub mod config;
pub mod error;
pub mod llm;
pub mod model;
pub mod normalize;
pub mod processor;
pub mod prompt;
pub mod screener;
pub mod store;

pub use config::Settings;
pub use error::{LlmError, NormalizeError, ProcessError, ScreenError, StoreError};
pub use llm::LlmClient;
pub use model::{Article, ArticleInput, Decision, ScreeningResult, Task, TaskStatus};
pub use store::Store;
