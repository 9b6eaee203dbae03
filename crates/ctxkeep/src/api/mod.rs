//! Model API access for compaction.
//!
//! - [`openrouter`]: [`OpenRouterSummarizer`], a
//!   [`SummaryBackend`](crate::context::summarizer::SummaryBackend) backed by the
//!   OpenRouter chat completions API.
//! - [`retry`]: exponential backoff for transient summarization failures.

pub mod openrouter;
pub mod retry;

pub use openrouter::OpenRouterSummarizer;
pub use retry::RetryConfig;
