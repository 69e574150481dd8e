//! Upstream analyzer providers: transport, failure classification, outbound
//! rate limiting and the retrying adapter that ties them together.

use async_trait::async_trait;

use crate::models::AnalysisContext;

pub mod adapter;
pub mod classifier;
pub mod parse;
pub mod prompt;
pub mod rate_limiter;
pub mod transport;

pub use adapter::{
    AdapterSettings, AnalysisKind, Phase1Adapter, Phase1Kind, Phase2Adapter, Phase2Kind,
    UpstreamAdapter,
};
pub use classifier::{AttemptOutcome, RetryableError};
pub use rate_limiter::UpstreamRateLimiter;
pub use transport::{ChatMessage, ChatRequest, ChatTransport, HttpChatTransport, UpstreamFailure};

/// Anything that can produce an analysis on a cache miss.
/// `None` means "analysis unavailable"; implementations never error.
#[async_trait]
pub trait Analyzer<T>: Send + Sync {
    async fn analyze(&self, id: &str, text: &str, context: Option<&AnalysisContext>)
    -> Option<T>;
}
