//! Retrying, rate-limited adapter around one upstream analyzer provider

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::Analyzer;
use super::classifier::{AttemptOutcome, RetryableError, backoff_delay};
use super::parse::{decode_phase1, decode_phase2};
use super::prompt::{phase1_messages, phase2_messages};
use super::rate_limiter::UpstreamRateLimiter;
use super::transport::{ChatMessage, ChatRequest, ChatTransport};
use crate::clock::Clock;
use crate::config::ProviderConfig;
use crate::models::{AnalysisContext, Phase1Analysis, Phase2Analysis};
use crate::utils::text::{is_placeholder, truncate_chars};

/// What an adapter asks for and how it reads the answer
pub trait AnalysisKind: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    const NAME: &'static str;

    fn build_messages(text: &str, context: Option<&AnalysisContext>) -> Vec<ChatMessage>;

    /// `None` for anything that does not match the schema exactly
    fn decode(raw: &str) -> Option<Self::Output>;
}

/// Content-level framing and fallacy analysis
pub struct Phase1Kind;

impl AnalysisKind for Phase1Kind {
    type Output = Phase1Analysis;

    const NAME: &'static str = "phase1";

    fn build_messages(text: &str, _context: Option<&AnalysisContext>) -> Vec<ChatMessage> {
        phase1_messages(text)
    }

    fn decode(raw: &str) -> Option<Phase1Analysis> {
        decode_phase1(raw)
    }
}

/// Per-reader deep dive
pub struct Phase2Kind;

impl AnalysisKind for Phase2Kind {
    type Output = Phase2Analysis;

    const NAME: &'static str = "phase2";

    fn build_messages(text: &str, context: Option<&AnalysisContext>) -> Vec<ChatMessage> {
        phase2_messages(text, context)
    }

    fn decode(raw: &str) -> Option<Phase2Analysis> {
        decode_phase2(raw)
    }
}

/// Per-provider call settings
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub max_attempts: u32,
    pub max_input_chars: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl From<&ProviderConfig> for AdapterSettings {
    fn from(cfg: &ProviderConfig) -> Self {
        Self {
            provider: cfg.name.clone(),
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
            timeout: Duration::from_millis(cfg.timeout_ms),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            max_attempts: cfg.max_attempts,
            max_input_chars: cfg.max_input_chars,
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        }
    }
}

pub struct UpstreamAdapter<K: AnalysisKind> {
    settings: AdapterSettings,
    transport: Arc<dyn ChatTransport>,
    limiter: Arc<UpstreamRateLimiter>,
    clock: Arc<dyn Clock>,
    warned_missing_key: AtomicBool,
    _kind: PhantomData<K>,
}

pub type Phase1Adapter = UpstreamAdapter<Phase1Kind>;
pub type Phase2Adapter = UpstreamAdapter<Phase2Kind>;

impl<K: AnalysisKind> UpstreamAdapter<K> {
    pub fn new(
        settings: AdapterSettings,
        transport: Arc<dyn ChatTransport>,
        limiter: Arc<UpstreamRateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            transport,
            limiter,
            clock,
            warned_missing_key: AtomicBool::new(false),
            _kind: PhantomData,
        }
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    /// BYOK wins over the configured key
    fn resolve_key(&self, context: Option<&AnalysisContext>) -> Option<String> {
        context
            .and_then(|c| c.api_key.as_deref())
            .or(self.settings.api_key.as_deref())
            .filter(|k| !is_placeholder(k))
            .map(|k| k.trim().to_string())
    }

    /// Analyze `text`, returning `None` whenever no usable result could be produced.
    pub async fn call(
        &self,
        id: &str,
        text: &str,
        context: Option<&AnalysisContext>,
    ) -> Option<K::Output> {
        if text.trim().is_empty() {
            debug!(id, kind = K::NAME, "empty text, skipping upstream");
            return None;
        }
        let Some(api_key) = self.resolve_key(context) else {
            if !self.warned_missing_key.swap(true, Ordering::Relaxed) {
                warn!(
                    provider = %self.settings.provider,
                    kind = K::NAME,
                    "No API key configured for upstream analyzer; analysis unavailable"
                );
            }
            return None;
        };

        let input = truncate_chars(text, self.settings.max_input_chars);
        let request = ChatRequest {
            model: self.settings.model.clone(),
            messages: K::build_messages(&input, context),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };

        let max_attempts = self.settings.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.attempt(&request, &api_key).await {
                AttemptOutcome::Ok(output) => {
                    info!(
                        id,
                        provider = %self.settings.provider,
                        kind = K::NAME,
                        attempt,
                        "upstream analysis complete"
                    );
                    return Some(output);
                }
                AttemptOutcome::Fatal(reason) => {
                    warn!(
                        id,
                        provider = %self.settings.provider,
                        kind = K::NAME,
                        attempt,
                        "upstream analysis failed: {}",
                        reason
                    );
                    return None;
                }
                AttemptOutcome::Retry(err) => {
                    if attempt == max_attempts {
                        warn!(
                            id,
                            provider = %self.settings.provider,
                            kind = K::NAME,
                            attempts = max_attempts,
                            "upstream retries exhausted: {:?}",
                            err
                        );
                        return None;
                    }
                    let delay = backoff_delay(
                        &err,
                        attempt,
                        self.settings.backoff_base,
                        self.settings.timeout,
                    );
                    warn!(
                        id,
                        provider = %self.settings.provider,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retryable upstream failure: {:?}",
                        err
                    );
                    self.clock.sleep(delay).await;
                }
            }
        }
        None
    }

    async fn attempt(&self, request: &ChatRequest, api_key: &str) -> AttemptOutcome<K::Output> {
        self.limiter.acquire().await;
        let raw = match tokio::time::timeout(
            self.settings.timeout,
            self.transport.complete(request, api_key),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(failure)) => return AttemptOutcome::from_failure(&failure),
            Err(_) => return AttemptOutcome::Retry(RetryableError::Timeout),
        };
        match K::decode(&raw) {
            Some(output) => AttemptOutcome::Ok(output),
            None => AttemptOutcome::Fatal("response did not match the expected schema".to_string()),
        }
    }
}

#[async_trait]
impl<K: AnalysisKind> Analyzer<K::Output> for UpstreamAdapter<K> {
    async fn analyze(
        &self,
        id: &str,
        text: &str,
        context: Option<&AnalysisContext>,
    ) -> Option<K::Output> {
        self.call(id, text, context).await
    }
}
