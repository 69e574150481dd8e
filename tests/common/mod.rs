//! Shared fakes for integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use counterpoint::error::{CounterpointError, Result};
use counterpoint::models::{AnalysisContext, ContentVector, Phase1Analysis, Phase2Analysis};
use counterpoint::storage::{Repository, StoredRecord};
use counterpoint::upstream::{Analyzer, ChatRequest, ChatTransport, UpstreamFailure};

/// The canonical Phase 1 stub result
pub fn tweet_100_result() -> Phase1Analysis {
    Phase1Analysis {
        vector: ContentVector::new(0.2, 0.1, -0.1),
        fallacies: vec!["False Dilemma".to_string()],
        topic: "topic-3".to_string(),
        confidence: 0.73,
    }
}

pub fn phase2_result() -> Phase2Analysis {
    Phase2Analysis {
        counter_argument: "There are more than two options.".into(),
        logic_failure: "False dilemma.".into(),
        claim: "Only one policy works.".into(),
        mechanism: "Urgency framing.".into(),
        data_check: "Check multi-year statistics.".into(),
        socratic_challenge: "What would change your mind?".into(),
    }
}

/// Analyzer returning a fixed value after an optional real delay
pub struct StubAnalyzer<T> {
    pub result: Option<T>,
    pub delay: Duration,
    pub calls: AtomicUsize,
    pub contexts: Mutex<Vec<Option<AnalysisContext>>>,
}

impl<T> StubAnalyzer<T> {
    pub fn returning(result: Option<T>) -> Self {
        Self {
            result,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn slow(result: Option<T>, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::returning(result)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_context(&self) -> Option<AnalysisContext> {
        self.contexts.lock().unwrap().last().cloned().flatten()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> Analyzer<T> for StubAnalyzer<T> {
    async fn analyze(
        &self,
        _id: &str,
        _text: &str,
        context: Option<&AnalysisContext>,
    ) -> Option<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(context.cloned());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result.clone()
    }
}

/// Repository that rejects every read and write
#[derive(Default)]
pub struct FailingRepository {
    pub writes: AtomicUsize,
}

#[async_trait]
impl Repository for FailingRepository {
    async fn get(&self, _key: &str) -> Result<Option<StoredRecord>> {
        Err(CounterpointError::Storage {
            message: "repository offline".into(),
        })
    }

    async fn upsert(&self, _record: StoredRecord) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(CounterpointError::Storage {
            message: "repository offline".into(),
        })
    }
}

/// Transport that replays a script of responses and records every request
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<std::result::Result<String, UpstreamFailure>>>,
    pub requests: Mutex<Vec<(ChatRequest, String)>>,
    pub delay: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<std::result::Result<String, UpstreamFailure>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn hanging(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<(ChatRequest, String)> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn complete(
        &self,
        request: &ChatRequest,
        api_key: &str,
    ) -> std::result::Result<String, UpstreamFailure> {
        self.requests
            .lock()
            .unwrap()
            .push((request.clone(), api_key.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(UpstreamFailure::Network("script exhausted".into())))
    }
}

pub fn http_failure(status: u16, retry_after_ms: Option<u64>) -> UpstreamFailure {
    UpstreamFailure::Http {
        status,
        retry_after_ms,
        body: String::new(),
    }
}

pub const GOOD_PHASE1_JSON: &str = r#"{"vector":{"social":0.2,"economic":0.1,"populist":-0.1},"fallacies":["False Dilemma"],"topic":"topic-3","confidence":0.73}"#;

pub struct TestPipeline {
    pub pipeline: Arc<counterpoint::AnalysisPipeline>,
    pub phase1: Arc<StubAnalyzer<Phase1Analysis>>,
    pub phase2: Arc<StubAnalyzer<Phase2Analysis>>,
    pub quota_store: Arc<counterpoint::storage::InMemoryQuotaStore>,
    pub clock: Arc<counterpoint::ManualClock>,
}

/// Pipeline over stub analyzers and in-memory stores
pub fn test_pipeline(
    config: counterpoint::Config,
    phase1: Option<Phase1Analysis>,
    phase2: Option<Phase2Analysis>,
) -> TestPipeline {
    test_pipeline_with(
        config,
        Arc::new(StubAnalyzer::returning(phase1)),
        Arc::new(StubAnalyzer::returning(phase2)),
    )
}

/// Same as [`test_pipeline`] with caller-built analyzers
pub fn test_pipeline_with(
    config: counterpoint::Config,
    phase1: Arc<StubAnalyzer<Phase1Analysis>>,
    phase2: Arc<StubAnalyzer<Phase2Analysis>>,
) -> TestPipeline {
    let quota_store = Arc::new(counterpoint::storage::InMemoryQuotaStore::new());
    // 2024-03-15T10:00:00Z
    let clock = Arc::new(counterpoint::ManualClock::new(1_710_496_800_000));
    let pipeline = counterpoint::AnalysisPipeline::new(
        config,
        counterpoint::pipeline::PipelineParts {
            phase1: phase1.clone(),
            phase2: phase2.clone(),
            repository: Arc::new(counterpoint::storage::InMemoryRepository::new()),
            quota_store: quota_store.clone(),
            profiles: Arc::new(counterpoint::storage::InMemoryProfileStore::new()),
            clock: clock.clone(),
        },
    );
    TestPipeline {
        pipeline: Arc::new(pipeline),
        phase1,
        phase2,
        quota_store,
        clock,
    }
}
