//! Request path shared by the HTTP surface and the CLI:
//! quota reservation → Phase 1 cache → (decision | Phase 2 cache).

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, ResultCacheService, Source};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ProviderConfig};
use crate::decision::{Decision, DecisionEngine, ThresholdOverrides};
use crate::error::{CounterpointError, Result};
use crate::models::{AnalysisContext, ContentVector, Phase1Analysis, Phase2Analysis, UserProfile};
use crate::quota::{QuotaCheck, QuotaService, QuotaSnapshot, Rejection, RequestRateLimiter};
use crate::storage::{
    InMemoryProfileStore, InMemoryQuotaStore, InMemoryRepository, ProfileStore, QuotaStore,
    Repository, SqliteStore,
};
use crate::upstream::{
    AdapterSettings, AnalysisKind, Analyzer, ChatTransport, HttpChatTransport, Phase1Adapter,
    Phase2Adapter, UpstreamAdapter, UpstreamRateLimiter,
};
use crate::utils::keys::{content_key, phase1_key, phase2_key};
use crate::utils::text::truncate_snippet;

/// Longest post accepted; upstream input is truncated further per provider
pub const MAX_TEXT_CHARS: usize = 10_000;

const MAX_TRACKED_ENGINES: usize = 10_000;

const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{}", .0.message)]
    Rejected(Rejection),

    #[error(transparent)]
    Service(#[from] CounterpointError),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Who is asking. Authentication happens before this point.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub user_id: Option<String>,
    /// Caller's own upstream credential
    pub byok_key: Option<String>,
}

impl Caller {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            byok_key: None,
        }
    }

    pub fn with_byok(mut self, key: impl Into<String>) -> Self {
        self.byok_key = Some(key.into());
        self
    }

    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    fn byok(&self) -> Option<String> {
        self.byok_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    /// Content id; derived from the text when absent
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterveneRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
    /// Reader position for this call; the stored profile is used otherwise
    #[serde(default)]
    pub user_vector: Option<ContentVector>,
    #[serde(default)]
    pub overrides: Option<ThresholdOverrides>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub content_id: String,
    pub source: Source,
    pub result: Phase1Analysis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterveneResponse {
    pub content_id: String,
    pub source: Source,
    pub analysis: Phase1Analysis,
    /// Absent when no reader position is known
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainResponse {
    pub content_id: String,
    pub source: Source,
    pub result: Phase2Analysis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub phase1: CacheStats,
    pub phase2: CacheStats,
    pub decision_engines: usize,
}

/// Injected collaborators, so tests can swap analyzers and stores
pub struct PipelineParts {
    pub phase1: Arc<dyn Analyzer<Phase1Analysis>>,
    pub phase2: Arc<dyn Analyzer<Phase2Analysis>>,
    pub repository: Arc<dyn Repository>,
    pub quota_store: Arc<dyn QuotaStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub clock: Arc<dyn Clock>,
}

pub struct AnalysisPipeline {
    config: Config,
    phase1: ResultCacheService<Phase1Analysis>,
    phase2: ResultCacheService<Phase2Analysis>,
    quota: QuotaService,
    rate_limiter: RequestRateLimiter,
    profiles: Arc<dyn ProfileStore>,
    engines: Mutex<LruCache<String, Arc<DecisionEngine>>>,
    clock: Arc<dyn Clock>,
}

impl AnalysisPipeline {
    pub fn new(config: Config, parts: PipelineParts) -> Self {
        let phase1 = ResultCacheService::new(
            "phase1",
            config.cache.capacity,
            config.cache.phase1_ttl_ms,
            parts.phase1,
            parts.repository.clone(),
            parts.clock.clone(),
        );
        let phase2 = ResultCacheService::new(
            "phase2",
            config.cache.capacity,
            config.cache.phase2_ttl_ms,
            parts.phase2,
            parts.repository,
            parts.clock.clone(),
        );
        let quota = QuotaService::new(&config.quota, parts.quota_store, parts.clock.clone());
        let rate_limiter = RequestRateLimiter::new(&config.rate_limit, parts.clock.clone());
        let engines = Mutex::new(LruCache::new(
            NonZeroUsize::new(MAX_TRACKED_ENGINES).unwrap_or(NonZeroUsize::MIN),
        ));
        Self {
            config,
            phase1,
            phase2,
            quota,
            rate_limiter,
            profiles: parts.profiles,
            engines,
            clock: parts.clock,
        }
    }

    /// Wire real transports and stores from configuration
    pub fn from_config(config: Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (repository, quota_store, profiles): (
            Arc<dyn Repository>,
            Arc<dyn QuotaStore>,
            Arc<dyn ProfileStore>,
        ) = if config.storage.in_memory {
            info!("Using in-memory storage");
            let repository: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
            let quota_store: Arc<dyn QuotaStore> = Arc::new(InMemoryQuotaStore::new());
            let profiles: Arc<dyn ProfileStore> = Arc::new(InMemoryProfileStore::new());
            (repository, quota_store, profiles)
        } else {
            let path = config.storage.resolved_sqlite_path();
            info!("Opening SQLite store at {}", path.display());
            let store = Arc::new(SqliteStore::open(&path)?);
            let repository: Arc<dyn Repository> = store.clone();
            let quota_store: Arc<dyn QuotaStore> = store.clone();
            let profiles: Arc<dyn ProfileStore> = store;
            (repository, quota_store, profiles)
        };

        let phase1: Phase1Adapter = build_adapter(&config.primary, clock.clone())?;
        let phase2: Phase2Adapter = build_adapter(&config.secondary, clock.clone())?;

        Ok(Self::new(
            config,
            PipelineParts {
                phase1: Arc::new(phase1) as Arc<dyn Analyzer<Phase1Analysis>>,
                phase2: Arc::new(phase2) as Arc<dyn Analyzer<Phase2Analysis>>,
                repository,
                quota_store,
                profiles,
                clock,
            },
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rate_limiter(&self) -> &RequestRateLimiter {
        &self.rate_limiter
    }

    pub fn quota(&self) -> &QuotaService {
        &self.quota
    }

    pub fn phase1_cache(&self) -> &ResultCacheService<Phase1Analysis> {
        &self.phase1
    }

    pub fn phase2_cache(&self) -> &ResultCacheService<Phase2Analysis> {
        &self.phase2
    }

    fn validate_text(text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(CounterpointError::validation("text must not be empty"));
        }
        if text.chars().count() > MAX_TEXT_CHARS {
            return Err(CounterpointError::validation(format!(
                "text exceeds {} characters",
                MAX_TEXT_CHARS
            )));
        }
        Ok(())
    }

    fn content_id(id: Option<&str>, text: &str) -> String {
        id.map(str::trim)
            .filter(|i| !i.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| content_key(text))
    }

    /// Quota admission. The unit is reserved before any upstream work, so
    /// concurrent requests can never overshoot the limit. A reserved unit is
    /// not returned when the analysis turns out unavailable.
    /// Anonymous and BYOK callers are not metered.
    async fn admit(&self, caller: &Caller) -> PipelineResult<Option<QuotaSnapshot>> {
        let Some(user_id) = caller.user_id() else {
            return Ok(None);
        };
        match self.quota.check_quota(user_id, caller.byok().is_some()).await {
            QuotaCheck::Bypassed => return Ok(None),
            QuotaCheck::Allowed(_) => {}
            QuotaCheck::Rejected(rejection) => {
                info!(user_id, code = rejection.code.as_str(), "quota rejection");
                return Err(PipelineError::Rejected(rejection));
            }
        }
        match self.quota.increment_quota(user_id).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(rejection) => {
                info!(user_id, code = rejection.code.as_str(), "quota filled concurrently");
                Err(PipelineError::Rejected(rejection))
            }
        }
    }

    async fn phase1_for(
        &self,
        content_id: &str,
        text: &str,
        caller: &Caller,
    ) -> PipelineResult<(Source, Phase1Analysis)> {
        let context = AnalysisContext::default().with_api_key(caller.byok());
        let outcome = self
            .phase1
            .analyze_with_context(&phase1_key(content_id), text, Some(context))
            .await
            .ok_or_else(|| CounterpointError::Unavailable {
                message: format!("content analysis unavailable for {}", content_id),
            })?;
        Ok((outcome.source, outcome.result))
    }

    /// Phase 1 analysis of one post
    pub async fn analyze(
        &self,
        request: &AnalyzeRequest,
        caller: &Caller,
    ) -> PipelineResult<AnalyzeResponse> {
        Self::validate_text(&request.text)?;
        let content_id = Self::content_id(request.id.as_deref(), &request.text);
        let quota = self.admit(caller).await?;

        debug!(content_id = %content_id, text = %truncate_snippet(&request.text, 60), "analyze");
        let (source, result) = self.phase1_for(&content_id, &request.text, caller).await?;
        Ok(AnalyzeResponse {
            content_id,
            source,
            result,
            quota,
        })
    }

    fn engine_for(&self, user_id: &str) -> Arc<DecisionEngine> {
        let mut engines = self.engines.lock().unwrap_or_else(PoisonError::into_inner);
        engines
            .get_or_insert(user_id.to_string(), || {
                Arc::new(DecisionEngine::new(&self.config.decision, self.clock.clone()))
            })
            .clone()
    }

    async fn reader_vector(
        &self,
        user_id: &str,
        supplied: Option<ContentVector>,
    ) -> Option<ContentVector> {
        if let Some(v) = supplied {
            return Some(v.clamped());
        }
        match self.profiles.get_profile(user_id).await {
            Ok(profile) => profile.map(|p| p.vector),
            Err(e) => {
                warn!(user_id, "profile lookup failed: {}", e);
                None
            }
        }
    }

    /// Phase 1 analysis plus an intervention decision for the reader
    pub async fn should_intervene(
        &self,
        request: &InterveneRequest,
        caller: &Caller,
    ) -> PipelineResult<InterveneResponse> {
        Self::validate_text(&request.text)?;
        let content_id = Self::content_id(request.id.as_deref(), &request.text);
        let quota = self.admit(caller).await?;

        let (source, analysis) = self.phase1_for(&content_id, &request.text, caller).await?;
        let user_id = caller.user_id().unwrap_or(ANONYMOUS);
        let decision = self
            .reader_vector(user_id, request.user_vector)
            .await
            .map(|vector| {
                let profile = UserProfile::new(user_id, vector);
                self.engine_for(user_id)
                    .evaluate_tweet(&analysis, &profile, request.overrides.as_ref())
            });
        Ok(InterveneResponse {
            content_id,
            source,
            analysis,
            decision,
            quota,
        })
    }

    /// Per-reader deep dive, built on the Phase 1 result
    pub async fn explain(
        &self,
        request: &InterveneRequest,
        caller: &Caller,
    ) -> PipelineResult<ExplainResponse> {
        Self::validate_text(&request.text)?;
        let content_id = Self::content_id(request.id.as_deref(), &request.text);
        let quota = self.admit(caller).await?;

        let user_id = caller.user_id().unwrap_or(ANONYMOUS);
        // The deep dive still works without Phase 1, just with less context
        let phase1 = self
            .phase1_for(&content_id, &request.text, caller)
            .await
            .ok()
            .map(|(_, analysis)| analysis);
        let context = AnalysisContext {
            phase1,
            user_vector: self.reader_vector(user_id, request.user_vector).await,
            api_key: None,
        }
        .with_api_key(caller.byok());

        let outcome = self
            .phase2
            .analyze_with_context(&phase2_key(user_id, &content_id), &request.text, Some(context))
            .await
            .ok_or_else(|| CounterpointError::Unavailable {
                message: format!("deep analysis unavailable for {}", content_id),
            })?;
        Ok(ExplainResponse {
            content_id,
            source: outcome.source,
            result: outcome.result,
            quota,
        })
    }

    /// Current allowance for an authenticated caller
    pub async fn quota_status(&self, caller: &Caller) -> Option<QuotaSnapshot> {
        let user_id = caller.user_id()?;
        Some(self.quota.status(user_id).await)
    }

    pub async fn put_profile(&self, profile: UserProfile) -> Result<UserProfile> {
        if profile.user_id.trim().is_empty() {
            return Err(CounterpointError::validation("userId must not be empty"));
        }
        let profile = UserProfile::new(profile.user_id.trim(), profile.vector);
        self.profiles.put_profile(profile.clone()).await?;
        Ok(profile)
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.profiles.get_profile(user_id).await
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            phase1: self.phase1.stats(),
            phase2: self.phase2.stats(),
            decision_engines: self
                .engines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}

fn build_adapter<K: AnalysisKind>(
    provider: &ProviderConfig,
    clock: Arc<dyn Clock>,
) -> Result<UpstreamAdapter<K>> {
    let transport: Arc<dyn ChatTransport> = Arc::new(HttpChatTransport::new(
        provider.base_url.clone(),
        std::time::Duration::from_millis(provider.timeout_ms),
    )?);
    let limiter = Arc::new(UpstreamRateLimiter::new(
        provider.name.clone(),
        provider.requests_per_window,
        provider.window_ms,
        clock.clone(),
    ));
    if !provider.has_api_key() {
        info!(
            provider = %provider.name,
            "No API key configured; requests without a BYOK key will be unavailable"
        );
    }
    Ok(UpstreamAdapter::new(
        AdapterSettings::from(provider),
        transport,
        limiter,
        clock,
    ))
}
