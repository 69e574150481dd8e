//! Talks to the real primary provider. Run with
//! `CP_PRIMARY_API_KEY=... cargo test --features live_upstream --test live_upstream`.
#![cfg(feature = "live_upstream")]

use std::sync::Arc;
use std::time::Duration;

use counterpoint::clock::{Clock, SystemClock};
use counterpoint::config::ProviderConfig;
use counterpoint::upstream::{
    AdapterSettings, ChatTransport, HttpChatTransport, Phase1Adapter, UpstreamRateLimiter,
};

#[tokio::test]
async fn primary_provider_returns_a_clamped_analysis() {
    let Ok(key) = std::env::var("CP_PRIMARY_API_KEY") else {
        eprintln!("CP_PRIMARY_API_KEY not set; skipping");
        return;
    };
    let mut provider = ProviderConfig::primary();
    provider.api_key = Some(key);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport: Arc<dyn ChatTransport> = Arc::new(
        HttpChatTransport::new(
            provider.base_url.clone(),
            Duration::from_millis(provider.timeout_ms),
        )
        .unwrap(),
    );
    let limiter = Arc::new(UpstreamRateLimiter::new(
        provider.name.clone(),
        provider.requests_per_window,
        provider.window_ms,
        clock.clone(),
    ));
    let adapter = Phase1Adapter::new(AdapterSettings::from(&provider), transport, limiter, clock);

    let result = adapter
        .call(
            "live-1",
            "Either we ban all cars tomorrow or the planet is doomed.",
            None,
        )
        .await
        .expect("provider produced an analysis");
    for c in result.vector.components() {
        assert!((-1.0..=1.0).contains(&c));
    }
    assert!((0.0..=1.0).contains(&result.confidence));
}
