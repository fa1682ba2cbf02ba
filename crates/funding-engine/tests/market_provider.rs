//! Market provider fan-out, caching and stale-fallback tests.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{snapshot, FundingScript, StubAdapter};
use funding_engine::{EngineConfig, MarketProvider};
use venue_adapters::{SourceTag, VenueAdapter, VenueId};

fn provider_with(
    adapters: Vec<Arc<StubAdapter>>,
    config: EngineConfig,
) -> (MarketProvider, BTreeMap<VenueId, Arc<StubAdapter>>) {
    let mut map: BTreeMap<VenueId, Arc<dyn VenueAdapter>> = BTreeMap::new();
    let mut stubs = BTreeMap::new();
    for adapter in adapters {
        map.insert(adapter.venue(), adapter.clone());
        stubs.insert(adapter.venue(), adapter);
    }
    (MarketProvider::new(map, config), stubs)
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        venue_fetch_budget: Duration::from_millis(200),
        total_fetch_budget: Duration::from_millis(600),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_fetch_then_refetch_is_cache_hit() {
    let binance = StubAdapter::new(VenueId::Binance);
    let okx = StubAdapter::new(VenueId::Okx);
    binance
        .script_funding(FundingScript::Ok(vec![snapshot(
            VenueId::Binance,
            "BTCUSDT",
            0.0001,
            8.0,
        )]))
        .await;
    okx.script_funding(FundingScript::Ok(vec![snapshot(
        VenueId::Okx,
        "BTCUSDT",
        0.0002,
        8.0,
    )]))
    .await;

    let (provider, stubs) = provider_with(vec![binance, okx], fast_config());

    let first = provider.fetch_all(false).await;
    assert!(!first.meta.cache_hit);
    assert_eq!(first.meta.venues_ok.len(), 2);
    assert!(first.meta.venues_failed.is_empty());
    assert_eq!(first.flattened().len(), 2);

    let second = provider.fetch_all(false).await;
    assert!(second.meta.cache_hit);
    assert_eq!(second.flattened().len(), 2);
    // Rows are identical between the two sweeps.
    let first_symbols: Vec<_> = first
        .flattened()
        .iter()
        .map(|s| (s.exchange, s.symbol.clone()))
        .collect();
    let second_symbols: Vec<_> = second
        .flattened()
        .iter()
        .map(|s| (s.exchange, s.symbol.clone()))
        .collect();
    assert_eq!(first_symbols, second_symbols);

    // No second network call happened.
    assert_eq!(
        stubs[&VenueId::Binance].funding_calls.load(Ordering::SeqCst),
        1
    );
    assert_eq!(stubs[&VenueId::Okx].funding_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_zero_rows_is_failure() {
    let binance = StubAdapter::new(VenueId::Binance);
    binance.script_funding(FundingScript::Empty).await;

    let (provider, _) = provider_with(vec![binance], fast_config());
    let result = provider.fetch_all(false).await;

    assert!(result.meta.venues_ok.is_empty());
    assert_eq!(result.meta.venues_failed.len(), 1);
    assert!(result.meta.venues_failed[0].message.contains("zero rows"));
    assert!(result.snapshots_by_venue.is_empty());
}

#[tokio::test]
async fn test_stale_fallback_after_venue_failure() {
    let binance = StubAdapter::new(VenueId::Binance);
    binance
        .script_funding(FundingScript::Ok(vec![snapshot(
            VenueId::Binance,
            "BTCUSDT",
            0.0001,
            8.0,
        )]))
        .await;
    binance
        .script_funding(FundingScript::Fail("venue down".into()))
        .await;

    // Tight TTL with a generous stale window: the second sweep finds the
    // cache expired but admissible.
    let config = EngineConfig {
        cache_ttl: Duration::from_millis(50),
        stale_max_age: Duration::from_secs(120),
        ..fast_config()
    };
    let (provider, _) = provider_with(vec![binance], config);

    let first = provider.fetch_all(false).await;
    assert_eq!(first.meta.venues_ok, vec![VenueId::Binance]);

    tokio::time::sleep(Duration::from_millis(120)).await;

    let second = provider.fetch_all(false).await;
    assert!(!second.meta.cache_hit);
    assert_eq!(second.meta.venues_failed.len(), 1);
    // The row is still served, re-tagged as stale provenance.
    let rows = &second.snapshots_by_venue[&VenueId::Binance];
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source_tag, SourceTag::Stale);
    assert_eq!(
        second.meta.venue_sources.get(&VenueId::Binance),
        Some(&SourceTag::Stale)
    );
}

#[tokio::test]
async fn test_force_refresh_bypasses_fresh_cache() {
    let binance = StubAdapter::new(VenueId::Binance);
    binance
        .script_funding(FundingScript::Ok(vec![snapshot(
            VenueId::Binance,
            "BTCUSDT",
            0.0001,
            8.0,
        )]))
        .await;
    binance
        .script_funding(FundingScript::Ok(vec![snapshot(
            VenueId::Binance,
            "BTCUSDT",
            0.0003,
            8.0,
        )]))
        .await;

    let (provider, stubs) = provider_with(vec![binance], fast_config());

    let first = provider.fetch_all(false).await;
    assert!(!first.meta.cache_hit);

    let forced = provider.fetch_all(true).await;
    assert!(!forced.meta.cache_hit);
    assert_eq!(
        stubs[&VenueId::Binance].funding_calls.load(Ordering::SeqCst),
        2
    );
    let rows = &forced.snapshots_by_venue[&VenueId::Binance];
    assert_eq!(rows[0].funding_rate_raw, Some(0.0003));
}

#[tokio::test]
async fn test_venue_budget_timeout_fails_venue() {
    let binance = StubAdapter::new(VenueId::Binance);
    let okx = StubAdapter::new(VenueId::Okx);
    binance
        .script_funding(FundingScript::Hang(Duration::from_secs(5)))
        .await;
    okx.script_funding(FundingScript::Ok(vec![snapshot(
        VenueId::Okx,
        "BTCUSDT",
        0.0002,
        8.0,
    )]))
    .await;

    let (provider, _) = provider_with(vec![binance, okx], fast_config());
    let started = std::time::Instant::now();
    let result = provider.fetch_all(false).await;

    // The hung venue is cut by its budget, not the full hang.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.meta.venues_ok, vec![VenueId::Okx]);
    assert_eq!(result.meta.venues_failed.len(), 1);
    assert_eq!(result.meta.venues_failed[0].venue, VenueId::Binance);
    assert!(result.meta.venues_failed[0].message.contains("budget"));
}

#[tokio::test]
async fn test_single_flight_shares_one_sweep() {
    let binance = StubAdapter::new(VenueId::Binance);
    // Slow but successful fetch; only one of the concurrent callers
    // should reach the adapter.
    binance
        .script_funding(FundingScript::Ok(vec![snapshot(
            VenueId::Binance,
            "BTCUSDT",
            0.0001,
            8.0,
        )]))
        .await;
    binance
        .script_funding(FundingScript::Ok(vec![snapshot(
            VenueId::Binance,
            "BTCUSDT",
            0.0001,
            8.0,
        )]))
        .await;

    let (provider, stubs) = provider_with(vec![binance], fast_config());
    let provider = Arc::new(provider);

    let a = {
        let provider = Arc::clone(&provider);
        tokio::spawn(async move { provider.fetch_all(false).await })
    };
    let b = {
        let provider = Arc::clone(&provider);
        tokio::spawn(async move { provider.fetch_all(false).await })
    };

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert_eq!(a.flattened().len(), 1);
    assert_eq!(b.flattened().len(), 1);
    // One sweep hit the network; the other was satisfied by the cache it
    // populated.
    assert_eq!(
        stubs[&VenueId::Binance].funding_calls.load(Ordering::SeqCst),
        1
    );
}
