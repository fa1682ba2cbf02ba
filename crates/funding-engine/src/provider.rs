//! Market provider: concurrent aggregation over all venue adapters.
//!
//! One worker per venue races the adapter's transport chain under a
//! per-venue deadline, with an overall deadline over the whole sweep.
//! Workers share no mutable state; fan-in writes the cache, applies the
//! stale fallback for failed venues and assembles the fetch meta.
//! Concurrent non-forced callers share one in-flight sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use venue_adapters::{FundingBatch, FundingSnapshot, SourceTag, VenueAdapter, VenueError, VenueId};

use crate::cache::{SnapshotCache, VenueCacheRead};
use crate::EngineConfig;

/// One venue's failure in a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueFailure {
    pub venue: VenueId,
    pub message: String,
}

/// Normalized per-sweep metadata. `venue_sources` is the single
/// provenance shape exposed at the system boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchMeta {
    pub fetch_ms: u64,
    pub cache_hit: bool,
    pub venues_ok: Vec<VenueId>,
    pub venues_failed: Vec<VenueFailure>,
    pub venue_sources: BTreeMap<VenueId, SourceTag>,
}

/// Snapshot sweep result keyed by venue, deterministic by venue name.
#[derive(Debug, Clone)]
pub struct BoardResult {
    pub as_of: DateTime<Utc>,
    pub snapshots_by_venue: BTreeMap<VenueId, Vec<FundingSnapshot>>,
    pub meta: FetchMeta,
}

impl BoardResult {
    /// Flat snapshot list ordered by `(symbol, exchange)`.
    pub fn flattened(&self) -> Vec<FundingSnapshot> {
        let mut snapshots: Vec<FundingSnapshot> = self
            .snapshots_by_venue
            .values()
            .flatten()
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then_with(|| a.exchange.as_str().cmp(b.exchange.as_str()))
        });
        snapshots
    }
}

pub struct MarketProvider {
    adapters: BTreeMap<VenueId, Arc<dyn VenueAdapter>>,
    cache: Arc<SnapshotCache>,
    config: EngineConfig,
    /// Single-flight guard for non-forced sweeps.
    flight: Mutex<()>,
}

impl MarketProvider {
    pub fn new(adapters: BTreeMap<VenueId, Arc<dyn VenueAdapter>>, config: EngineConfig) -> Self {
        let cache = Arc::new(SnapshotCache::new(config.cache_ttl, config.stale_max_age));
        Self {
            adapters,
            cache,
            config,
            flight: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> Arc<SnapshotCache> {
        Arc::clone(&self.cache)
    }

    pub fn venues(&self) -> Vec<VenueId> {
        self.adapters.keys().copied().collect()
    }

    /// Fetch every venue's snapshots, from cache when possible.
    ///
    /// `force_refresh` ignores fresh cache entries and bypasses the
    /// shared in-flight sweep without invalidating it; stale entries
    /// remain admissible if the live fetch fails.
    pub async fn fetch_all(&self, force_refresh: bool) -> BoardResult {
        let started = Instant::now();

        if !force_refresh {
            if let Some(result) = self.try_serve_from_cache(started).await {
                return result;
            }
            // Single-flight: late arrivals wait for the sweep in progress
            // and are satisfied by the cache it populated.
            let _guard = self.flight.lock().await;
            if let Some(result) = self.try_serve_from_cache(started).await {
                return result;
            }
            return self.sweep(started).await;
        }

        self.sweep(started).await
    }

    async fn try_serve_from_cache(&self, started: Instant) -> Option<BoardResult> {
        let now = Utc::now();
        let mut snapshots_by_venue = BTreeMap::new();
        let mut venue_sources = BTreeMap::new();

        for venue in self.adapters.keys() {
            match self.cache.venue_read(*venue, now).await {
                VenueCacheRead::Fresh(snapshots, source) => {
                    snapshots_by_venue.insert(*venue, snapshots);
                    venue_sources.insert(*venue, source);
                }
                _ => return None,
            }
        }

        debug!("market sweep satisfied entirely from cache");
        Some(BoardResult {
            as_of: now,
            snapshots_by_venue,
            meta: FetchMeta {
                fetch_ms: started.elapsed().as_millis() as u64,
                cache_hit: true,
                venues_ok: self.adapters.keys().copied().collect(),
                venues_failed: Vec::new(),
                venue_sources,
            },
        })
    }

    async fn sweep(&self, started: Instant) -> BoardResult {
        let deadline = tokio::time::Instant::now() + self.config.total_fetch_budget;
        let venue_budget = self.config.venue_fetch_budget;

        let mut join_set: JoinSet<(VenueId, Result<FundingBatch, VenueError>)> = JoinSet::new();
        for (venue, adapter) in &self.adapters {
            let venue = *venue;
            let adapter = Arc::clone(adapter);
            join_set.spawn(async move {
                let outcome = match tokio::time::timeout(venue_budget, adapter.fetch_funding())
                    .await
                {
                    Err(_) => Err(VenueError::timeout(format!(
                        "{venue} exceeded the per-venue fetch budget"
                    ))),
                    Ok(Err(err)) => Err(err),
                    // Zero rows normally means throttling, not an empty market.
                    Ok(Ok(batch)) if batch.snapshots.is_empty() => Err(VenueError::transient(
                        format!("{venue} returned zero rows"),
                    )),
                    Ok(Ok(batch)) => Ok(batch),
                };
                (venue, outcome)
            });
        }

        let mut outcomes: BTreeMap<VenueId, Result<FundingBatch, VenueError>> = BTreeMap::new();
        loop {
            match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok((venue, outcome)))) => {
                    outcomes.insert(venue, outcome);
                }
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "venue fetch worker panicked");
                }
                Ok(None) => break,
                Err(_) => {
                    join_set.abort_all();
                    break;
                }
            }
        }

        let now = Utc::now();
        let mut snapshots_by_venue = BTreeMap::new();
        let mut venue_sources = BTreeMap::new();
        let mut venues_ok = Vec::new();
        let mut venues_failed = Vec::new();

        for venue in self.adapters.keys().copied() {
            let outcome = outcomes.remove(&venue).unwrap_or_else(|| {
                Err(VenueError::timeout(format!(
                    "{venue} exceeded the total fetch budget"
                )))
            });

            match outcome {
                Ok(batch) => {
                    self.cache.put(venue, &batch.snapshots, batch.source, now).await;
                    venue_sources.insert(venue, batch.source);
                    snapshots_by_venue.insert(venue, batch.snapshots);
                    venues_ok.push(venue);
                }
                Err(err) => {
                    venues_failed.push(VenueFailure {
                        venue,
                        message: err.to_string(),
                    });
                    // Data-path failures are downgraded when the cache
                    // still holds an admissible entry set.
                    match self.cache.venue_read(venue, now).await {
                        VenueCacheRead::Fresh(snapshots, source) => {
                            debug!(%venue, "serving fresh cache despite live fetch failure");
                            venue_sources.insert(venue, source);
                            snapshots_by_venue.insert(venue, snapshots);
                        }
                        VenueCacheRead::Stale(snapshots) => {
                            info!(%venue, "serving stale cache after live fetch failure");
                            venue_sources.insert(venue, SourceTag::Stale);
                            snapshots_by_venue.insert(venue, snapshots);
                        }
                        VenueCacheRead::Miss => {
                            warn!(%venue, error = %venues_failed.last().unwrap().message, "venue unavailable with no cache fallback");
                        }
                    }
                }
            }
        }

        BoardResult {
            as_of: now,
            snapshots_by_venue,
            meta: FetchMeta {
                fetch_ms: started.elapsed().as_millis() as u64,
                cache_hit: false,
                venues_ok,
                venues_failed,
                venue_sources,
            },
        }
    }
}
