//! Bounded-TTL snapshot cache with a stale admission window.
//!
//! Keys are `(venue, symbol)`. Entries expire after the TTL but remain
//! admissible for `stale_max_age` beyond expiry; a stale read is always
//! re-tagged `source_tag = stale` regardless of its original provenance.
//! `fetched_at` is monotonic per key: a put never replaces a newer entry
//! with an older one.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use venue_adapters::{FundingSnapshot, SourceTag, VenueId};

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: FundingSnapshot,
    expires_at: DateTime<Utc>,
}

/// Single-key lookup outcome.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Fresh(FundingSnapshot),
    Stale(FundingSnapshot),
    Miss,
}

/// Venue-level read outcome used by the market provider.
#[derive(Debug, Clone)]
pub enum VenueCacheRead {
    Fresh(Vec<FundingSnapshot>, SourceTag),
    Stale(Vec<FundingSnapshot>),
    Miss,
}

pub struct SnapshotCache {
    ttl: ChronoDuration,
    stale_max_age: ChronoDuration,
    inner: RwLock<HashMap<(VenueId, String), CacheEntry>>,
    venue_sources: RwLock<HashMap<VenueId, SourceTag>>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration, stale_max_age: Duration) -> Self {
        Self {
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(300)),
            stale_max_age: ChronoDuration::from_std(stale_max_age)
                .unwrap_or_else(|_| ChronoDuration::seconds(120)),
            inner: RwLock::new(HashMap::new()),
            venue_sources: RwLock::new(HashMap::new()),
        }
    }

    /// Insert one venue's batch. Entries whose `fetched_at` would move
    /// backwards are skipped; entries past the stale window are evicted.
    pub async fn put(
        &self,
        venue: VenueId,
        snapshots: &[FundingSnapshot],
        source: SourceTag,
        now: DateTime<Utc>,
    ) {
        let expires_at = now + self.ttl;
        let mut inner = self.inner.write().await;
        let mut skipped = 0usize;

        for snapshot in snapshots {
            let key = (venue, snapshot.symbol.clone());
            match inner.get(&key) {
                Some(existing) if existing.snapshot.fetched_at > snapshot.fetched_at => {
                    skipped += 1;
                }
                _ => {
                    inner.insert(
                        key,
                        CacheEntry {
                            snapshot: snapshot.clone(),
                            expires_at,
                        },
                    );
                }
            }
        }
        if skipped > 0 {
            debug!(%venue, skipped, "snapshot cache skipped non-monotonic entries");
        }

        let eviction_horizon = now - self.stale_max_age;
        inner.retain(|_, entry| entry.expires_at >= eviction_horizon);
        drop(inner);

        self.venue_sources.write().await.insert(venue, source);
    }

    /// Single-key lookup.
    pub async fn get(&self, venue: VenueId, symbol: &str, now: DateTime<Utc>) -> CacheLookup {
        let inner = self.inner.read().await;
        match inner.get(&(venue, symbol.to_string())) {
            Some(entry) if now <= entry.expires_at => CacheLookup::Fresh(entry.snapshot.clone()),
            Some(entry) if now <= entry.expires_at + self.stale_max_age => {
                CacheLookup::Stale(entry.snapshot.clone().with_source(SourceTag::Stale))
            }
            _ => CacheLookup::Miss,
        }
    }

    /// Venue-level read: fresh entries when any are within TTL, otherwise
    /// entries inside the stale window re-tagged `stale`.
    pub async fn venue_read(&self, venue: VenueId, now: DateTime<Utc>) -> VenueCacheRead {
        let inner = self.inner.read().await;
        let mut fresh = Vec::new();
        let mut stale = Vec::new();

        for ((entry_venue, _), entry) in inner.iter() {
            if *entry_venue != venue {
                continue;
            }
            if now <= entry.expires_at {
                fresh.push(entry.snapshot.clone());
            } else if now <= entry.expires_at + self.stale_max_age {
                stale.push(entry.snapshot.clone().with_source(SourceTag::Stale));
            }
        }

        if !fresh.is_empty() {
            let source = self
                .venue_sources
                .read()
                .await
                .get(&venue)
                .copied()
                .unwrap_or(SourceTag::Rest);
            fresh.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            return VenueCacheRead::Fresh(fresh, source);
        }
        if !stale.is_empty() {
            stale.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            return VenueCacheRead::Stale(stale);
        }
        VenueCacheRead::Miss
    }
}
