//! Time-boxed snapshot cache.
//!
//! Readers share the current snapshot through an `Arc`. A refresh takes the
//! write half of the lock for the whole fetch and parse, so a reader never
//! observes a half-built snapshot. After acquiring the write half the refresher
//! re-checks expiry, which lets callers queued behind a successful refresh
//! reuse its result instead of fetching again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::data::{AdTagConfig, AdvertiserConfig, ParameterMapping, PlatformParameters, PublisherLinkConfig, ServingSnapshot};
use super::source::SnapshotSource;
use crate::error::CacheError;

pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct CacheState {
    snapshot: Option<Arc<ServingSnapshot>>,
    expires_at: Option<Instant>,
}

impl CacheState {
    fn fresh(&self, now: Instant) -> Option<Arc<ServingSnapshot>> {
        match (&self.snapshot, self.expires_at) {
            (Some(snapshot), Some(expires_at)) if now < expires_at => Some(snapshot.clone()),
            _ => None,
        }
    }
}

pub struct SnapshotCache {
    source: Arc<dyn SnapshotSource>,
    ttl: Duration,
    state: RwLock<CacheState>,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
}

impl SnapshotCache {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self::with_ttl(source, DEFAULT_SNAPSHOT_TTL)
    }

    pub fn with_ttl(source: Arc<dyn SnapshotSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            state: RwLock::new(CacheState::default()),
            refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
        }
    }

    /// Refreshes if expired or never loaded.
    ///
    /// Fails with `StaleData` when the refresh fails, even if an older snapshot
    /// is still held. Expiry is not advanced on failure, so the next call
    /// fetches again.
    pub async fn ensure_fresh(&self) -> Result<(), CacheError> {
        self.fresh_snapshot().await.map(|_| ())
    }

    /// The snapshot to serve from.
    ///
    /// When a refresh fails the previous snapshot is served; only a cache that
    /// has never loaded fails here.
    pub async fn snapshot(&self) -> Result<Arc<ServingSnapshot>, CacheError> {
        match self.fresh_snapshot().await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                let state = self.state.read().await;
                match &state.snapshot {
                    Some(stale) => {
                        warn!(error = %err, "Serving stale snapshot");
                        Ok(stale.clone())
                    }
                    None => Err(err),
                }
            }
        }
    }

    async fn fresh_snapshot(&self) -> Result<Arc<ServingSnapshot>, CacheError> {
        {
            let state = self.state.read().await;
            if let Some(snapshot) = state.fresh(Instant::now()) {
                return Ok(snapshot);
            }
        }

        let mut state = self.state.write().await;
        if let Some(snapshot) = state.fresh(Instant::now()) {
            debug!("Snapshot refreshed by another caller");
            return Ok(snapshot);
        }

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let loaded = match self.source.fetch().await {
            Ok(raw) => ServingSnapshot::from_json(&raw),
            Err(e) => Err(e),
        };

        match loaded {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                info!(
                    source = %self.source.describe(),
                    ad_tags = snapshot.ad_tags.len(),
                    advertisers = snapshot.advertisers.len(),
                    "Serving snapshot loaded"
                );
                state.snapshot = Some(snapshot.clone());
                state.expires_at = Some(Instant::now() + self.ttl);
                Ok(snapshot)
            }
            Err(e) => {
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                warn!(source = %self.source.describe(), error = %format!("{:#}", e), "Snapshot refresh failed");
                Err(CacheError::StaleData(format!("{:#}", e)))
            }
        }
    }

    /// Number of fetch attempts so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn refresh_failure_count(&self) -> u64 {
        self.refresh_failures.load(Ordering::Relaxed)
    }

    pub async fn ad_tag_by_id(&self, id: &str) -> Result<AdTagConfig, CacheError> {
        let snapshot = self.snapshot().await?;
        snapshot.ad_tag(id).cloned()
    }

    pub async fn all_ad_tags(&self) -> Result<BTreeMap<String, AdTagConfig>, CacheError> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.ad_tags.clone())
    }

    pub async fn ad_tags_by_ids(&self, ids: &[String]) -> Result<BTreeMap<String, AdTagConfig>, CacheError> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot
            .ad_tags_by_ids(ids)
            .map(|(id, tag)| (id.clone(), tag.clone()))
            .collect())
    }

    pub async fn parameter_mapping(&self, advertiser_platform_id: u64) -> Result<PlatformParameters, CacheError> {
        let snapshot = self.snapshot().await?;
        snapshot.parameter_mapping(advertiser_platform_id).cloned()
    }

    pub async fn our_platform_parameter_mapping(
        &self,
        name: &str,
        advertiser_platform_id: u64,
        platform: &str,
    ) -> Result<ParameterMapping, CacheError> {
        let snapshot = self.snapshot().await?;
        snapshot
            .our_platform_parameter_mapping(name, advertiser_platform_id, platform)
            .cloned()
    }

    pub async fn publisher_id_by_targeting_id(&self, targeting_id: &str) -> Result<u64, CacheError> {
        let snapshot = self.snapshot().await?;
        snapshot.publisher_id_by_targeting_id(targeting_id)
    }

    pub async fn ad_tag_ids_for_link(&self, link_id: &str) -> Result<Vec<String>, CacheError> {
        let snapshot = self.snapshot().await?;
        snapshot.ad_tag_ids_for_link(link_id).map(<[String]>::to_vec)
    }

    pub async fn link_by_id(&self, link_id: &str) -> Result<PublisherLinkConfig, CacheError> {
        let snapshot = self.snapshot().await?;
        snapshot.link(link_id).cloned()
    }

    /// Bidders in ascending advertiser id order.
    pub async fn advertisers(&self) -> Result<Vec<AdvertiserConfig>, CacheError> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.advertisers().cloned().collect())
    }
}
