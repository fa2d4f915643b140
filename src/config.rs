//! Engine configuration loaded from the environment

use std::time::Duration;

use crate::auction::{AuctionConfig, DEFAULT_BID_TIMEOUT, DEFAULT_FLOOR_MARGIN, DEFAULT_OPENRTB_VERSION};
use crate::serving::DEFAULT_SNAPSHOT_TTL;
use crate::targeting::DEFAULT_MULTI_PICK;
use crate::telemetry::DEFAULT_QUEUE_CAPACITY;

/// Domain list consulted before candidate building on the v2 and RTB paths.
pub const DEFAULT_BLACKLIST_ID: u64 = 12;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub snapshot_ttl: Duration,
    pub bid_timeout: Duration,
    pub floor_margin: f64,
    /// Ad tags returned for a VPAID response.
    pub multi_pick: usize,
    pub default_blacklist_id: u64,
    pub telemetry_queue_capacity: usize,
    pub openrtb_version: String,
    /// Header carrying the country code set by the edge proxy.
    pub geo_header: String,
    /// Public host of this service. Accepted RTB sessions point the player at
    /// the auction endpoint on it.
    pub rotator_domain: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl: DEFAULT_SNAPSHOT_TTL,
            bid_timeout: DEFAULT_BID_TIMEOUT,
            floor_margin: DEFAULT_FLOOR_MARGIN,
            multi_pick: DEFAULT_MULTI_PICK,
            default_blacklist_id: DEFAULT_BLACKLIST_ID,
            telemetry_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            openrtb_version: DEFAULT_OPENRTB_VERSION.to_string(),
            geo_header: "cf-ipcountry".to_string(),
            rotator_domain: None,
        }
    }
}

impl EngineConfig {
    /// Load from environment variables (and `.env`), falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            snapshot_ttl: parsed("ROTATOR_SNAPSHOT_TTL_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.snapshot_ttl),
            bid_timeout: parsed("ROTATOR_BID_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.bid_timeout),
            floor_margin: parsed("ROTATOR_FLOOR_MARGIN")
                .and_then(|v| v.parse().ok())
                .filter(|m: &f64| m.is_finite() && *m >= 0.0)
                .unwrap_or(defaults.floor_margin),
            multi_pick: parsed("ROTATOR_MULTI_PICK")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.multi_pick),
            default_blacklist_id: parsed("ROTATOR_DEFAULT_BLACKLIST_ID")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_blacklist_id),
            telemetry_queue_capacity: parsed("ROTATOR_TELEMETRY_QUEUE")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.telemetry_queue_capacity),
            openrtb_version: parsed("ROTATOR_OPENRTB_VERSION").unwrap_or(defaults.openrtb_version),
            geo_header: parsed("ROTATOR_GEO_HEADER")
                .map(|h| h.to_ascii_lowercase())
                .unwrap_or(defaults.geo_header),
            rotator_domain: parsed("ROTATOR_DOMAIN"),
        }
    }

    pub fn auction(&self) -> AuctionConfig {
        AuctionConfig {
            floor_margin: self.floor_margin,
            bid_timeout: self.bid_timeout,
        }
    }
}
