//! End-to-end tests for the decision engine through the public API.
//!
//! A scripted snapshot source lets each test control what the cache sees:
//! a healthy blob, a failing upstream, or a slow fetch shared by many
//! concurrent requests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rotator_backend::auction::HttpBidder;
use rotator_backend::request::RawRequest;
use rotator_backend::serving::{InMemoryDomainLists, ListMark, SnapshotCache, SnapshotSource};
use rotator_backend::telemetry::{RecordingSink, Topic};
use rotator_backend::{CacheError, DecisionEngine, EngineConfig, EngineError};

const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";

/// Serves whatever blob is currently set; `None` makes fetches fail.
struct ScriptedSource {
    blob: Mutex<Option<Vec<u8>>>,
    delay: Duration,
    fetches: AtomicU64,
}

impl ScriptedSource {
    fn new(blob: Vec<u8>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            blob: Mutex::new(Some(blob)),
            delay,
            fetches: AtomicU64::new(0),
        })
    }

    fn fail(&self) {
        *self.blob.lock() = None;
    }

    fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch(&self) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let current = self.blob.lock().clone();
        match current {
            Some(blob) => Ok(blob),
            None => bail!("upstream unavailable"),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

fn blob() -> Vec<u8> {
    let snapshot = json!({
        "ad_tags": {
            "201": {
                "id": 201,
                "url": "https://yield.example/vast?w=640",
                "supports_vast": true,
                "is_active": true,
                "is_ad_tag_pub_active": true,
                "advertiser_platform_type_id": 3,
                "targeting": {"geo_targeting": ["US"], "device_type": "desktop"},
                "publisher_id": 77,
                "publisher_targeting_id": "tid-9",
                "price": 2.0,
                "could_be_used_for_targeting": true,
                "erpr_by_targeting_id": {"tid-9": {"requests": 4000, "impressions": 300, "erpr": 1.2}}
            },
            "202": {
                "id": 202,
                "url": "https://study.example/tag",
                "is_active": true,
                "is_ad_tag_pub_active": true,
                "advertiser_platform_type_id": 3,
                "targeting": {"geo_targeting": ["O1"], "device_type": "desktop"},
                "publisher_targeting_id": "tid-9",
                "price": 1.0,
                "could_be_used_for_targeting": true,
                "domains_list_id": 4,
                "domains_list_type": "black"
            }
        },
        "publisher_targeting_id_map": {"tid-9": 77},
        "targeting_link_ad_tags_i_ds": {"tid-9": ["201", "202"]},
        "publisher_links": {
            "tid-9": {"ID": 3, "Platform": "desktop", "Price": 1.0, "Optimization": "erpr", "StudyRequests": 1000}
        }
    });
    serde_json::to_vec(&snapshot).unwrap()
}

struct Harness {
    engine: Arc<DecisionEngine>,
    source: Arc<ScriptedSource>,
    telemetry: Arc<RecordingSink>,
    lists: Arc<InMemoryDomainLists>,
}

fn harness(ttl: Duration, fetch_delay: Duration) -> Harness {
    let source = ScriptedSource::new(blob(), fetch_delay);
    let telemetry = RecordingSink::new();
    let lists = Arc::new(InMemoryDomainLists::new());
    let engine = DecisionEngine::new(
        Arc::new(SnapshotCache::with_ttl(source.clone(), ttl)),
        lists.clone(),
        Arc::new(HttpBidder::new(Duration::from_millis(300), "2.5").unwrap()),
        telemetry.clone(),
        EngineConfig::default(),
    );
    Harness {
        engine: Arc::new(engine),
        source,
        telemetry,
        lists,
    }
}

fn targeting(price: &str, country: &str) -> RawRequest {
    let pairs = [
        ("pub", "tid-9"),
        ("price", price),
        ("ua", DESKTOP_UA),
        ("url", "https://www.news.example/story"),
    ];
    RawRequest {
        query: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        geo_hint: Some(country.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_no_candidate_reports_one_empty_event() {
    let h = harness(Duration::from_secs(60), Duration::ZERO);
    let err = h.engine.decide_targeting(&targeting("9.0", "US")).await.unwrap_err();
    assert_eq!(err, EngineError::NoCandidate);

    let events = h.telemetry.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].topic, Topic::RequestsTargeting);
    assert_eq!(events[0].payload["adpid"], "");
    assert_eq!(events[0].payload["publisher_id"], 77);
    assert_eq!(events[0].payload["targeting_id"], "tid-9");
}

#[tokio::test]
async fn test_geo_fallback_when_only_geo_fails() {
    let h = harness(Duration::from_secs(60), Duration::ZERO);
    h.lists.insert(4, "news.example", ListMark::Black);

    let decision = h.engine.decide_targeting(&targeting("1.0", "DE")).await.unwrap();
    assert!(decision.geo_fallback);
    assert_eq!(decision.tags.len(), 1);
    assert_eq!(decision.tags[0].ad_tag_pub_id, "201");
    assert_eq!(decision.tags[0].publisher_id, 77);
}

#[tokio::test]
async fn test_requests_within_ttl_share_one_fetch() {
    let h = harness(Duration::from_millis(200), Duration::ZERO);
    for _ in 0..5 {
        h.engine.decide_targeting(&targeting("1.0", "US")).await.unwrap();
    }
    assert_eq!(h.source.fetches(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    h.engine.decide_targeting(&targeting("1.0", "US")).await.unwrap();
    assert_eq!(h.source.fetches(), 2);
}

#[tokio::test]
async fn test_concurrent_cold_requests_fetch_once() {
    let h = harness(Duration::from_secs(60), Duration::from_millis(50));
    let request = targeting("1.0", "US");
    let results = join_all((0..16).map(|_| h.engine.decide_targeting(&request))).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(h.source.fetches(), 1);
}

#[tokio::test]
async fn test_failed_refresh_serves_previous_snapshot() {
    let h = harness(Duration::from_millis(50), Duration::ZERO);
    h.engine.decide_targeting(&targeting("1.0", "US")).await.unwrap();

    h.source.fail();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let decision = h.engine.decide_targeting(&targeting("1.0", "US")).await.unwrap();
    assert_eq!(decision.tags.len(), 1);
    assert_eq!(h.engine.cache().refresh_failure_count(), 1);

    // Expiry is not advanced on failure: the next caller tries again.
    assert!(matches!(
        h.engine.cache().ensure_fresh().await,
        Err(CacheError::StaleData(_))
    ));
    assert_eq!(h.source.fetches(), 3);

    let metrics = h.engine.render_metrics();
    assert!(metrics.contains("rotator_snapshot_refresh_failures_total 2"));
}

#[tokio::test]
async fn test_cold_cache_failure_is_stale_data() {
    let h = harness(Duration::from_secs(60), Duration::ZERO);
    h.source.fail();

    let err = h.engine.decide_targeting(&targeting("1.0", "US")).await.unwrap_err();
    assert!(matches!(err, EngineError::StaleData(_)));
    assert!(h.telemetry.events().is_empty());
}
