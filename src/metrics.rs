//! Prometheus metrics for the decision engine

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::auction::BidStatus;
use crate::error::EngineError;

/// Simple histogram for latency measurements
#[derive(Debug)]
pub struct LatencyHistogram {
    /// Bucket boundaries in microseconds
    buckets: Vec<u64>,
    /// Counts per bucket
    counts: Vec<AtomicU64>,
    /// Sum of all observations (microseconds)
    sum: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        // 100us .. 1s, with extra resolution around the 300ms bid deadline
        let buckets = vec![
            100, 500, 1_000, 5_000, 10_000, 25_000, 50_000, 100_000, 200_000, 250_000, 300_000, 350_000, 500_000,
            1_000_000,
        ];
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a latency observation in microseconds
    pub fn record(&self, value_us: u64) {
        if let Some(i) = self.buckets.iter().position(|&boundary| value_us <= boundary) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }

        self.sum.fetch_add(value_us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duration(&self, elapsed: Duration) {
        self.record(elapsed.as_micros() as u64);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Export as Prometheus histogram format
    pub fn to_prometheus(&self, name: &str, labels: &str) -> String {
        let mut output = String::new();
        let mut cumulative = 0u64;
        let sep = if labels.is_empty() { "" } else { "," };

        for (i, &boundary) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            output.push_str(&format!(
                "{}_bucket{{{}{}le=\"{}\"}} {}\n",
                name,
                labels,
                sep,
                boundary as f64 / 1_000_000.0,
                cumulative
            ));
        }

        let total = self.count.load(Ordering::Relaxed);
        output.push_str(&format!("{}_bucket{{{}{}le=\"+Inf\"}} {}\n", name, labels, sep, total));
        output.push_str(&format!(
            "{}_sum{{{}}} {}\n",
            name,
            labels,
            self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        output.push_str(&format!("{}_count{{{}}} {}\n", name, labels, total));

        output
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters owned by other components, sampled at render time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalCounters {
    pub snapshot_refreshes: u64,
    pub snapshot_refresh_failures: u64,
    pub telemetry_dropped: u64,
}

/// Decision engine metrics registry
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Requests per decision path
    requests: RwLock<BTreeMap<&'static str, AtomicU64>>,
    /// Outcomes per path and result (filled, no_fill, rejected, error)
    outcomes: RwLock<BTreeMap<(&'static str, &'static str), AtomicU64>>,
    bids_timeout: AtomicU64,
    bids_empty: AtomicU64,
    bids_malformed: AtomicU64,
    bids_valid: AtomicU64,
    auctions_settled: AtomicU64,
    auctions_empty: AtomicU64,
    /// Served tags whose advertiser platform has no parameter mapping
    unmapped_platforms: AtomicU64,
    bid_latency: LatencyHistogram,
    decision_latency: LatencyHistogram,
}

fn bump<K: Ord>(map: &RwLock<BTreeMap<K, AtomicU64>>, key: K) {
    if let Some(counter) = map.read().get(&key) {
        counter.fetch_add(1, Ordering::Relaxed);
        return;
    }
    map.write()
        .entry(key)
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, path: &'static str) {
        bump(&self.requests, path);
    }

    /// Records how a decision ended and how long it took.
    pub fn record_decision(&self, path: &'static str, result: Result<(), &EngineError>, elapsed: Duration) {
        let label = match result {
            Ok(()) => "filled",
            Err(EngineError::NoCandidate) | Err(EngineError::NotFound(_)) => "no_fill",
            Err(EngineError::Rejected(_)) | Err(EngineError::PriceParse { .. }) => "rejected",
            Err(_) => "error",
        };
        bump(&self.outcomes, (path, label));
        self.decision_latency.record_duration(elapsed);
    }

    pub fn record_bid(&self, status: BidStatus, elapsed: Duration) {
        let counter = match status {
            BidStatus::Timeout => &self.bids_timeout,
            BidStatus::Empty => &self.bids_empty,
            BidStatus::Malformed => &self.bids_malformed,
            BidStatus::Valid => &self.bids_valid,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bid_latency.record_duration(elapsed);
    }

    pub fn record_auction(&self, settled: bool) {
        if settled {
            self.auctions_settled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.auctions_empty.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_unmapped_platform(&self) {
        self.unmapped_platforms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unmapped_platforms(&self) -> u64 {
        self.unmapped_platforms.load(Ordering::Relaxed)
    }

    pub fn requests(&self, path: &str) -> u64 {
        self.requests
            .read()
            .get(path)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn outcomes(&self, path: &str, result: &str) -> u64 {
        self.outcomes
            .read()
            .iter()
            .filter(|((p, r), _)| *p == path && *r == result)
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn bid_latency(&self) -> &LatencyHistogram {
        &self.bid_latency
    }

    /// Export all metrics in Prometheus format
    pub fn to_prometheus(&self, external: ExternalCounters) -> String {
        let mut output = String::new();

        output.push_str("# HELP rotator_requests_total Requests per decision path\n");
        output.push_str("# TYPE rotator_requests_total counter\n");
        for (path, count) in self.requests.read().iter() {
            output.push_str(&format!(
                "rotator_requests_total{{path=\"{}\"}} {}\n",
                path,
                count.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP rotator_decisions_total Decision results per path\n");
        output.push_str("# TYPE rotator_decisions_total counter\n");
        for ((path, result), count) in self.outcomes.read().iter() {
            output.push_str(&format!(
                "rotator_decisions_total{{path=\"{}\",result=\"{}\"}} {}\n",
                path,
                result,
                count.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP rotator_bids_total Bid outcomes by classification\n");
        output.push_str("# TYPE rotator_bids_total counter\n");
        for (status, counter) in [
            (BidStatus::Timeout, &self.bids_timeout),
            (BidStatus::Empty, &self.bids_empty),
            (BidStatus::Malformed, &self.bids_malformed),
            (BidStatus::Valid, &self.bids_valid),
        ] {
            output.push_str(&format!(
                "rotator_bids_total{{status=\"{}\"}} {}\n",
                status.as_str(),
                counter.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP rotator_auctions_total Auctions by result\n");
        output.push_str("# TYPE rotator_auctions_total counter\n");
        output.push_str(&format!(
            "rotator_auctions_total{{result=\"settled\"}} {}\n",
            self.auctions_settled.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "rotator_auctions_total{{result=\"empty\"}} {}\n",
            self.auctions_empty.load(Ordering::Relaxed)
        ));

        output.push_str("\n# HELP rotator_unmapped_platform_total Tags served without a parameter mapping\n");
        output.push_str("# TYPE rotator_unmapped_platform_total counter\n");
        output.push_str(&format!(
            "rotator_unmapped_platform_total {}\n",
            self.unmapped_platforms.load(Ordering::Relaxed)
        ));

        output.push_str("\n# HELP rotator_bid_latency_seconds Bidder response time\n");
        output.push_str("# TYPE rotator_bid_latency_seconds histogram\n");
        output.push_str(&self.bid_latency.to_prometheus("rotator_bid_latency_seconds", ""));

        output.push_str("\n# HELP rotator_decision_latency_seconds Time to decide a request\n");
        output.push_str("# TYPE rotator_decision_latency_seconds histogram\n");
        output.push_str(&self.decision_latency.to_prometheus("rotator_decision_latency_seconds", ""));

        output.push_str("\n# HELP rotator_snapshot_refreshes_total Snapshot fetch attempts\n");
        output.push_str("# TYPE rotator_snapshot_refreshes_total counter\n");
        output.push_str(&format!("rotator_snapshot_refreshes_total {}\n", external.snapshot_refreshes));

        output.push_str("\n# HELP rotator_snapshot_refresh_failures_total Failed snapshot fetches\n");
        output.push_str("# TYPE rotator_snapshot_refresh_failures_total counter\n");
        output.push_str(&format!(
            "rotator_snapshot_refresh_failures_total {}\n",
            external.snapshot_refresh_failures
        ));

        output.push_str("\n# HELP rotator_telemetry_dropped_total Telemetry events dropped on a full queue\n");
        output.push_str("# TYPE rotator_telemetry_dropped_total counter\n");
        output.push_str(&format!("rotator_telemetry_dropped_total {}\n", external.telemetry_dropped));

        output
    }
}
