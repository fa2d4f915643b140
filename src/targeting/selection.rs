//! Yield-weighted selection with a study period for under-sampled tags.
//!
//! Candidates whose yield for the targeting id is still zero and that have
//! seen no more than the link's study threshold of requests are in study.
//! While any candidate is in study, one of them is picked uniformly. Otherwise
//! the pick is proportional to the yield metric.
//!
//! Weight intervals are built in ascending ad-tag id order, so a seeded RNG
//! always reproduces the same pick.

use rand::Rng;

use super::candidate::CandidateContext;
use super::filters::{PoolKind, SelectionPool};

/// Study threshold used when no publisher link is known.
pub const DEFAULT_STUDY_REQUESTS: i64 = 1000;

/// Tags returned for a VPAID multi-ad response.
pub const DEFAULT_MULTI_PICK: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationStrategy {
    /// Estimated revenue per request.
    Erpr,
    FillRate,
    /// Fill rate on the request domain when known, else the global fill rate.
    DomainFillRate,
}

impl OptimizationStrategy {
    /// Link setting. Anything unrecognised selects domain fill rate.
    pub fn from_link(raw: &str) -> Self {
        match raw {
            "erpr" => OptimizationStrategy::Erpr,
            "fill_rate" => OptimizationStrategy::FillRate,
            _ => OptimizationStrategy::DomainFillRate,
        }
    }

    /// Metric deciding study vs exploit, and the weight used when exploiting.
    fn metric_and_weight(&self, candidate: &CandidateContext<'_>, targeting_id: &str, domain: &str) -> (f64, f64) {
        let stats = candidate.tag.stats_for(targeting_id);
        match self {
            OptimizationStrategy::Erpr => (stats.erpr, stats.erpr),
            OptimizationStrategy::FillRate => (stats.fill_rate, stats.fill_rate),
            OptimizationStrategy::DomainFillRate => {
                let weight = candidate
                    .tag
                    .domain_fill_rate(targeting_id, domain)
                    .unwrap_or(stats.fill_rate);
                (stats.fill_rate, weight)
            }
        }
    }
}

/// Selection inputs that come from the request and its publisher link.
#[derive(Debug, Clone, Copy)]
pub struct SelectionParams<'r> {
    pub strategy: OptimizationStrategy,
    pub targeting_id: &'r str,
    pub domain: &'r str,
    pub study_requests: i64,
}

struct Partition<'a> {
    study: Vec<CandidateContext<'a>>,
    exploit: Vec<CandidateContext<'a>>,
}

fn sort_by_id(candidates: &mut [CandidateContext<'_>]) {
    candidates.sort_by(|a, b| {
        a.tag
            .ad_tag_id
            .cmp(&b.tag.ad_tag_id)
            .then_with(|| a.ad_tag_id.cmp(b.ad_tag_id))
    });
}

/// Splits the pool. Candidates with no yield and too many requests are in neither half.
fn partition<'a>(mut candidates: Vec<CandidateContext<'a>>, params: &SelectionParams<'_>) -> Partition<'a> {
    sort_by_id(&mut candidates);
    let mut study = Vec::new();
    let mut exploit = Vec::new();
    for mut candidate in candidates {
        let (metric, weight) = params
            .strategy
            .metric_and_weight(&candidate, params.targeting_id, params.domain);
        let requests = candidate.tag.stats_for(params.targeting_id).requests;
        if metric > 0.0 {
            candidate.yield_value = weight;
            exploit.push(candidate);
        } else if requests <= params.study_requests {
            candidate.study_left = params.study_requests - requests;
            study.push(candidate);
        }
    }
    Partition { study, exploit }
}

fn pick_uniform<'a, R: Rng + ?Sized>(mut candidates: Vec<CandidateContext<'a>>, rng: &mut R) -> Option<CandidateContext<'a>> {
    if candidates.is_empty() {
        return None;
    }
    let index = rng.gen_range(0..candidates.len());
    Some(candidates.swap_remove(index))
}

/// Interval width for one candidate. Negative and non-finite yields count as zero.
fn interval_weight(candidate: &CandidateContext<'_>) -> f64 {
    if candidate.yield_value.is_finite() {
        candidate.yield_value.max(0.0)
    } else {
        0.0
    }
}

/// Draws from cumulative intervals of `yield_value`. Falls back to a uniform
/// pick when the weights sum to zero or overflow.
fn pick_weighted<'a, R: Rng + ?Sized>(candidates: Vec<CandidateContext<'a>>, rng: &mut R) -> Option<CandidateContext<'a>> {
    let total: f64 = candidates.iter().map(interval_weight).sum();
    if !(total > 0.0 && total.is_finite()) {
        return pick_uniform(candidates, rng);
    }
    let draw = rng.gen_range(0.0..total);
    let mut upper = 0.0;
    let mut chosen = candidates.len() - 1;
    for (index, candidate) in candidates.iter().enumerate() {
        upper += interval_weight(candidate);
        if draw < upper {
            chosen = index;
            break;
        }
    }
    candidates.into_iter().nth(chosen)
}

/// Single pick for a VAST response.
pub fn select_one<'a, R: Rng + ?Sized>(
    pool: SelectionPool<'a>,
    params: &SelectionParams<'_>,
    rng: &mut R,
) -> Option<CandidateContext<'a>> {
    match pool.kind {
        PoolKind::GeoFallback => {
            let mut candidates = pool.candidates;
            sort_by_id(&mut candidates);
            pick_uniform(candidates, rng)
        }
        PoolKind::Passed => {
            let Partition { study, exploit } = partition(pool.candidates, params);
            if !study.is_empty() {
                pick_uniform(study, rng)
            } else {
                pick_weighted(exploit, rng)
            }
        }
    }
}

/// Up to `count` picks for a VPAID response, alternating best exploit and most
/// under-sampled study candidate.
pub fn select_many<'a>(pool: SelectionPool<'a>, params: &SelectionParams<'_>, count: usize) -> Vec<CandidateContext<'a>> {
    if pool.kind == PoolKind::GeoFallback {
        let mut candidates = pool.candidates;
        sort_by_id(&mut candidates);
        candidates.truncate(count);
        return candidates;
    }

    let Partition { mut study, mut exploit } = partition(pool.candidates, params);
    // Stable sorts keep ascending id order among equals.
    exploit.sort_by(|a, b| b.yield_value.total_cmp(&a.yield_value));
    study.sort_by(|a, b| b.study_left.cmp(&a.study_left));

    let mut picks = Vec::with_capacity(count.min(exploit.len() + study.len()));
    let mut exploit = exploit.into_iter();
    let mut study = study.into_iter();
    while picks.len() < count {
        let mut progressed = false;
        if let Some(candidate) = exploit.next() {
            picks.push(candidate);
            progressed = true;
        }
        if picks.len() < count {
            if let Some(candidate) = study.next() {
                picks.push(candidate);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    picks
}
