//! Elimination stages and the post-filter pool rule.
//!
//! Stages run in a fixed order and skip candidates that are already
//! eliminated. Geo runs last so that a geo-only failure can be told apart
//! from every other elimination.

use std::sync::Arc;

use tracing::{debug, warn};

use super::candidate::{CandidateContext, Elimination};
use crate::request::{DeviceType, Platform, RequestContext};
use crate::serving::{domain_passes, DomainListStore, ServingSnapshot};

pub fn filter_by_price(ctx: &RequestContext, candidates: &mut [CandidateContext<'_>]) {
    let requested = ctx.requested_price();
    if ctx.uses_origin_price() || requested == 0.0 {
        return;
    }
    for candidate in candidates.iter_mut().filter(|c| !c.is_eliminated()) {
        let price = candidate.tag.price;
        if !(price > 0.0 && price >= requested) {
            candidate.eliminate(Elimination::Price);
        }
    }
}

/// Desktop links only. An undefined device type eliminates everything.
pub fn filter_by_device_type(ctx: &RequestContext, candidates: &mut [CandidateContext<'_>]) {
    if ctx.platform != Platform::Desktop {
        return;
    }
    for candidate in candidates.iter_mut().filter(|c| !c.is_eliminated()) {
        if ctx.device_type == DeviceType::Undefined
            || candidate.tag.targeting.device_type != ctx.device_type.as_str()
        {
            candidate.eliminate(Elimination::DeviceType);
        }
    }
}

/// Required parameters must be present and not left as their placeholder macro.
/// Tags whose advertiser platform has no mapping are not checked.
pub fn filter_by_required_parameters(
    snapshot: &ServingSnapshot,
    ctx: &RequestContext,
    candidates: &mut [CandidateContext<'_>],
) {
    let platform = ctx.platform.as_str();
    for candidate in candidates.iter_mut().filter(|c| !c.is_eliminated()) {
        let parameters = match snapshot.parameter_mapping(candidate.tag.advertiser_platform_type_id) {
            Ok(parameters) => parameters,
            Err(e) => {
                warn!(ad_tag_id = %candidate.ad_tag_id, error = %e, "Skipping required parameter check");
                continue;
            }
        };

        let missing = parameters
            .values()
            .filter_map(|by_platform| by_platform.get(platform))
            .filter(|mapping| mapping.is_required)
            .any(|mapping| {
                let value = ctx
                    .params
                    .get(&mapping.original_shortcut)
                    .map(String::as_str)
                    .unwrap_or("");
                value.is_empty() || value == mapping.original_macros
            });
        if missing {
            candidate.eliminate(Elimination::RequiredParameter);
        }
    }
}

pub async fn filter_by_domain_lists(
    store: &dyn DomainListStore,
    ctx: &RequestContext,
    candidates: &mut [CandidateContext<'_>],
) {
    for candidate in candidates.iter_mut().filter(|c| !c.is_eliminated()) {
        let Some(list) = candidate.tag.domain_list() else {
            continue;
        };
        if ctx.domain.is_empty() || !domain_passes(store, Some(list), &ctx.domain).await {
            candidate.eliminate(Elimination::DomainPolicy);
        }
    }
}

pub fn filter_by_geo(ctx: &RequestContext, candidates: &mut [CandidateContext<'_>]) {
    for candidate in candidates.iter_mut().filter(|c| !c.is_eliminated()) {
        if !candidate.tag.targeting.matches_country(&ctx.country) {
            candidate.eliminate(Elimination::Geo);
        }
    }
}

/// Runs every stage in order.
#[derive(Clone)]
pub struct FilterPipeline {
    domain_lists: Arc<dyn DomainListStore>,
}

impl FilterPipeline {
    pub fn new(domain_lists: Arc<dyn DomainListStore>) -> Self {
        Self { domain_lists }
    }

    pub async fn run(
        &self,
        snapshot: &ServingSnapshot,
        ctx: &RequestContext,
        candidates: &mut [CandidateContext<'_>],
    ) {
        filter_by_price(ctx, candidates);
        filter_by_device_type(ctx, candidates);
        filter_by_required_parameters(snapshot, ctx, candidates);
        filter_by_domain_lists(self.domain_lists.as_ref(), ctx, candidates).await;
        filter_by_geo(ctx, candidates);

        debug!(
            targeting_id = %ctx.publisher_targeting_id,
            total = candidates.len(),
            passed = candidates.iter().filter(|c| !c.is_eliminated()).count(),
            geo_only = candidates.iter().filter(|c| c.geo_check_failed()).count(),
            "Filter pipeline finished"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Candidates that passed every stage.
    Passed,
    /// Nothing passed; candidates that failed geo only.
    GeoFallback,
}

#[derive(Debug)]
pub struct SelectionPool<'a> {
    pub kind: PoolKind,
    pub candidates: Vec<CandidateContext<'a>>,
}

impl<'a> SelectionPool<'a> {
    /// Passed candidates if any, else geo-only failures, else `None`.
    pub fn from_filtered(candidates: Vec<CandidateContext<'a>>) -> Option<Self> {
        let (passed, rest): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|c| !c.is_eliminated());
        if !passed.is_empty() {
            return Some(Self {
                kind: PoolKind::Passed,
                candidates: passed,
            });
        }
        let geo_only: Vec<_> = rest.into_iter().filter(|c| c.geo_check_failed()).collect();
        (!geo_only.is_empty()).then(|| Self {
            kind: PoolKind::GeoFallback,
            candidates: geo_only,
        })
    }
}
