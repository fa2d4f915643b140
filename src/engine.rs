//! Decision paths.
//!
//! Each path reads the snapshot once, so a refresh in the middle of a request
//! cannot mix two configurations. Every failure comes back as an
//! [`EngineError`]; the HTTP layer turns all of them into an empty response.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Serialize;
use tracing::{debug, warn};

use crate::auction::{AuctionOrchestrator, BidderTransport, WinningBid};
use crate::config::EngineConfig;
use crate::error::{EngineError, RejectReason};
use crate::metrics::{EngineMetrics, ExternalCounters};
use crate::request::{
    resolve_ip, resolve_page, HeaderGeoLookup, KeywordDeviceClassifier, Platform, RawRequest, RequestContext,
    RequestKind, RequestParser, ResponseFormat,
};
use crate::serving::data::PlatformParameters;
use crate::serving::{domain_passes, DomainListStore, ListMark, PublisherLinkConfig, ServingSnapshot, SnapshotCache};
use crate::targeting::{
    map_destination_url, merge_request_query, select_many, select_one, CandidateContext, CandidateSet,
    FilterPipeline, OptimizationStrategy, PoolKind, SelectionParams, SelectionPool, DEFAULT_STUDY_REQUESTS,
};
use crate::telemetry::{emit_message, RequestMessage, RtbBidMessage, RtbEvent, RtbEventMessage, TelemetrySink, Topic};

/// Where the player sends the auction request after a session is accepted.
pub const BIDDER_PROCESSOR_PATH: &str = "/rotator/target/bidder_processor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionPath {
    Direct,
    Targeting,
    TargetingV2,
    BidderInit,
    BidderProcessor,
}

impl DecisionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionPath::Direct => "direct",
            DecisionPath::Targeting => "targeting",
            DecisionPath::TargetingV2 => "targeting_v2",
            DecisionPath::BidderInit => "bidder_init",
            DecisionPath::BidderProcessor => "bidder_processor",
        }
    }
}

/// An ad tag picked for serving, with its destination already rewritten.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectedTag {
    /// Snapshot key of the tag, reported as `adpid`.
    pub ad_tag_pub_id: String,
    pub ad_tag_id: u64,
    pub destination_url: String,
    pub price: f64,
    pub supports_vast: bool,
    pub publisher_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectDecision {
    /// Wrap the destination in a VAST document.
    VastWrapper(SelectedTag),
    Redirect(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetingDecision {
    pub request_id: String,
    pub response_format: &'static str,
    pub vast_version: u8,
    /// Picked only because nothing passed geo targeting.
    pub geo_fallback: bool,
    pub tags: Vec<SelectedTag>,
}

/// Accepted RTB session, answered with the player bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RtbSession {
    pub request_id: String,
    pub publisher_id: u64,
    pub targeting_id: String,
    pub platform: &'static str,
    pub price: f64,
    /// Auction URL on the public rotator host, carrying the session's query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuctionDecision {
    pub request_id: String,
    pub bid_floor: f64,
    pub winner: WinningBid,
}

struct Selection {
    tags: Vec<SelectedTag>,
    geo_fallback: bool,
}

pub struct DecisionEngine {
    cache: Arc<SnapshotCache>,
    domain_lists: Arc<dyn DomainListStore>,
    pipeline: FilterPipeline,
    auction: AuctionOrchestrator,
    telemetry: Arc<dyn TelemetrySink>,
    metrics: Arc<EngineMetrics>,
    parser: RequestParser<HeaderGeoLookup, KeywordDeviceClassifier>,
    config: EngineConfig,
}

impl DecisionEngine {
    pub fn new(
        cache: Arc<SnapshotCache>,
        domain_lists: Arc<dyn DomainListStore>,
        bidders: Arc<dyn BidderTransport>,
        telemetry: Arc<dyn TelemetrySink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            cache,
            pipeline: FilterPipeline::new(domain_lists.clone()),
            domain_lists,
            auction: AuctionOrchestrator::new(bidders, config.auction()),
            telemetry,
            metrics: Arc::new(EngineMetrics::new()),
            parser: RequestParser::default(),
            config,
        }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn render_metrics(&self) -> String {
        self.metrics.to_prometheus(ExternalCounters {
            snapshot_refreshes: self.cache.refresh_count(),
            snapshot_refresh_failures: self.cache.refresh_failure_count(),
            telemetry_dropped: self.telemetry.dropped(),
        })
    }

    /// `/rotator?adtagpubid=`: one configured tag, no targeting.
    pub async fn decide_direct(&self, raw: &RawRequest) -> Result<DirectDecision, EngineError> {
        self.observe(DecisionPath::Direct, self.direct(raw)).await
    }

    /// Publisher link targeting.
    pub async fn decide_targeting(&self, raw: &RawRequest) -> Result<TargetingDecision, EngineError> {
        self.observe(DecisionPath::TargetingV2, self.targeting_v2(raw)).await
    }

    /// Legacy matching over every tag of the publisher.
    pub async fn decide_targeting_global(&self, raw: &RawRequest) -> Result<TargetingDecision, EngineError> {
        self.observe(DecisionPath::Targeting, self.targeting_global(raw)).await
    }

    pub async fn rtb_init(&self, raw: &RawRequest) -> Result<RtbSession, EngineError> {
        self.observe(DecisionPath::BidderInit, self.bidder_init(raw)).await
    }

    pub async fn run_auction(&self, raw: &RawRequest) -> Result<AuctionDecision, EngineError> {
        self.observe(DecisionPath::BidderProcessor, self.bidder_processor(raw)).await
    }

    async fn observe<T, F>(&self, path: DecisionPath, decision: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        let started = Instant::now();
        self.metrics.record_request(path.as_str());
        let result = decision.await;
        self.metrics
            .record_decision(path.as_str(), result.as_ref().map(|_| ()), started.elapsed());

        if let Err(e) = &result {
            if e.is_expected() {
                debug!(path = path.as_str(), reason = %e, "No content");
            } else {
                warn!(path = path.as_str(), error = %e, "Request failed");
            }
        }
        result
    }

    async fn direct(&self, raw: &RawRequest) -> Result<DirectDecision, EngineError> {
        let timestamp = Utc::now();
        let ad_tag_pub_id = raw.param("adtagpubid");
        if ad_tag_pub_id.is_empty() {
            return Err(EngineError::Rejected(RejectReason::MissingAdTagId));
        }

        let snapshot = self.cache.snapshot().await?;
        let tag = snapshot.ad_tag(ad_tag_pub_id)?;
        if !tag.is_serving() && !tag.is_test {
            return Err(EngineError::Rejected(RejectReason::NotActive));
        }

        let mut ctx = RequestContext::new("");
        ctx.kind = RequestKind::Direct;
        ctx.publisher_id = Some(tag.publisher_id);

        // Advertiser platforms name ip/ua/url differently; resolve through our mapping.
        let shortcut = |name: &str| {
            snapshot
                .our_platform_parameter_mapping(name, tag.advertiser_platform_type_id, Platform::Desktop.as_str())
                .ok()
                .map(|mapping| mapping.shortcut.clone())
        };
        if let Some(key) = shortcut("ip") {
            ctx.ip = resolve_ip(raw.param(&key), raw);
        }
        if let Some(key) = shortcut("ua") {
            ctx.user_agent = raw.param(&key).to_string();
        }
        if let Some(key) = shortcut("url") {
            if let Some((referrer, domain)) = resolve_page(raw.param(&key), raw.referer.as_deref()) {
                ctx.referrer = referrer;
                ctx.domain = domain;
            }
        }
        let (country, device_type) = self.parser.classify(ctx.ip, &ctx.user_agent, raw);
        ctx.country = country;
        ctx.device_type = device_type;
        ctx.params = raw.query.clone();

        let destination_url = merge_request_query(&tag.url, &raw.query)?;
        emit_message(
            self.telemetry.as_ref(),
            Topic::Requests,
            &RequestMessage::direct(&ctx, ad_tag_pub_id, timestamp),
        );

        if tag.supports_vast {
            Ok(DirectDecision::VastWrapper(SelectedTag {
                ad_tag_pub_id: ad_tag_pub_id.to_string(),
                ad_tag_id: tag.ad_tag_id,
                destination_url,
                price: tag.price,
                supports_vast: true,
                publisher_id: tag.publisher_id,
            }))
        } else {
            Ok(DirectDecision::Redirect(destination_url))
        }
    }

    async fn targeting_v2(&self, raw: &RawRequest) -> Result<TargetingDecision, EngineError> {
        let timestamp = Utc::now();
        let mut ctx = self.parser.parse(raw)?;
        let snapshot = self.cache.snapshot().await?;

        let link = resolve_link(&snapshot, &mut ctx)?;
        ctx.apply_price_fallback(link.price)?;
        self.check_domain_policy(link, &ctx).await?;
        ctx.publisher_id = snapshot.publisher_id_by_targeting_id(&ctx.publisher_targeting_id).ok();

        let candidates = CandidateSet::for_link(&snapshot, &ctx.publisher_targeting_id)?;
        let params = SelectionParams {
            strategy: OptimizationStrategy::from_link(&link.optimization),
            targeting_id: &ctx.publisher_targeting_id,
            domain: &ctx.domain,
            study_requests: link.study_requests,
        };
        let selection = self.filter_and_select(&snapshot, &ctx, candidates, &params).await;
        self.report_targeting(&ctx, selection, timestamp)
    }

    async fn targeting_global(&self, raw: &RawRequest) -> Result<TargetingDecision, EngineError> {
        let timestamp = Utc::now();
        let mut ctx = self.parser.parse(raw)?;
        let snapshot = self.cache.snapshot().await?;

        // Without a link the device check still applies, as it always did here.
        let link = snapshot.link(&ctx.publisher_targeting_id).ok();
        ctx.set_platform(link.map_or(Platform::Desktop, |l| Platform::parse(&l.platform)));
        if let Some(link) = link {
            ctx.apply_price_fallback(link.price)?;
        }
        ctx.publisher_id = snapshot.publisher_id_by_targeting_id(&ctx.publisher_targeting_id).ok();

        let candidates = CandidateSet::for_publisher(&snapshot, &ctx.publisher_targeting_id);
        let params = SelectionParams {
            strategy: OptimizationStrategy::Erpr,
            targeting_id: &ctx.publisher_targeting_id,
            domain: &ctx.domain,
            study_requests: link
                .map(|l| l.study_requests)
                .filter(|threshold| *threshold > 0)
                .unwrap_or(DEFAULT_STUDY_REQUESTS),
        };
        let selection = self.filter_and_select(&snapshot, &ctx, candidates, &params).await;
        self.report_targeting(&ctx, selection, timestamp)
    }

    async fn bidder_init(&self, raw: &RawRequest) -> Result<RtbSession, EngineError> {
        let timestamp = Utc::now();
        let mut ctx = match self.parser.parse(raw) {
            Ok(ctx) => ctx,
            Err(e) => {
                let bare = RequestContext::new(raw.param("pub"));
                self.emit_rtb_event(&bare, RtbEvent::InitError, timestamp);
                return Err(e);
            }
        };

        match self.admit_rtb(&mut ctx).await {
            Ok(()) => {
                self.emit_rtb_event(&ctx, RtbEvent::Init, timestamp);
                Ok(RtbSession {
                    request_id: ctx.request_id.to_string(),
                    publisher_id: ctx.publisher_id.unwrap_or_default(),
                    targeting_id: ctx.publisher_targeting_id.clone(),
                    platform: ctx.platform.as_str(),
                    price: ctx.requested_price(),
                    processor_url: self.processor_url(raw),
                })
            }
            Err(e) => {
                self.emit_rtb_event(&ctx, RtbEvent::InitError, timestamp);
                Err(e)
            }
        }
    }

    /// `None` without a configured rotator domain.
    fn processor_url(&self, raw: &RawRequest) -> Option<String> {
        let domain = self.config.rotator_domain.as_deref()?;
        let mut url = match Url::parse(&format!("https://{}{}", domain, BIDDER_PROCESSOR_PATH)) {
            Ok(url) => url,
            Err(e) => {
                warn!(domain, error = %e, "Rotator domain does not form a URL");
                return None;
            }
        };
        let query: BTreeMap<&str, &str> = raw.query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Some(url.to_string())
    }

    /// Link, publisher and domain checks for a new RTB session.
    async fn admit_rtb(&self, ctx: &mut RequestContext) -> Result<(), EngineError> {
        let snapshot = self.cache.snapshot().await?;
        let link = resolve_link(&snapshot, ctx)?;
        ctx.publisher_id = Some(snapshot.publisher_id_by_targeting_id(&ctx.publisher_targeting_id)?);
        self.check_domain_policy(link, ctx).await
    }

    async fn bidder_processor(&self, raw: &RawRequest) -> Result<AuctionDecision, EngineError> {
        let timestamp = Utc::now();
        let mut ctx = self.parser.parse(raw)?;
        let snapshot = self.cache.snapshot().await?;
        resolve_link(&snapshot, &mut ctx)?;
        match snapshot.publisher_id_by_targeting_id(&ctx.publisher_targeting_id) {
            Ok(publisher_id) => ctx.publisher_id = Some(publisher_id),
            Err(e) => {
                self.emit_rtb_event(&ctx, RtbEvent::InitError, timestamp);
                return Err(e.into());
            }
        }
        self.emit_rtb_event(&ctx, RtbEvent::Auction, timestamp);

        let advertisers: Vec<_> = snapshot.advertisers().cloned().collect();
        let result = self.auction.run(&ctx, &advertisers).await?;

        for outcome in &result.outcomes {
            self.metrics.record_bid(outcome.status, outcome.elapsed);
            emit_message(
                self.telemetry.as_ref(),
                Topic::RtbBidRequests,
                &RtbBidMessage::new(&ctx, outcome, timestamp),
            );
        }
        self.metrics.record_auction(result.winner.is_some());

        let winner = result.winner.ok_or(EngineError::NoCandidate)?;
        Ok(AuctionDecision {
            request_id: ctx.request_id.to_string(),
            bid_floor: result.bid_floor,
            winner,
        })
    }

    /// Default black list first, then the link's own list.
    async fn check_domain_policy(&self, link: &PublisherLinkConfig, ctx: &RequestContext) -> Result<(), EngineError> {
        let global = self
            .domain_lists
            .lookup(self.config.default_blacklist_id, &ctx.domain)
            .await;
        if global == Some(ListMark::Black) {
            return Err(EngineError::Rejected(RejectReason::DomainBlacklisted));
        }
        if !domain_passes(self.domain_lists.as_ref(), link.domain_list(), &ctx.domain).await {
            return Err(EngineError::Rejected(RejectReason::DomainNotAllowed));
        }
        Ok(())
    }

    async fn filter_and_select<'a>(
        &self,
        snapshot: &'a ServingSnapshot,
        ctx: &RequestContext,
        mut candidates: Vec<CandidateContext<'a>>,
        params: &SelectionParams<'_>,
    ) -> Result<Selection, EngineError> {
        self.pipeline.run(snapshot, ctx, &mut candidates).await;
        let pool = SelectionPool::from_filtered(candidates).ok_or(EngineError::NoCandidate)?;
        let geo_fallback = pool.kind == PoolKind::GeoFallback;

        let tags = match ctx.response_format {
            ResponseFormat::Vast => {
                let picked = {
                    let mut rng = rand::thread_rng();
                    select_one(pool, params, &mut rng)
                };
                let candidate = picked.ok_or(EngineError::NoCandidate)?;
                vec![selected_tag(snapshot, ctx, &candidate, &self.metrics)?]
            }
            ResponseFormat::Vpaid => {
                let picked = select_many(pool, params, self.config.multi_pick);
                // A tag whose destination can't be rebuilt is left out of the set.
                let tags: Vec<SelectedTag> = picked
                    .iter()
                    .filter_map(|candidate| match selected_tag(snapshot, ctx, candidate, &self.metrics) {
                        Ok(tag) => Some(tag),
                        Err(e) => {
                            warn!(ad_tag_id = %candidate.ad_tag_id, error = %e, "Dropping tag from multi-ad response");
                            None
                        }
                    })
                    .collect();
                if tags.is_empty() {
                    return Err(EngineError::NoCandidate);
                }
                tags
            }
        };

        Ok(Selection { tags, geo_fallback })
    }

    /// Emits the `requests_targeting` event for a finished selection.
    fn report_targeting(
        &self,
        ctx: &RequestContext,
        selection: Result<Selection, EngineError>,
        timestamp: DateTime<Utc>,
    ) -> Result<TargetingDecision, EngineError> {
        let selection = match selection {
            Ok(selection) => selection,
            Err(e) => {
                if matches!(e, EngineError::NoCandidate | EngineError::Encoding(_)) {
                    emit_message(
                        self.telemetry.as_ref(),
                        Topic::RequestsTargeting,
                        &RequestMessage::targeted(ctx, "", timestamp),
                    );
                }
                return Err(e);
            }
        };

        let message = match (ctx.response_format, selection.tags.first()) {
            (ResponseFormat::Vast, Some(tag)) => {
                let mut message = RequestMessage::targeted(ctx, &tag.ad_tag_pub_id, timestamp);
                message.publisher_id = tag.publisher_id;
                message
            }
            _ => RequestMessage::targeted(ctx, "", timestamp),
        };
        emit_message(self.telemetry.as_ref(), Topic::RequestsTargeting, &message);

        debug!(
            request_id = %ctx.request_id,
            targeting_id = %ctx.publisher_targeting_id,
            picked = selection.tags.len(),
            geo_fallback = selection.geo_fallback,
            "Targeting decision"
        );

        Ok(TargetingDecision {
            request_id: ctx.request_id.to_string(),
            response_format: ctx.response_format.as_str(),
            vast_version: ctx.vast_version,
            geo_fallback: selection.geo_fallback,
            tags: selection.tags,
        })
    }

    fn emit_rtb_event(&self, ctx: &RequestContext, event: RtbEvent, timestamp: DateTime<Utc>) {
        emit_message(
            self.telemetry.as_ref(),
            Topic::RtbEvents,
            &RtbEventMessage::new(ctx, event, timestamp),
        );
    }
}

/// Publisher link for the request's targeting id; sets the request platform.
fn resolve_link<'s>(snapshot: &'s ServingSnapshot, ctx: &mut RequestContext) -> Result<&'s PublisherLinkConfig, EngineError> {
    let link = snapshot.link(&ctx.publisher_targeting_id)?;
    ctx.set_platform(Platform::parse(&link.platform));
    Ok(link)
}

/// Without a parameter mapping the template's own query values are kept.
fn selected_tag(
    snapshot: &ServingSnapshot,
    ctx: &RequestContext,
    candidate: &CandidateContext<'_>,
    metrics: &EngineMetrics,
) -> Result<SelectedTag, EngineError> {
    let unmapped = PlatformParameters::default();
    let parameters = match snapshot.parameter_mapping(candidate.tag.advertiser_platform_type_id) {
        Ok(parameters) => parameters,
        Err(e) => {
            warn!(
                ad_tag_id = %candidate.ad_tag_id,
                advertiser_platform_id = candidate.tag.advertiser_platform_type_id,
                error = %e,
                "Serving tag without parameter mapping"
            );
            metrics.record_unmapped_platform();
            &unmapped
        }
    };
    Ok(SelectedTag {
        ad_tag_pub_id: candidate.ad_tag_id.to_string(),
        ad_tag_id: candidate.tag.ad_tag_id,
        destination_url: map_destination_url(&candidate.tag.url, parameters, ctx)?,
        price: ctx.served_price(candidate.tag.price),
        supports_vast: candidate.tag.supports_vast,
        publisher_id: candidate.tag.publisher_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::RawBidResponse;
    use crate::serving::cache::testing::StaticSource;
    use crate::serving::data::fixtures::snapshot_json;
    use crate::serving::InMemoryDomainLists;
    use crate::telemetry::RecordingSink;
    use async_trait::async_trait;

    const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";

    /// Answers every bidder from a fixed table keyed by endpoint.
    struct FixedBids(Vec<(&'static str, RawBidResponse)>);

    #[async_trait]
    impl BidderTransport for FixedBids {
        async fn send(&self, endpoint: &str, _payload: Arc<Vec<u8>>) -> RawBidResponse {
            self.0
                .iter()
                .find(|(url, _)| *url == endpoint)
                .map(|(_, raw)| raw.clone())
                .unwrap_or(RawBidResponse::Empty)
        }
    }

    struct Harness {
        engine: DecisionEngine,
        telemetry: Arc<RecordingSink>,
        lists: Arc<InMemoryDomainLists>,
    }

    fn harness_with(source: StaticSource, bids: Vec<(&'static str, RawBidResponse)>) -> Harness {
        let telemetry = RecordingSink::new();
        let lists = Arc::new(InMemoryDomainLists::new());
        let engine = DecisionEngine::new(
            Arc::new(SnapshotCache::new(Arc::new(source))),
            lists.clone(),
            Arc::new(FixedBids(bids)),
            telemetry.clone(),
            EngineConfig::default(),
        );
        Harness {
            engine,
            telemetry,
            lists,
        }
    }

    fn harness() -> Harness {
        let blob = serde_json::to_vec(&snapshot_json()).unwrap();
        harness_with(StaticSource::new(blob), Vec::new())
    }

    fn request(pairs: &[(&str, &str)], country: &str) -> RawRequest {
        RawRequest {
            query: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            geo_hint: Some(country.to_string()),
            ..Default::default()
        }
    }

    fn targeting(price: &str, extra: &[(&str, &str)]) -> RawRequest {
        let mut pairs = vec![
            ("pub", "tid-1"),
            ("price", price),
            ("ua", DESKTOP_UA),
            ("url", "https://www.news.example/story"),
        ];
        pairs.extend_from_slice(extra);
        request(&pairs, "US")
    }

    fn bid(price: f64) -> RawBidResponse {
        RawBidResponse::Body {
            status: 200,
            body: format!(
                r#"{{"seatbid":[{{"bid":[{{"price":{},"adm":"<VAST/>","nurl":"http://win/?p=${{AUCTION_PRICE}}"}}]}}]}}"#,
                price
            )
            .into_bytes(),
        }
    }

    #[tokio::test]
    async fn test_study_candidate_wins_single_pick() {
        let h = harness();
        let decision = h.engine.decide_targeting(&targeting("1.0", &[])).await.unwrap();

        // 101 has yield, 102 is still in study: study always wins.
        assert_eq!(decision.tags.len(), 1);
        assert_eq!(decision.tags[0].ad_tag_pub_id, "102");
        assert_eq!(decision.tags[0].price, 1.0);
        assert!(!decision.geo_fallback);

        let events = h.telemetry.on_topic(Topic::RequestsTargeting);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["adpid"], "102");
        assert_eq!(events[0].payload["domain"], "news.example");
    }

    #[tokio::test]
    async fn test_no_candidate_emits_single_empty_event() {
        let h = harness();
        let err = h.engine.decide_targeting(&targeting("5.0", &[])).await.unwrap_err();
        assert_eq!(err, EngineError::NoCandidate);

        let events = h.telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, Topic::RequestsTargeting);
        assert_eq!(events[0].payload["adpid"], "");
        assert_eq!(events[0].payload["publisher_id"], 55);
        assert_eq!(h.engine.metrics().outcomes("targeting_v2", "no_fill"), 1);
    }

    #[tokio::test]
    async fn test_geo_only_failure_is_served_as_fallback() {
        let h = harness();
        h.lists.insert(4, "news.example", ListMark::Black);
        let mut raw = targeting("1.0", &[]);
        raw.geo_hint = Some("DE".into());

        // 101 fails geo only, 102 is on its black list.
        let decision = h.engine.decide_targeting(&raw).await.unwrap();
        assert!(decision.geo_fallback);
        assert_eq!(decision.tags[0].ad_tag_pub_id, "101");
    }

    #[tokio::test]
    async fn test_unparsable_price_falls_back_to_link_price() {
        let h = harness();
        let decision = h.engine.decide_targeting(&targeting("n/a", &[])).await.unwrap();
        // Link price 1.5 drops 102 (price 1.0).
        assert_eq!(decision.tags[0].ad_tag_pub_id, "101");
        assert_eq!(decision.tags[0].price, 1.5);
        assert!(decision.tags[0].destination_url.starts_with("https://adv.example/vast?"));
    }

    #[tokio::test]
    async fn test_default_black_list_rejects_before_candidates() {
        let h = harness();
        h.lists.insert(12, "news.example", ListMark::Black);
        let err = h.engine.decide_targeting(&targeting("1.0", &[])).await.unwrap_err();
        assert_eq!(err, EngineError::Rejected(RejectReason::DomainBlacklisted));
        assert!(h.telemetry.events().is_empty());
    }

    #[tokio::test]
    async fn test_vpaid_interleaves_exploit_and_study() {
        let h = harness();
        let raw = targeting("1.0", &[("response", "vast30vpaid")]);
        let decision = h.engine.decide_targeting(&raw).await.unwrap();

        let ids: Vec<&str> = decision.tags.iter().map(|t| t.ad_tag_pub_id.as_str()).collect();
        assert_eq!(ids, vec!["101", "102"]);
        assert_eq!(decision.response_format, "vpaid");
        assert_eq!(decision.vast_version, 3);

        let events = h.telemetry.on_topic(Topic::RequestsTargeting);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["adpid"], "");
        assert_eq!(events[0].payload["rtype"], "vpaid");
    }

    #[tokio::test]
    async fn test_unknown_link_is_not_found() {
        let h = harness();
        let raw = request(&[("pub", "nope"), ("price", "1.0")], "US");
        let err = h.engine.decide_targeting(&raw).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_global_matching_uses_publisher_tags() {
        let h = harness();
        let decision = h
            .engine
            .decide_targeting_global(&targeting("1.0", &[]))
            .await
            .unwrap();
        assert_eq!(decision.tags[0].ad_tag_pub_id, "102");
    }

    #[tokio::test]
    async fn test_global_without_link_serves_unparsable_price_as_zero() {
        let mut blob = snapshot_json();
        blob["publisher_links"] = serde_json::json!({});
        let h = harness_with(StaticSource::new(serde_json::to_vec(&blob).unwrap()), Vec::new());

        // No link price to fall back on, and no rejection either.
        let decision = h
            .engine
            .decide_targeting_global(&targeting("abc", &[]))
            .await
            .unwrap();
        assert_eq!(decision.tags.len(), 1);
        assert!(["101", "102"].contains(&decision.tags[0].ad_tag_pub_id.as_str()));
        assert_eq!(decision.tags[0].price, 0.0);

        // The link-bound path still rejects the same request.
        let err = h.engine.decide_targeting(&targeting("abc", &[])).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_direct_paths() {
        let h = harness();

        let vast = h
            .engine
            .decide_direct(&request(&[("adtagpubid", "101"), ("ua", DESKTOP_UA), ("cb", "42")], "US"))
            .await
            .unwrap();
        match vast {
            DirectDecision::VastWrapper(tag) => {
                assert_eq!(tag.ad_tag_id, 101);
                assert_eq!(tag.price, 2.5);
                assert!(tag.destination_url.contains("cb=42"));
            }
            other => panic!("expected wrapper, got {:?}", other),
        }

        let redirect = h
            .engine
            .decide_direct(&request(&[("adtagpubid", "102"), ("x", "7")], "US"))
            .await
            .unwrap();
        assert_eq!(redirect, DirectDecision::Redirect("https://other.example/tag?x=7".into()));

        let events = h.telemetry.on_topic(Topic::Requests);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload["adpid"], "101");
        assert_eq!(events[0].payload["rtype"], "direct");
        assert_eq!(events[0].payload["device_type"], "desktop");
    }

    #[tokio::test]
    async fn test_direct_rejections() {
        let h = harness();
        assert_eq!(
            h.engine.decide_direct(&request(&[], "US")).await.unwrap_err(),
            EngineError::Rejected(RejectReason::MissingAdTagId)
        );
        assert!(matches!(
            h.engine
                .decide_direct(&request(&[("adtagpubid", "999")], "US"))
                .await
                .unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_direct_inactive_tag() {
        let mut blob = snapshot_json();
        blob["ad_tags"]["102"]["is_active"] = serde_json::json!(false);
        let h = harness_with(StaticSource::new(serde_json::to_vec(&blob).unwrap()), Vec::new());
        let err = h
            .engine
            .decide_direct(&request(&[("adtagpubid", "102")], "US"))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Rejected(RejectReason::NotActive));

        blob["ad_tags"]["102"]["is_test"] = serde_json::json!(true);
        let h = harness_with(StaticSource::new(serde_json::to_vec(&blob).unwrap()), Vec::new());
        assert!(h
            .engine
            .decide_direct(&request(&[("adtagpubid", "102")], "US"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_rtb_init_events() {
        let h = harness();
        let session = h.engine.rtb_init(&targeting("1.0", &[])).await.unwrap();
        assert_eq!(session.publisher_id, 55);
        assert_eq!(session.platform, "desktop");

        h.lists.insert(12, "news.example", ListMark::Black);
        assert!(h.engine.rtb_init(&targeting("1.0", &[])).await.is_err());

        let kinds: Vec<String> = h
            .telemetry
            .on_topic(Topic::RtbEvents)
            .iter()
            .map(|e| e.payload["e"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(kinds, vec!["init", "init_error"]);
    }

    #[tokio::test]
    async fn test_rtb_session_points_at_rotator_domain() {
        let config = EngineConfig {
            rotator_domain: Some("rot.example.com".into()),
            ..EngineConfig::default()
        };
        let blob = serde_json::to_vec(&snapshot_json()).unwrap();
        let engine = DecisionEngine::new(
            Arc::new(SnapshotCache::new(Arc::new(StaticSource::new(blob)))),
            Arc::new(InMemoryDomainLists::new()),
            Arc::new(FixedBids(Vec::new())),
            RecordingSink::new(),
            config,
        );

        let session = engine
            .rtb_init(&request(&[("pub", "tid-1"), ("price", "1.0"), ("w", "640")], "US"))
            .await
            .unwrap();
        assert_eq!(
            session.processor_url.as_deref(),
            Some("https://rot.example.com/rotator/target/bidder_processor?price=1.0&pub=tid-1&w=640")
        );

        // No domain configured: nothing to point at.
        let h = harness();
        let session = h.engine.rtb_init(&targeting("1.0", &[])).await.unwrap();
        assert!(session.processor_url.is_none());
        assert!(serde_json::to_value(&session).unwrap().get("processor_url").is_none());
    }

    #[tokio::test]
    async fn test_missing_parameter_mapping_is_counted() {
        let mut blob = snapshot_json();
        blob["parameters_mapping"] = serde_json::json!({});
        let h = harness_with(StaticSource::new(serde_json::to_vec(&blob).unwrap()), Vec::new());

        let decision = h.engine.decide_targeting(&targeting("n/a", &[])).await.unwrap();
        assert_eq!(decision.tags[0].ad_tag_pub_id, "101");
        // Template values stay as configured.
        assert!(decision.tags[0].destination_url.contains("ua=%5BUA%5D"));
        assert_eq!(h.engine.metrics().unmapped_platforms(), 1);
        assert!(h.engine.render_metrics().contains("rotator_unmapped_platform_total 1"));

        let h = harness();
        h.engine.decide_targeting(&targeting("n/a", &[])).await.unwrap();
        assert_eq!(h.engine.metrics().unmapped_platforms(), 0);
    }

    #[tokio::test]
    async fn test_auction_reports_every_bidder() {
        let blob = serde_json::to_vec(&snapshot_json()).unwrap();
        let h = harness_with(
            StaticSource::new(blob),
            vec![
                ("http://bidder-1.example/bid", bid(4.0)),
                ("http://bidder-3.example/bid", bid(3.0)),
            ],
        );

        let decision = h.engine.run_auction(&targeting("1.0", &[])).await.unwrap();
        assert_eq!(decision.bid_floor, 1.5);
        assert_eq!(decision.winner.advertiser_id, 1);
        assert!((decision.winner.clearing_price - 3.01).abs() < 1e-9);
        assert_eq!(decision.winner.nurl, "http://win/?p=3.0100");

        let rtb = h.telemetry.on_topic(Topic::RtbEvents);
        assert_eq!(rtb.len(), 1);
        assert_eq!(rtb[0].payload["e"], "auction");

        let bids = h.telemetry.on_topic(Topic::RtbBidRequests);
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].payload["advertiser_id"], 1);
        assert_eq!(bids[0].payload["bid_win"], 1);
        assert_eq!(bids[1].payload["bid_win"], 0);
    }

    #[tokio::test]
    async fn test_auction_without_bids_is_no_fill() {
        let h = harness();
        let err = h.engine.run_auction(&targeting("1.0", &[])).await.unwrap_err();
        assert_eq!(err, EngineError::NoCandidate);
        assert_eq!(h.telemetry.on_topic(Topic::RtbBidRequests).len(), 2);
        assert!(h.engine.render_metrics().contains("rotator_auctions_total{result=\"empty\"} 1"));
    }

    #[tokio::test]
    async fn test_nan_price_keeps_a_real_floor() {
        let blob = serde_json::to_vec(&snapshot_json()).unwrap();
        let h = harness_with(
            StaticSource::new(blob),
            vec![("http://bidder-1.example/bid", bid(0.01))],
        );

        let err = h.engine.run_auction(&targeting("NaN", &[])).await.unwrap_err();
        assert_eq!(err, EngineError::NoCandidate);

        let bids = h.telemetry.on_topic(Topic::RtbBidRequests);
        assert_eq!(bids[0].payload["bid_floor_price"], 0.5);
        assert_eq!(bids[0].payload["bid_win"], 0);
    }

    #[tokio::test]
    async fn test_cold_store_failure_is_stale_data() {
        let h = harness_with(StaticSource::failing(), Vec::new());
        let err = h.engine.decide_targeting(&targeting("1.0", &[])).await.unwrap_err();
        assert!(matches!(err, EngineError::StaleData(_)));
        assert!(h.telemetry.events().is_empty());
    }
}
