//! Auction fan-out and collection.
//!
//! `Init -> Fanout -> Collecting -> Settled | Empty`. Every bidder gets its
//! own task; all of them are awaited, since empty and timed-out bids are
//! reported too.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::bidder::{BidderTransport, RawBidResponse, DEFAULT_BID_TIMEOUT};
use super::openrtb::compose_bid_request;
use super::settlement::{settle, substitute_auction_price, BidOutcome, BidStatus, Settlement};
use crate::error::EngineError;
use crate::request::RequestContext;
use crate::serving::AdvertiserConfig;

/// Added to the requested price to form the bid floor.
pub const DEFAULT_FLOOR_MARGIN: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuctionState {
    Init,
    Fanout,
    Collecting,
    Settled,
    Empty,
}

impl AuctionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionState::Init => "init",
            AuctionState::Fanout => "fanout",
            AuctionState::Collecting => "collecting",
            AuctionState::Settled => "settled",
            AuctionState::Empty => "empty",
        }
    }

    pub fn can_advance_to(&self, next: AuctionState) -> bool {
        matches!(
            (self, next),
            (AuctionState::Init, AuctionState::Fanout)
                | (AuctionState::Fanout, AuctionState::Collecting)
                | (AuctionState::Collecting, AuctionState::Settled)
                | (AuctionState::Collecting, AuctionState::Empty)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AuctionState::Settled | AuctionState::Empty)
    }
}

/// Current state of one auction plus every state it passed through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuctionProgress {
    state: AuctionState,
    history: Vec<AuctionState>,
}

impl AuctionProgress {
    pub fn new() -> Self {
        Self {
            state: AuctionState::Init,
            history: vec![AuctionState::Init],
        }
    }

    pub fn state(&self) -> AuctionState {
        self.state
    }

    pub fn history(&self) -> &[AuctionState] {
        &self.history
    }

    /// Moves to `next`. An illegal transition leaves the state unchanged.
    pub fn advance(&mut self, next: AuctionState) -> bool {
        if !self.state.can_advance_to(next) {
            warn!(from = self.state.as_str(), to = next.as_str(), "Illegal auction transition");
            return false;
        }
        self.state = next;
        self.history.push(next);
        true
    }
}

impl Default for AuctionProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AuctionConfig {
    pub floor_margin: f64,
    pub bid_timeout: Duration,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            floor_margin: DEFAULT_FLOOR_MARGIN,
            bid_timeout: DEFAULT_BID_TIMEOUT,
        }
    }
}

/// Winning bid with the clearing price already substituted into its markup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WinningBid {
    pub advertiser_id: u64,
    pub price: f64,
    pub clearing_price: f64,
    pub adm: String,
    pub nurl: String,
}

#[derive(Debug, Clone)]
pub struct AuctionResult {
    /// Terminal state: `Settled` or `Empty`.
    pub state: AuctionState,
    pub progress: AuctionProgress,
    pub bid_floor: f64,
    /// One entry per bidder, in ascending advertiser id order.
    pub outcomes: Vec<BidOutcome>,
    pub winner: Option<WinningBid>,
}

pub struct AuctionOrchestrator {
    transport: Arc<dyn BidderTransport>,
    config: AuctionConfig,
}

impl AuctionOrchestrator {
    pub fn new(transport: Arc<dyn BidderTransport>, config: AuctionConfig) -> Self {
        Self { transport, config }
    }

    pub fn bid_floor(&self, ctx: &RequestContext) -> f64 {
        ctx.requested_price() + self.config.floor_margin
    }

    pub async fn run(&self, ctx: &RequestContext, advertisers: &[AdvertiserConfig]) -> Result<AuctionResult, EngineError> {
        let mut progress = AuctionProgress::new();
        let bid_floor = self.bid_floor(ctx);
        let request = compose_bid_request(ctx, bid_floor);
        let payload = serde_json::to_vec(&request)
            .map(Arc::new)
            .map_err(|e| EngineError::Encoding(format!("bid request: {}", e)))?;

        let mut ordered: Vec<&AdvertiserConfig> = advertisers.iter().collect();
        ordered.sort_by_key(|a| a.id);

        progress.advance(AuctionState::Fanout);
        debug!(
            request_id = %ctx.request_id,
            state = progress.state().as_str(),
            bidders = ordered.len(),
            bid_floor,
            "Fanning out bid request"
        );

        let handles = ordered.iter().map(|advertiser| {
            let transport = self.transport.clone();
            let payload = payload.clone();
            let endpoint = advertiser.rtb_integration_url.clone();
            let advertiser_id = advertiser.id;
            tokio::spawn(async move {
                let started = Instant::now();
                let raw = transport.send(&endpoint, payload).await;
                (advertiser_id, raw, started.elapsed())
            })
        });
        let joined = join_all(handles).await;

        progress.advance(AuctionState::Collecting);
        let mut outcomes: Vec<BidOutcome> = joined
            .into_iter()
            .zip(ordered.iter())
            .map(|(joined, advertiser)| match joined {
                Ok((advertiser_id, raw, elapsed)) => BidOutcome::classify(advertiser_id, raw, elapsed, bid_floor),
                Err(e) => BidOutcome::classify(
                    advertiser.id,
                    RawBidResponse::Timeout(format!("bid task failed: {}", e)),
                    Duration::ZERO,
                    bid_floor,
                ),
            })
            .collect();

        let settlement = {
            let mut rng = rand::thread_rng();
            settle(&mut outcomes, bid_floor, &mut rng)
        };

        let winner = settlement.and_then(|s| winning_bid(&outcomes, &s));
        progress.advance(if winner.is_some() {
            AuctionState::Settled
        } else {
            AuctionState::Empty
        });
        let state = progress.state();

        info!(
            request_id = %ctx.request_id,
            state = state.as_str(),
            bidders = outcomes.len(),
            valid = outcomes.iter().filter(|o| o.status == BidStatus::Valid).count(),
            timeouts = outcomes.iter().filter(|o| o.status == BidStatus::Timeout).count(),
            winner = winner.as_ref().map(|w| w.advertiser_id),
            "Auction finished"
        );

        Ok(AuctionResult {
            state,
            progress,
            bid_floor,
            outcomes,
            winner,
        })
    }
}

fn winning_bid(outcomes: &[BidOutcome], settlement: &Settlement) -> Option<WinningBid> {
    let outcome = outcomes.get(settlement.winner)?;
    let bid = outcome.response.as_ref()?.first_bid()?;
    Some(WinningBid {
        advertiser_id: outcome.advertiser_id,
        price: settlement.winning_price,
        clearing_price: settlement.clearing_price,
        adm: substitute_auction_price(&bid.adm, settlement.clearing_price),
        nurl: substitute_auction_price(&bid.nurl, settlement.clearing_price),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::PriceQuote;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Canned answers per endpoint, optionally delayed.
    struct ScriptedTransport {
        answers: HashMap<String, (Duration, RawBidResponse)>,
    }

    #[async_trait]
    impl BidderTransport for ScriptedTransport {
        async fn send(&self, endpoint: &str, _payload: Arc<Vec<u8>>) -> RawBidResponse {
            match self.answers.get(endpoint) {
                Some((delay, raw)) => {
                    tokio::time::sleep(*delay).await;
                    raw.clone()
                }
                None => RawBidResponse::Timeout("unknown endpoint".into()),
            }
        }
    }

    fn bid(price: f64) -> RawBidResponse {
        RawBidResponse::Body {
            status: 200,
            body: format!(
                r#"{{"seatbid":[{{"bid":[{{"price":{},"adm":"<VAST p='${{AUCTION_PRICE}}'/>","nurl":"http://w/?p=${{AUCTION_PRICE}}"}}]}}]}}"#,
                price
            )
            .into_bytes(),
        }
    }

    fn advertiser(id: u64) -> AdvertiserConfig {
        AdvertiserConfig {
            id,
            rtb_integration_url: format!("http://bidder-{}", id),
        }
    }

    fn orchestrator(answers: Vec<(u64, Duration, RawBidResponse)>) -> AuctionOrchestrator {
        let answers = answers
            .into_iter()
            .map(|(id, delay, raw)| (format!("http://bidder-{}", id), (delay, raw)))
            .collect();
        AuctionOrchestrator::new(Arc::new(ScriptedTransport { answers }), AuctionConfig::default())
    }

    fn ctx(price: f64) -> RequestContext {
        let mut ctx = RequestContext::new("tid");
        ctx.price = PriceQuote::Fixed(price);
        ctx
    }

    #[tokio::test]
    async fn test_outcomes_in_advertiser_order_regardless_of_latency() {
        let orchestrator = orchestrator(vec![
            (1, Duration::from_millis(40), bid(5.6)),
            (2, Duration::from_millis(0), bid(5.6)),
            (3, Duration::from_millis(0), RawBidResponse::Timeout("deadline".into())),
        ]);
        let advertisers = vec![advertiser(3), advertiser(2), advertiser(1)];
        let result = orchestrator.run(&ctx(1.0), &advertisers).await.unwrap();

        let ids: Vec<u64> = result.outcomes.iter().map(|o| o.advertiser_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(result.state, AuctionState::Settled);

        let winner = result.winner.unwrap();
        assert_eq!(winner.advertiser_id, 1);
        assert!((winner.clearing_price - 5.6).abs() < 1e-9);
        assert_eq!(winner.nurl, "http://w/?p=5.6000");
        assert_eq!(result.outcomes[2].status, BidStatus::Timeout);
    }

    #[tokio::test]
    async fn test_floor_is_price_plus_margin() {
        let orchestrator = orchestrator(vec![(1, Duration::ZERO, bid(1.2))]);
        let result = orchestrator.run(&ctx(1.0), &[advertiser(1)]).await.unwrap();
        assert_eq!(result.bid_floor, 1.5);
        assert!(result.outcomes[0].floor_violation);
        assert_eq!(result.state, AuctionState::Empty);
        assert!(result.winner.is_none());
    }

    #[tokio::test]
    async fn test_no_bidders_is_empty() {
        let orchestrator = orchestrator(vec![]);
        let result = orchestrator.run(&ctx(1.0), &[]).await.unwrap();
        assert_eq!(result.state, AuctionState::Empty);
        assert!(result.outcomes.is_empty());
        assert_eq!(
            result.progress.history(),
            &[AuctionState::Init, AuctionState::Fanout, AuctionState::Collecting, AuctionState::Empty]
        );
    }

    #[tokio::test]
    async fn test_settled_auction_walks_every_state() {
        let orchestrator = orchestrator(vec![(1, Duration::ZERO, bid(4.0))]);
        let result = orchestrator.run(&ctx(1.0), &[advertiser(1)]).await.unwrap();
        assert_eq!(
            result.progress.history(),
            &[AuctionState::Init, AuctionState::Fanout, AuctionState::Collecting, AuctionState::Settled]
        );
        assert_eq!(result.progress.state(), result.state);
        assert!(result.state.is_terminal());
    }

    #[test]
    fn test_illegal_transitions_are_refused() {
        let mut progress = AuctionProgress::new();
        assert!(!progress.advance(AuctionState::Settled));
        assert_eq!(progress.state(), AuctionState::Init);

        assert!(progress.advance(AuctionState::Fanout));
        assert!(progress.advance(AuctionState::Collecting));
        assert!(progress.advance(AuctionState::Empty));
        assert!(!progress.advance(AuctionState::Fanout));
        assert_eq!(progress.history().len(), 4);
    }

    #[tokio::test]
    async fn test_single_bid_clears_inside_range() {
        let orchestrator = orchestrator(vec![(1, Duration::ZERO, bid(6.0)), (2, Duration::ZERO, RawBidResponse::Empty)]);
        let result = orchestrator.run(&ctx(1.0), &[advertiser(1), advertiser(2)]).await.unwrap();
        let winner = result.winner.unwrap();
        assert!(winner.clearing_price >= 1.51 && winner.clearing_price < 6.0);
        assert_eq!(result.outcomes.iter().filter(|o| o.win).count(), 1);
    }
}
