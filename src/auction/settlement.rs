//! Bid classification and second-price settlement.

use rand::Rng;
use std::time::Duration;

use super::bidder::RawBidResponse;
use super::openrtb::BidResponse;

pub const AUCTION_PRICE_MACRO: &str = "${AUCTION_PRICE}";
/// Added to the second price, and to the floor for the no-second-bid draw.
pub const PRICE_INCREMENT: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidStatus {
    Timeout,
    Empty,
    /// Error status, unparsable body, or no seat bid.
    Malformed,
    Valid,
}

impl BidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BidStatus::Timeout => "timeout",
            BidStatus::Empty => "empty",
            BidStatus::Malformed => "malformed",
            BidStatus::Valid => "valid",
        }
    }
}

/// Result for one bidder in one auction.
#[derive(Debug, Clone)]
pub struct BidOutcome {
    pub advertiser_id: u64,
    pub status: BidStatus,
    pub price: f64,
    pub bid_floor: f64,
    pub floor_violation: bool,
    pub win: bool,
    pub settlement_price: f64,
    pub elapsed: Duration,
    pub error: Option<String>,
    pub response: Option<BidResponse>,
    /// Body as received, for telemetry.
    pub raw_body: String,
}

impl BidOutcome {
    fn new(advertiser_id: u64, status: BidStatus, bid_floor: f64, elapsed: Duration) -> Self {
        Self {
            advertiser_id,
            status,
            price: 0.0,
            bid_floor,
            floor_violation: false,
            win: false,
            settlement_price: 0.0,
            elapsed,
            error: None,
            response: None,
            raw_body: String::new(),
        }
    }

    pub fn classify(advertiser_id: u64, raw: RawBidResponse, elapsed: Duration, bid_floor: f64) -> Self {
        match raw {
            RawBidResponse::Timeout(reason) => {
                let mut outcome = Self::new(advertiser_id, BidStatus::Timeout, bid_floor, elapsed);
                outcome.error = Some(reason);
                outcome
            }
            RawBidResponse::Empty => Self::new(advertiser_id, BidStatus::Empty, bid_floor, elapsed),
            RawBidResponse::Body { status, body } => {
                let mut outcome = Self::new(advertiser_id, BidStatus::Malformed, bid_floor, elapsed);
                outcome.raw_body = String::from_utf8_lossy(&body).into_owned();
                if !(200..300).contains(&status) {
                    outcome.error = Some(format!("bidder answered with status {}", status));
                    return outcome;
                }
                let response: BidResponse = match serde_json::from_slice(&body) {
                    Ok(response) => response,
                    Err(e) => {
                        outcome.error = Some(format!("unparsable bid response: {}", e));
                        return outcome;
                    }
                };
                let Some(price) = response.first_bid().map(|bid| bid.price) else {
                    outcome.error = Some("bid response has no seat bid".to_string());
                    return outcome;
                };
                outcome.status = BidStatus::Valid;
                outcome.price = price;
                outcome.floor_violation = price < bid_floor;
                outcome.response = Some(response);
                outcome
            }
        }
    }

    /// Valid and at or above the floor.
    pub fn is_eligible(&self) -> bool {
        self.status == BidStatus::Valid && !self.floor_violation
    }

    /// Elapsed time in whole milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settlement {
    /// Index of the winner in the outcome list.
    pub winner: usize,
    pub winning_price: f64,
    pub second_price: Option<f64>,
    pub clearing_price: f64,
}

/// Highest eligible bid and the runner-up, in the order outcomes were
/// collected. A later equal price does not displace the earlier leader; it
/// becomes the runner-up instead.
pub fn rank(outcomes: &[BidOutcome]) -> Option<(usize, f64, Option<f64>)> {
    let mut leader: Option<(usize, f64)> = None;
    let mut second: Option<f64> = None;
    for (index, outcome) in outcomes.iter().enumerate().filter(|(_, o)| o.is_eligible()) {
        match leader {
            Some((_, best)) if outcome.price <= best => {
                if second.map_or(true, |s| outcome.price > s) {
                    second = Some(outcome.price);
                }
            }
            Some((_, best)) => {
                second = Some(best);
                leader = Some((index, outcome.price));
            }
            None => leader = Some((index, outcome.price)),
        }
    }
    leader.map(|(index, price)| (index, price, second))
}

/// Second price plus a cent, capped at the winning price. With no runner-up
/// the price is drawn between the floor plus a cent and the winning price.
pub fn clearing_price<R: Rng + ?Sized>(winning: f64, second: Option<f64>, bid_floor: f64, rng: &mut R) -> f64 {
    match second {
        Some(second) => (second + PRICE_INCREMENT).min(winning),
        None => {
            let low = bid_floor + PRICE_INCREMENT;
            if low < winning {
                rng.gen_range(low..winning)
            } else {
                winning
            }
        }
    }
}

/// Marks the winner and its settlement price. `None` when nothing is eligible.
pub fn settle<R: Rng + ?Sized>(outcomes: &mut [BidOutcome], bid_floor: f64, rng: &mut R) -> Option<Settlement> {
    let (winner, winning_price, second_price) = rank(outcomes)?;
    let clearing = clearing_price(winning_price, second_price, bid_floor, rng);
    let outcome = &mut outcomes[winner];
    outcome.win = true;
    outcome.settlement_price = clearing;
    Some(Settlement {
        winner,
        winning_price,
        second_price,
        clearing_price: clearing,
    })
}

pub fn substitute_auction_price(template: &str, price: f64) -> String {
    template.replace(AUCTION_PRICE_MACRO, &format!("{:.4}", price))
}
