//! Real-time bidding: OpenRTB payloads, bidder transport, settlement and the
//! per-request orchestrator.

pub mod bidder;
pub mod openrtb;
pub mod orchestrator;
pub mod settlement;

pub use bidder::{BidderTransport, HttpBidder, RawBidResponse, DEFAULT_BID_TIMEOUT, DEFAULT_OPENRTB_VERSION};
pub use orchestrator::{AuctionConfig, AuctionOrchestrator, AuctionProgress, AuctionResult, AuctionState, WinningBid, DEFAULT_FLOOR_MARGIN};
pub use settlement::{BidOutcome, BidStatus, Settlement};
