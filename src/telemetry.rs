//! Fire-and-forget telemetry.
//!
//! Events go into a bounded channel with `try_send`; a full channel drops the
//! event and bumps a counter. A forwarder task drains the channel and POSTs
//! each event to `<endpoint>/<topic>`, or logs it at debug when no endpoint
//! is configured.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auction::{BidOutcome, BidStatus};
use crate::request::RequestContext;

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Requests,
    RequestsTargeting,
    RtbEvents,
    RtbBidRequests,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Requests => "requests",
            Topic::RequestsTargeting => "requests_targeting",
            Topic::RtbEvents => "rtb_events",
            Topic::RtbBidRequests => "rtb_bid_requests",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub topic: Topic,
    pub payload: serde_json::Value,
}

impl TelemetryEvent {
    pub fn new<T: Serialize>(topic: Topic, message: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            topic,
            payload: serde_json::to_value(message)?,
        })
    }
}

/// Never blocks the caller.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);

    /// Events lost because the sink could not take them.
    fn dropped(&self) -> u64 {
        0
    }
}

/// Serializes and emits, logging a serialization failure instead of failing the request.
pub fn emit_message<T: Serialize>(sink: &dyn TelemetrySink, topic: Topic, message: &T) {
    match TelemetryEvent::new(topic, message) {
        Ok(event) => sink.emit(event),
        Err(e) => warn!(topic = topic.as_str(), error = %e, "Can't serialize telemetry message"),
    }
}

/// Request seen, on `requests` (direct) or `requests_targeting`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMessage {
    pub adpid: String,
    pub rid: String,
    pub timestamp: i64,
    pub rtype: String,
    pub geo_country: String,
    pub device_type: String,
    pub publisher_id: u64,
    pub targeting_id: String,
    pub domain: String,
    pub app_name: String,
    pub bundle_id: String,
}

impl RequestMessage {
    /// Targeted request. An empty `ad_tag_id` records a no-fill.
    pub fn targeted(ctx: &RequestContext, ad_tag_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            adpid: ad_tag_id.to_string(),
            rid: ctx.request_id.to_string(),
            timestamp: timestamp.timestamp(),
            rtype: ctx.kind.as_str().to_string(),
            geo_country: ctx.country.clone(),
            device_type: ctx.device_platform_type.clone(),
            publisher_id: ctx.publisher_id.unwrap_or_default(),
            targeting_id: ctx.publisher_targeting_id.clone(),
            domain: ctx.domain.clone(),
            app_name: ctx.app_name.clone(),
            bundle_id: ctx.bundle_id.clone(),
        }
    }

    pub fn direct(ctx: &RequestContext, ad_tag_id: &str, timestamp: DateTime<Utc>) -> Self {
        let mut message = Self::targeted(ctx, ad_tag_id, timestamp);
        message.device_type = ctx.device_type.as_str().to_string();
        message
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtbEvent {
    Init,
    InitError,
    Auction,
}

impl RtbEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtbEvent::Init => "init",
            RtbEvent::InitError => "init_error",
            RtbEvent::Auction => "auction",
        }
    }
}

/// Auction lifecycle event on `rtb_events`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RtbEventMessage {
    pub id: String,
    pub pid: u64,
    pub tid: String,
    pub e: String,
    pub price: f64,
    pub timestamp: i64,
    pub geo_country: String,
    pub device_type: String,
    pub domain: String,
    pub app_name: String,
    pub bundle_id: String,
}

impl RtbEventMessage {
    pub fn new(ctx: &RequestContext, event: RtbEvent, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: ctx.request_id.to_string(),
            pid: ctx.publisher_id.unwrap_or_default(),
            tid: ctx.publisher_targeting_id.clone(),
            e: event.as_str().to_string(),
            price: ctx.requested_price(),
            timestamp: timestamp.timestamp(),
            geo_country: ctx.country.clone(),
            device_type: ctx.device_platform_type.clone(),
            domain: ctx.domain.clone(),
            app_name: ctx.app_name.clone(),
            bundle_id: ctx.bundle_id.clone(),
        }
    }
}

/// One bidder's outcome on `rtb_bid_requests`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RtbBidMessage {
    pub id: String,
    pub pid: u64,
    pub tid: String,
    pub price: f64,
    pub timestamp: i64,
    pub advertiser_id: u64,
    pub bid_response: u8,
    pub bid_response_time: u64,
    pub bid_response_timeout: u8,
    pub bid_response_empty: u8,
    pub bid_response_error: String,
    pub bid_win: u8,
    pub bid_floor_price: f64,
    pub bid_price: f64,
    pub second_price: f64,
    pub geo_country: String,
    pub device_type: String,
    pub domain: String,
    pub app_name: String,
    pub bundle_id: String,
}

impl RtbBidMessage {
    pub fn new(ctx: &RequestContext, outcome: &BidOutcome, timestamp: DateTime<Utc>) -> Self {
        let timed_out = outcome.status == BidStatus::Timeout;
        let empty = outcome.status == BidStatus::Empty;
        Self {
            id: ctx.request_id.to_string(),
            pid: ctx.publisher_id.unwrap_or_default(),
            tid: ctx.publisher_targeting_id.clone(),
            price: ctx.requested_price(),
            timestamp: timestamp.timestamp(),
            advertiser_id: outcome.advertiser_id,
            bid_response: u8::from(!timed_out && !empty),
            bid_response_time: outcome.elapsed_ms(),
            bid_response_timeout: u8::from(timed_out),
            bid_response_empty: u8::from(empty),
            bid_response_error: outcome.error.clone().unwrap_or_default(),
            bid_win: u8::from(outcome.win),
            bid_floor_price: outcome.bid_floor,
            bid_price: outcome.price,
            second_price: outcome.settlement_price,
            geo_country: ctx.country.clone(),
            device_type: ctx.device_platform_type.clone(),
            domain: ctx.domain.clone(),
            app_name: ctx.app_name.clone(),
            bundle_id: ctx.bundle_id.clone(),
        }
    }
}

/// Bounded channel sink.
pub struct ChannelSink {
    tx: mpsc::Sender<TelemetryEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }
}

impl TelemetrySink for ChannelSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, error = %e, "Telemetry queue full or closed, dropping events");
            }
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drains the channel until every sender is gone.
pub fn spawn_forwarder(
    mut rx: mpsc::Receiver<TelemetryEvent>,
    endpoint: Option<String>,
    client: Client,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let topic = event.topic.as_str();
            match &endpoint {
                Some(base) => {
                    let url = format!("{}/{}", base.trim_end_matches('/'), topic);
                    match client.post(&url).json(&event.payload).send().await {
                        Ok(response) if !response.status().is_success() => {
                            warn!(topic, status = %response.status(), "Telemetry endpoint rejected event");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(topic, error = %e, "Telemetry delivery failed"),
                    }
                }
                None => debug!(topic, payload = %event.payload, "telemetry"),
            }
        }
        debug!("Telemetry forwarder stopped");
    })
}

/// Keeps every event in memory. For tests and dry runs.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    pub fn on_topic(&self, topic: Topic) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }
}

impl TelemetrySink for RecordingSink {
    fn emit(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::RawBidResponse;
    use std::time::Duration;

    fn event(n: u64) -> TelemetryEvent {
        TelemetryEvent {
            topic: Topic::Requests,
            payload: serde_json::json!({ "n": n }),
        }
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(2);
        for n in 0..5 {
            sink.emit(event(n));
        }
        assert_eq!(sink.dropped(), 3);
        assert_eq!(rx.try_recv().unwrap(), event(0));
        assert_eq!(rx.try_recv().unwrap(), event(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_request_message_fields() {
        let mut ctx = RequestContext::new("tid-1");
        ctx.publisher_id = Some(55);
        ctx.country = "US".into();
        ctx.device_platform_type = "desktop".into();
        ctx.domain = "news.example".into();
        let now = Utc::now();

        let value = serde_json::to_value(RequestMessage::targeted(&ctx, "", now)).unwrap();
        assert_eq!(value["adpid"], "");
        assert_eq!(value["rtype"], "targeting");
        assert_eq!(value["publisher_id"], 55);
        assert_eq!(value["targeting_id"], "tid-1");
        assert_eq!(value["timestamp"], now.timestamp());
    }

    #[test]
    fn test_bid_message_flags() {
        let mut ctx = RequestContext::new("tid-1");
        ctx.publisher_id = Some(55);
        let timeout = BidOutcome::classify(
            7,
            RawBidResponse::Timeout("deadline".into()),
            Duration::from_millis(301),
            1.5,
        );
        let message = RtbBidMessage::new(&ctx, &timeout, Utc::now());
        assert_eq!(message.bid_response, 0);
        assert_eq!(message.bid_response_timeout, 1);
        assert_eq!(message.bid_response_time, 301);
        assert_eq!(message.bid_response_error, "deadline");
        assert_eq!(message.bid_floor_price, 1.5);

        let rtb = RtbEventMessage::new(&ctx, RtbEvent::InitError, Utc::now());
        assert_eq!(rtb.e, "init_error");
        assert_eq!(rtb.pid, 55);
    }

    #[tokio::test]
    async fn test_forwarder_drains_without_endpoint() {
        let (sink, rx) = ChannelSink::new(8);
        let handle = spawn_forwarder(rx, None, Client::new());
        emit_message(&sink, Topic::RtbEvents, &serde_json::json!({"e": "init"}));
        drop(sink);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_recording_sink_filters_topic() {
        let sink = RecordingSink::new();
        emit_message(sink.as_ref(), Topic::Requests, &serde_json::json!({}));
        emit_message(sink.as_ref(), Topic::RtbEvents, &serde_json::json!({}));
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.on_topic(Topic::RtbEvents).len(), 1);
    }
}
