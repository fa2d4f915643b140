//! Bidder transport.
//!
//! One POST per bidder under a hard deadline. The deadline covers reading the
//! body, and anything that goes wrong on the wire is reported as a timeout.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const OPENRTB_VERSION_HEADER: &str = "x-openrtb-version";
pub const DEFAULT_OPENRTB_VERSION: &str = "2.5";
pub const DEFAULT_BID_TIMEOUT: Duration = Duration::from_millis(300);

/// What came back from one bidder, before parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum RawBidResponse {
    /// Deadline exceeded or transport error.
    Timeout(String),
    /// 204 or zero-length body.
    Empty,
    Body { status: u16, body: Vec<u8> },
}

#[async_trait]
pub trait BidderTransport: Send + Sync {
    async fn send(&self, endpoint: &str, payload: Arc<Vec<u8>>) -> RawBidResponse;
}

pub struct HttpBidder {
    client: Client,
    timeout: Duration,
    openrtb_version: String,
}

impl HttpBidder {
    pub fn new(timeout: Duration, openrtb_version: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(32)
            .build()
            .context("Failed to build bidder HTTP client")?;
        Ok(Self {
            client,
            timeout,
            openrtb_version: openrtb_version.into(),
        })
    }

    async fn exchange(&self, endpoint: &str, payload: Vec<u8>) -> std::result::Result<RawBidResponse, reqwest::Error> {
        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(OPENRTB_VERSION_HEADER, self.openrtb_version.as_str())
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            return Ok(RawBidResponse::Empty);
        }
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(RawBidResponse::Empty);
        }
        Ok(RawBidResponse::Body {
            status: status.as_u16(),
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl BidderTransport for HttpBidder {
    async fn send(&self, endpoint: &str, payload: Arc<Vec<u8>>) -> RawBidResponse {
        match tokio::time::timeout(self.timeout, self.exchange(endpoint, payload.as_ref().clone())).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                debug!(endpoint, error = %e, "Bid request failed");
                RawBidResponse::Timeout(e.to_string())
            }
            Err(_) => RawBidResponse::Timeout(format!("no response within {}ms", self.timeout.as_millis())),
        }
    }
}
