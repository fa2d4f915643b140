//! Per-request context and parsing of the consumed query parameters.
//!
//! Geo-IP and user-agent parsing are collaborators behind [`GeoLookup`] and
//! [`DeviceClassifier`]; the HTTP layer hands us a [`RawRequest`] with the
//! query string and the few headers we fall back to.

use std::collections::HashMap;
use std::net::IpAddr;

use reqwest::Url;
use uuid::Uuid;

use crate::error::{EngineError, RejectReason};

pub const USER_AGENT_MACRO: &str = "[USER_AGENT]";
pub const PAGE_URL_MACRO: &str = "[PAGE_URL]";
const APP_NAME_MACRO: &str = "[APP_NAME]";
const BUNDLE_ID_MACRO: &str = "[BUNDLE_ID]";
const APP_STORE_URL_MACRO: &str = "[APP_STORE_URL]";
const DO_NOT_TRACK_MACRO: &str = "[DO_NOT_TRACK]";

pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 360;

/// What the HTTP layer extracted from the inbound request.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    pub query: HashMap<String, String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub forwarded_for: Option<String>,
    pub remote_addr: Option<IpAddr>,
    /// Country code set by the edge in front of us, if any.
    pub geo_hint: Option<String>,
}

impl RawRequest {
    /// Query value, empty when absent.
    pub fn param(&self, key: &str) -> &str {
        self.query.get(key).map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Vast,
    Vpaid,
}

impl ResponseFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseFormat::Vast => "vast",
            ResponseFormat::Vpaid => "vpaid",
        }
    }
}

/// Request type as reported to telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Direct,
    Targeting,
    Vpaid,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Direct => "direct",
            RequestKind::Targeting => "targeting",
            RequestKind::Vpaid => "vpaid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceQuote {
    /// Serve at each tag's own price.
    Origin,
    Fixed(f64),
    /// The inbound value did not parse.
    Unparsable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Desktop,
    InApp,
    Unknown,
}

impl Platform {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "desktop" => Platform::Desktop,
            "in-app" => Platform::InApp,
            _ => Platform::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Desktop => "desktop",
            Platform::InApp => "in-app",
            Platform::Unknown => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Desktop,
    Mobile,
    Undefined,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Undefined => "undefined",
        }
    }
}

/// Resolves a country code for the request.
pub trait GeoLookup: Send + Sync {
    fn country(&self, ip: Option<IpAddr>, hint: Option<&str>) -> Option<String>;
}

/// Trusts the country header set by the edge. Anything but a two-letter code is ignored.
#[derive(Debug, Default, Clone)]
pub struct HeaderGeoLookup;

impl GeoLookup for HeaderGeoLookup {
    fn country(&self, _ip: Option<IpAddr>, hint: Option<&str>) -> Option<String> {
        let code = hint?.trim();
        (code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()))
            .then(|| code.to_ascii_uppercase())
    }
}

pub trait DeviceClassifier: Send + Sync {
    fn classify(&self, user_agent: &str) -> DeviceType;
}

/// Keyword based classifier. An empty user agent is undefined.
#[derive(Debug, Default, Clone)]
pub struct KeywordDeviceClassifier;

const MOBILE_MARKERS: &[&str] = &[
    "mobile",
    "android",
    "iphone",
    "ipad",
    "ipod",
    "windows phone",
    "blackberry",
    "opera mini",
];

impl DeviceClassifier for KeywordDeviceClassifier {
    fn classify(&self, user_agent: &str) -> DeviceType {
        if user_agent.trim().is_empty() {
            return DeviceType::Undefined;
        }
        let lower = user_agent.to_ascii_lowercase();
        if MOBILE_MARKERS.iter().any(|marker| lower.contains(marker)) {
            DeviceType::Mobile
        } else {
            DeviceType::Desktop
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub kind: RequestKind,
    pub response_format: ResponseFormat,
    pub vast_version: u8,
    pub publisher_targeting_id: String,
    /// Set once the publisher is resolved from the snapshot.
    pub publisher_id: Option<u64>,
    pub price: PriceQuote,
    pub ip: Option<IpAddr>,
    pub user_agent: String,
    pub country: String,
    pub device_type: DeviceType,
    pub domain: String,
    pub referrer: String,
    /// Platform of the publisher link, set during the pipeline.
    pub platform: Platform,
    /// `in-app` for in-app links, the device type on desktop links.
    pub device_platform_type: String,
    pub app_name: String,
    pub bundle_id: String,
    pub app_store_url: String,
    pub width: u32,
    pub height: u32,
    pub do_not_track: bool,
    /// Inbound query, read by required-parameter checks and URL macro translation.
    pub params: HashMap<String, String>,
}

impl RequestContext {
    /// Empty context for the given targeting id. Mostly useful for tests.
    pub fn new(publisher_targeting_id: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            kind: RequestKind::Targeting,
            response_format: ResponseFormat::Vast,
            vast_version: 2,
            publisher_targeting_id: publisher_targeting_id.into(),
            publisher_id: None,
            price: PriceQuote::Fixed(0.0),
            ip: None,
            user_agent: String::new(),
            country: String::new(),
            device_type: DeviceType::Undefined,
            domain: String::new(),
            referrer: String::new(),
            platform: Platform::Unknown,
            device_platform_type: String::new(),
            app_name: String::new(),
            bundle_id: String::new(),
            app_store_url: String::new(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            do_not_track: false,
            params: HashMap::new(),
        }
    }

    /// Requested price; zero for origin or unparsable quotes.
    pub fn requested_price(&self) -> f64 {
        match self.price {
            PriceQuote::Fixed(price) => price,
            PriceQuote::Origin | PriceQuote::Unparsable => 0.0,
        }
    }

    pub fn uses_origin_price(&self) -> bool {
        self.price == PriceQuote::Origin
    }

    pub fn set_platform(&mut self, platform: Platform) {
        self.platform = platform;
        self.device_platform_type = match platform {
            Platform::Desktop => self.device_type.as_str().to_string(),
            Platform::InApp => "in-app".to_string(),
            Platform::Unknown => String::new(),
        };
    }

    /// Replaces an unparsable price with the link's price, or rejects the request.
    pub fn apply_price_fallback(&mut self, link_price: f64) -> Result<(), EngineError> {
        if self.price != PriceQuote::Unparsable {
            return Ok(());
        }
        if link_price > 0.0 {
            self.price = PriceQuote::Fixed(link_price);
            Ok(())
        } else {
            Err(EngineError::PriceParse {
                targeting_id: self.publisher_targeting_id.clone(),
            })
        }
    }

    /// Price to report for a served tag.
    pub fn served_price(&self, tag_price: f64) -> f64 {
        if self.uses_origin_price() {
            tag_price
        } else {
            self.requested_price()
        }
    }

    pub fn ip_string(&self) -> String {
        self.ip.map(|ip| ip.to_string()).unwrap_or_default()
    }
}

/// Price as sent by publishers: `origin`, or a number with stray slashes and a comma decimal.
/// Anything that is not a finite, non-negative number is unparsable.
pub fn parse_price(raw: &str) -> PriceQuote {
    if raw == "origin" {
        return PriceQuote::Origin;
    }
    let cleaned = raw.trim_matches('/').replacen(',', ".", 1);
    match cleaned.parse::<f64>() {
        Ok(price) if price.is_finite() && price >= 0.0 => PriceQuote::Fixed(price),
        _ => PriceQuote::Unparsable,
    }
}

/// Explicit value, else the first `X-Forwarded-For` entry, else the peer address.
pub fn resolve_ip(explicit: &str, raw: &RawRequest) -> Option<IpAddr> {
    let explicit = explicit.trim();
    if !explicit.is_empty() {
        return explicit.parse().ok();
    }
    if let Some(forwarded) = raw.forwarded_for.as_deref().filter(|f| !f.trim().is_empty()) {
        return forwarded
            .split(',')
            .map(str::trim)
            .find(|candidate| !candidate.is_empty())
            .and_then(|candidate| candidate.parse().ok());
    }
    raw.remote_addr
}

/// Returns `(referrer, domain)` for a page URL, falling back to the `Referer` header.
///
/// Values without a dot are ignored. The domain is lower-cased with the first
/// `www.` removed.
pub fn resolve_page(page_url: &str, referer: Option<&str>) -> Option<(String, String)> {
    let page = if page_url.is_empty() || page_url == PAGE_URL_MACRO {
        referer.unwrap_or("")
    } else {
        page_url
    };
    if !page.contains('.') {
        return None;
    }
    let referrer = page.to_string();
    Some((referrer, normalize_domain(page).unwrap_or_default()))
}

pub fn normalize_domain(page: &str) -> Option<String> {
    let cleaned = page.to_lowercase().trim().replacen("www.", "", 1);
    let with_scheme = if cleaned.contains("://") {
        cleaned
    } else {
        format!("http://{}", cleaned)
    };
    let parsed = Url::parse(&with_scheme).or_else(|_| Url::parse(&with_scheme.replace('%', "")));
    parsed.ok().and_then(|url| url.host_str().map(str::to_string))
}

fn unless_macro(value: &str, placeholder: &str) -> String {
    if value == placeholder {
        String::new()
    } else {
        value.to_string()
    }
}

fn positive_dimension(raw: &str, default: u32) -> u32 {
    raw.parse::<u32>().ok().filter(|v| *v > 0).unwrap_or(default)
}

/// Builds a [`RequestContext`] from the targeting query string.
pub struct RequestParser<G, D> {
    geo: G,
    devices: D,
}

impl Default for RequestParser<HeaderGeoLookup, KeywordDeviceClassifier> {
    fn default() -> Self {
        Self::new(HeaderGeoLookup, KeywordDeviceClassifier)
    }
}

impl<G: GeoLookup, D: DeviceClassifier> RequestParser<G, D> {
    pub fn new(geo: G, devices: D) -> Self {
        Self { geo, devices }
    }

    pub fn parse(&self, raw: &RawRequest) -> Result<RequestContext, EngineError> {
        let targeting_id = raw.param("pub");
        if targeting_id.is_empty() {
            return Err(EngineError::Rejected(RejectReason::MissingTargetingId));
        }

        let mut ctx = RequestContext::new(targeting_id);
        let (format, version) = match raw.param("response") {
            "vast20vpaid" => (ResponseFormat::Vpaid, 2),
            "vast30vpaid" => (ResponseFormat::Vpaid, 3),
            "vast30wrapper" => (ResponseFormat::Vast, 3),
            _ => (ResponseFormat::Vast, 2),
        };
        ctx.response_format = format;
        ctx.vast_version = version;
        if format == ResponseFormat::Vpaid {
            ctx.kind = RequestKind::Vpaid;
        }

        ctx.price = parse_price(raw.param("price"));
        ctx.ip = resolve_ip(raw.param("ip"), raw);
        ctx.country = self
            .geo
            .country(ctx.ip, raw.geo_hint.as_deref())
            .unwrap_or_default();

        let ua = raw.param("ua");
        ctx.user_agent = if ua.is_empty() || ua == USER_AGENT_MACRO {
            raw.user_agent.clone().unwrap_or_default()
        } else {
            ua.to_string()
        };
        ctx.device_type = self.devices.classify(&ctx.user_agent);

        ctx.width = positive_dimension(raw.param("w"), DEFAULT_WIDTH);
        ctx.height = positive_dimension(raw.param("h"), DEFAULT_HEIGHT);

        if let Some((referrer, domain)) = resolve_page(raw.param("url"), raw.referer.as_deref()) {
            ctx.referrer = referrer;
            ctx.domain = domain;
        }

        ctx.app_name = unless_macro(raw.param("appname"), APP_NAME_MACRO);
        ctx.bundle_id = unless_macro(raw.param("bundle_id"), BUNDLE_ID_MACRO);
        ctx.app_store_url = unless_macro(raw.param("appstoreurl"), APP_STORE_URL_MACRO);

        let dnt = raw.param("dnt");
        ctx.do_not_track = dnt != DO_NOT_TRACK_MACRO && (dnt == "1" || dnt == "true");

        ctx.params = raw.query.clone();
        Ok(ctx)
    }

    /// Country and device for the direct path, which has no `pub` parameter.
    pub fn classify(&self, ip: Option<IpAddr>, user_agent: &str, raw: &RawRequest) -> (String, DeviceType) {
        let country = self.geo.country(ip, raw.geo_hint.as_deref()).unwrap_or_default();
        (country, self.devices.classify(user_agent))
    }
}
