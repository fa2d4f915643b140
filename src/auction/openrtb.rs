//! OpenRTB 2.5 request and response subset used by the auction.

use serde::{Deserialize, Serialize};

use crate::request::RequestContext;

pub const CURRENCY: &str = "USD";
/// Advertised to bidders in `tmax`, in milliseconds.
pub const TMAX_MS: u64 = 300;
/// Second-price auction type.
pub const AUCTION_TYPE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidRequest {
    pub id: String,
    pub imp: Vec<Impression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<Site>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<App>,
    pub device: Device,
    pub user: User,
    pub at: u8,
    pub tmax: u64,
    pub cur: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Impression {
    pub id: String,
    pub video: Video,
    pub bidfloor: f64,
    pub bidfloorcur: String,
    pub secure: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub mimes: Vec<String>,
    pub minduration: u32,
    pub maxduration: u32,
    pub protocols: Vec<u8>,
    pub w: u32,
    pub h: u32,
    pub startdelay: i32,
    pub linearity: u8,
    pub sequence: u8,
    pub api: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub ua: String,
    pub geo: Geo,
    pub dnt: u8,
    pub ip: String,
    pub js: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub geo: Geo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub domain: String,
    pub page: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub bundle: String,
    pub storeurl: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BidResponse {
    pub id: String,
    pub seatbid: Vec<SeatBid>,
    pub cur: String,
}

impl BidResponse {
    /// First bid of the first seat. Later seats and bids are ignored.
    pub fn first_bid(&self) -> Option<&Bid> {
        self.seatbid.first().and_then(|seat| seat.bid.first())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeatBid {
    pub bid: Vec<Bid>,
    pub seat: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bid {
    pub id: String,
    pub impid: String,
    pub price: f64,
    pub adid: String,
    pub nurl: String,
    pub adm: String,
    pub cid: String,
    pub crid: String,
}

/// One video impression priced at `bid_floor`, with a site or app block
/// depending on the link platform.
pub fn compose_bid_request(ctx: &RequestContext, bid_floor: f64) -> BidRequest {
    let geo = Geo {
        country: ctx.country.clone(),
    };
    let in_app = ctx.device_platform_type == "in-app";

    BidRequest {
        id: ctx.request_id.to_string(),
        imp: vec![Impression {
            id: "1".to_string(),
            video: Video {
                mimes: vec!["video/mp4".to_string()],
                minduration: 1,
                maxduration: 3600,
                protocols: vec![2, 3, 5, 6],
                w: ctx.width,
                h: ctx.height,
                startdelay: 0,
                linearity: 1,
                sequence: 1,
                api: vec![1, 2],
            },
            bidfloor: bid_floor,
            bidfloorcur: CURRENCY.to_string(),
            secure: 1,
        }],
        site: (!in_app).then(|| Site {
            domain: ctx.domain.clone(),
            page: ctx.referrer.clone(),
        }),
        app: in_app.then(|| App {
            name: ctx.app_name.clone(),
            bundle: ctx.bundle_id.clone(),
            storeurl: ctx.app_store_url.clone(),
        }),
        device: Device {
            ua: ctx.user_agent.clone(),
            geo: geo.clone(),
            dnt: u8::from(ctx.do_not_track),
            ip: ctx.ip_string(),
            js: 1,
        },
        user: User { geo },
        at: AUCTION_TYPE,
        tmax: TMAX_MS,
        cur: vec![CURRENCY.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Platform;
    use serde_json::json;

    fn ctx() -> RequestContext {
        let mut ctx = RequestContext::new("tid");
        ctx.country = "US".into();
        ctx.user_agent = "Mozilla/5.0".into();
        ctx.ip = Some("203.0.113.5".parse().unwrap());
        ctx.domain = "news.example".into();
        ctx.referrer = "https://news.example/a".into();
        ctx.do_not_track = true;
        ctx
    }

    #[test]
    fn test_site_request_shape() {
        let mut ctx = ctx();
        ctx.set_platform(Platform::Desktop);
        let value = serde_json::to_value(compose_bid_request(&ctx, 2.0)).unwrap();

        assert_eq!(value["cur"], json!(["USD"]));
        assert_eq!(value["at"], 2);
        assert_eq!(value["tmax"], 300);
        assert_eq!(value["imp"][0]["id"], "1");
        assert_eq!(value["imp"][0]["bidfloor"], 2.0);
        assert_eq!(value["imp"][0]["video"]["protocols"], json!([2, 3, 5, 6]));
        assert_eq!(value["imp"][0]["video"]["w"], 640);
        assert_eq!(value["device"]["geo"]["country"], "US");
        assert_eq!(value["device"]["dnt"], 1);
        assert_eq!(value["device"]["ip"], "203.0.113.5");
        assert_eq!(value["user"]["geo"]["country"], "US");
        assert_eq!(value["site"]["domain"], "news.example");
        assert!(value.get("app").is_none());
    }

    #[test]
    fn test_in_app_request_uses_app_block() {
        let mut ctx = ctx();
        ctx.app_name = "Game".into();
        ctx.bundle_id = "com.example.game".into();
        ctx.set_platform(Platform::InApp);
        let request = compose_bid_request(&ctx, 1.0);
        assert!(request.site.is_none());
        assert_eq!(request.app.unwrap().bundle, "com.example.game");
    }

    #[test]
    fn test_first_bid() {
        let response: BidResponse = serde_json::from_value(json!({
            "id": "r",
            "seatbid": [{"bid": [{"price": 5.6, "adm": "<VAST/>"}, {"price": 9.0}]}]
        }))
        .unwrap();
        assert_eq!(response.first_bid().unwrap().price, 5.6);
        assert!(BidResponse::default().first_bid().is_none());
    }
}
