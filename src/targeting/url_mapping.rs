//! Destination URL rewriting.
//!
//! Query keys come out sorted so the same inputs always produce the same URL.

use std::collections::{BTreeMap, HashMap};

use reqwest::Url;

use crate::error::EngineError;
use crate::request::RequestContext;
use crate::serving::data::PlatformParameters;

fn parse_template(template: &str) -> Result<Url, EngineError> {
    Url::parse(template).map_err(|e| EngineError::Encoding(format!("bad destination url {}: {}", template, e)))
}

/// First value per key, as a sorted map.
fn template_query(url: &Url) -> BTreeMap<String, String> {
    let mut query = BTreeMap::new();
    for (key, value) in url.query_pairs() {
        query.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }
    query
}

fn with_query(mut url: Url, query: BTreeMap<String, String>) -> String {
    if query.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(query.iter());
    }
    url.to_string()
}

/// Translates the template's query through the advertiser platform's parameter mapping.
///
/// Mapped keys take the request's user agent, IP or referrer for the `ua`,
/// `ip` and `url` shortcuts, otherwise the inbound value unless it is still
/// the placeholder macro. Unmapped keys keep their template value.
pub fn map_destination_url(
    template: &str,
    parameters: &PlatformParameters,
    ctx: &RequestContext,
) -> Result<String, EngineError> {
    let url = parse_template(template)?;
    let platform = ctx.platform.as_str();
    let mut merged = BTreeMap::new();

    for (key, value) in template_query(&url) {
        let Some(by_platform) = parameters.get(&key) else {
            merged.insert(key, value);
            continue;
        };
        let mapping = by_platform.get(platform).cloned().unwrap_or_default();
        match mapping.original_shortcut.as_str() {
            "ua" => {
                merged.insert(key, ctx.user_agent.clone());
            }
            "ip" => {
                if let Some(ip) = ctx.ip {
                    merged.insert(key, ip.to_string());
                }
            }
            "url" => {
                merged.insert(key, ctx.referrer.clone());
            }
            shortcut => {
                if let Some(inbound) = ctx.params.get(shortcut) {
                    if !inbound.is_empty() && *inbound != mapping.original_macros {
                        merged.insert(key, inbound.clone());
                    }
                }
            }
        }
    }

    Ok(with_query(url, merged))
}

/// Direct path: every template key takes the inbound value of the same key.
pub fn merge_request_query(template: &str, inbound: &HashMap<String, String>) -> Result<String, EngineError> {
    let url = parse_template(template)?;
    let merged = template_query(&url)
        .into_keys()
        .map(|key| {
            let value = inbound.get(&key).cloned().unwrap_or_default();
            (key, value)
        })
        .collect();
    Ok(with_query(url, merged))
}
