//! Serving configuration snapshot.
//!
//! One JSON blob carries every section. Field names follow the blob as it is
//! written by the admin side, which is why a few structs use PascalCase keys.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::CacheError;

/// Geo-targeting entry that matches every country.
pub const WORLDWIDE_GEO: &str = "O1";

/// Per-targeting (or per-geo) yield statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YieldStats {
    pub requests: i64,
    pub impressions: i64,
    pub fill_rate: f64,
    pub margin: f64,
    pub erpr: f64,
}

/// Trailing-month totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct TotalStats {
    pub impressions: i64,
    pub requests: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdTagTargeting {
    #[serde(rename = "geo_targeting")]
    pub geo: Vec<String>,
    pub device_type: String,
}

impl AdTagTargeting {
    /// Worldwide marker or an exact country match. An empty country never matches.
    pub fn matches_country(&self, country: &str) -> bool {
        self.geo
            .iter()
            .any(|g| g == WORLDWIDE_GEO || (!country.is_empty() && g.eq_ignore_ascii_case(country)))
    }
}

/// How a domain list is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    /// Only domains marked white pass.
    White,
    /// Domains marked black are rejected.
    Black,
    /// List id set but mode not recognised; nothing is rejected on mode.
    Unspecified,
}

impl ListMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "white" => ListMode::White,
            "black" => ListMode::Black,
            _ => ListMode::Unspecified,
        }
    }
}

/// Reference to an external domain list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainListRef {
    pub id: u64,
    pub mode: ListMode,
}

impl DomainListRef {
    /// A list id of zero means no list is configured.
    pub fn from_parts(id: u64, mode: &str) -> Option<Self> {
        (id > 0).then(|| DomainListRef {
            id,
            mode: ListMode::parse(mode),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdTagConfig {
    #[serde(rename = "id")]
    pub ad_tag_id: u64,
    /// Destination URL template.
    pub url: String,
    pub supports_vast: bool,
    pub is_active: bool,
    #[serde(rename = "is_ad_tag_pub_active")]
    pub is_tag_active: bool,
    pub is_test: bool,
    pub advertiser_platform_type_id: u64,
    pub targeting: AdTagTargeting,
    pub publisher_id: u64,
    pub publisher_targeting_id: String,
    pub price: f64,
    #[serde(rename = "could_be_used_for_targeting")]
    pub usable_for_targeting: bool,
    #[serde(rename = "erpr_by_geo_for_last_week")]
    pub yield_by_geo: HashMap<String, YieldStats>,
    pub total_stats: TotalStats,
    #[serde(rename = "erpr_by_targeting_id")]
    pub yield_by_targeting_id: HashMap<String, YieldStats>,
    /// targeting id -> domain -> stats
    #[serde(rename = "fill_rate_by_domain")]
    pub fill_rate_by_domain: HashMap<String, HashMap<String, YieldStats>>,
    pub domains_list_id: u64,
    pub domains_list_type: String,
}

impl AdTagConfig {
    pub fn is_serving(&self) -> bool {
        self.is_active && self.is_tag_active
    }

    pub fn domain_list(&self) -> Option<DomainListRef> {
        DomainListRef::from_parts(self.domains_list_id, &self.domains_list_type)
    }

    /// Stats for a targeting id; zeroed when the tag has never served it.
    pub fn stats_for(&self, targeting_id: &str) -> YieldStats {
        self.yield_by_targeting_id
            .get(targeting_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn domain_fill_rate(&self, targeting_id: &str, domain: &str) -> Option<f64> {
        self.fill_rate_by_domain
            .get(targeting_id)
            .and_then(|by_domain| by_domain.get(domain))
            .map(|stats| stats.fill_rate)
    }
}

/// Publisher link. Keys are the admin side's exported field names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherLinkConfig {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "DomainsListID")]
    pub domains_list_id: u64,
    #[serde(rename = "DomainsListType")]
    pub domains_list_type: String,
    #[serde(rename = "Platform")]
    pub platform: String,
    #[serde(rename = "Price")]
    pub price: f64,
    #[serde(rename = "Optimization")]
    pub optimization: String,
    #[serde(rename = "StudyRequests")]
    pub study_requests: i64,
}

impl PublisherLinkConfig {
    pub fn domain_list(&self) -> Option<DomainListRef> {
        DomainListRef::from_parts(self.domains_list_id, &self.domains_list_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertiserConfig {
    pub id: u64,
    #[serde(rename = "rtb_url")]
    pub rtb_integration_url: String,
}

/// Translation of one query parameter between our platform and an advertiser platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterMapping {
    pub shortcut: String,
    pub macros: String,
    pub original_shortcut: String,
    pub original_macros: String,
    pub is_required: bool,
    pub platform: String,
}

/// parameter name -> platform -> mapping
pub type PlatformParameters = HashMap<String, HashMap<String, ParameterMapping>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingSnapshot {
    pub ad_tags: BTreeMap<String, AdTagConfig>,
    /// advertiser platform id -> parameter name -> platform -> mapping
    pub parameters_mapping: HashMap<u64, PlatformParameters>,
    /// parameter name -> platform -> advertiser platform id -> mapping
    pub our_platform_parameters_mapping: HashMap<String, HashMap<String, HashMap<u64, ParameterMapping>>>,
    pub publisher_targeting_id_map: HashMap<String, u64>,
    #[serde(rename = "targeting_link_ad_tags_i_ds")]
    pub link_ad_tag_ids: HashMap<String, Vec<String>>,
    pub publisher_links: HashMap<String, PublisherLinkConfig>,
    pub advertisers: BTreeMap<u64, AdvertiserConfig>,
}

impl ServingSnapshot {
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).context("Failed to parse serving snapshot")
    }

    pub fn ad_tag(&self, id: &str) -> Result<&AdTagConfig, CacheError> {
        self.ad_tags
            .get(id)
            .ok_or_else(|| CacheError::not_found("ad tag", id))
    }

    /// Tags for the given ids; unknown ids are skipped.
    pub fn ad_tags_by_ids<'a>(&'a self, ids: &'a [String]) -> impl Iterator<Item = (&'a String, &'a AdTagConfig)> + 'a {
        ids.iter().filter_map(move |id| self.ad_tags.get_key_value(id.as_str()))
    }

    pub fn parameter_mapping(&self, advertiser_platform_id: u64) -> Result<&PlatformParameters, CacheError> {
        self.parameters_mapping
            .get(&advertiser_platform_id)
            .ok_or_else(|| CacheError::not_found("advertiser platform", advertiser_platform_id))
    }

    pub fn our_platform_parameter_mapping(
        &self,
        name: &str,
        advertiser_platform_id: u64,
        platform: &str,
    ) -> Result<&ParameterMapping, CacheError> {
        self.our_platform_parameters_mapping
            .get(name)
            .and_then(|by_platform| by_platform.get(platform))
            .and_then(|by_advertiser| by_advertiser.get(&advertiser_platform_id))
            .ok_or_else(|| {
                CacheError::not_found(
                    "parameter mapping",
                    format!("{}/{}/{}", name, platform, advertiser_platform_id),
                )
            })
    }

    pub fn publisher_id_by_targeting_id(&self, targeting_id: &str) -> Result<u64, CacheError> {
        self.publisher_targeting_id_map
            .get(targeting_id)
            .copied()
            .ok_or_else(|| CacheError::not_found("publisher targeting id", targeting_id))
    }

    pub fn ad_tag_ids_for_link(&self, link_id: &str) -> Result<&[String], CacheError> {
        self.link_ad_tag_ids
            .get(link_id)
            .map(Vec::as_slice)
            .ok_or_else(|| CacheError::not_found("publisher link tags", link_id))
    }

    pub fn link(&self, link_id: &str) -> Result<&PublisherLinkConfig, CacheError> {
        self.publisher_links
            .get(link_id)
            .ok_or_else(|| CacheError::not_found("publisher link", link_id))
    }

    /// Bidders in ascending advertiser id order.
    pub fn advertisers(&self) -> impl Iterator<Item = &AdvertiserConfig> {
        self.advertisers.values()
    }
}
