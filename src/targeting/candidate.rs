//! Candidates for one request.

use crate::serving::{AdTagConfig, ServingSnapshot};
use crate::error::CacheError;

/// Stage that eliminated a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elimination {
    Price,
    DeviceType,
    RequiredParameter,
    DomainPolicy,
    /// Failed geo targeting only. Eligible for the geo fallback.
    Geo,
}

/// One ad tag plus what this request derived for it.
#[derive(Debug, Clone)]
pub struct CandidateContext<'a> {
    pub ad_tag_id: &'a str,
    pub tag: &'a AdTagConfig,
    eliminated_by: Option<Elimination>,
    /// Weight used for ranking, filled in by selection.
    pub yield_value: f64,
    /// Requests left until the study threshold, filled in by selection.
    pub study_left: i64,
}

impl<'a> CandidateContext<'a> {
    pub fn new(ad_tag_id: &'a str, tag: &'a AdTagConfig) -> Self {
        Self {
            ad_tag_id,
            tag,
            eliminated_by: None,
            yield_value: 0.0,
            study_left: 0,
        }
    }

    pub fn is_eliminated(&self) -> bool {
        self.eliminated_by.is_some()
    }

    pub fn eliminated_by(&self) -> Option<Elimination> {
        self.eliminated_by
    }

    /// The first elimination sticks; later stages cannot overwrite or clear it.
    pub fn eliminate(&mut self, reason: Elimination) {
        if self.eliminated_by.is_none() {
            self.eliminated_by = Some(reason);
        }
    }

    pub fn geo_check_failed(&self) -> bool {
        self.eliminated_by == Some(Elimination::Geo)
    }
}

fn by_tag_id(candidates: &mut [CandidateContext<'_>]) {
    candidates.sort_by(|a, b| {
        a.tag
            .ad_tag_id
            .cmp(&b.tag.ad_tag_id)
            .then_with(|| a.ad_tag_id.cmp(b.ad_tag_id))
    });
}

/// Builds candidate lists from a snapshot. Lists come back in ascending ad-tag id order.
pub struct CandidateSet;

impl CandidateSet {
    /// Tags attached to a publisher link. Ids missing from the snapshot are skipped.
    pub fn for_link<'a>(snapshot: &'a ServingSnapshot, link_id: &str) -> Result<Vec<CandidateContext<'a>>, CacheError> {
        let ids = snapshot.ad_tag_ids_for_link(link_id)?;
        let mut candidates: Vec<_> = snapshot
            .ad_tags_by_ids(ids)
            .map(|(id, tag)| CandidateContext::new(id.as_str(), tag))
            .collect();
        by_tag_id(&mut candidates);
        candidates.dedup_by(|a, b| a.ad_tag_id == b.ad_tag_id);
        Ok(candidates)
    }

    /// Legacy global matching: every serving tag of the publisher usable for targeting.
    pub fn for_publisher<'a>(snapshot: &'a ServingSnapshot, targeting_id: &str) -> Vec<CandidateContext<'a>> {
        let mut candidates: Vec<_> = snapshot
            .ad_tags
            .iter()
            .filter(|(_, tag)| {
                tag.publisher_targeting_id == targeting_id && tag.usable_for_targeting && tag.is_serving()
            })
            .map(|(id, tag)| CandidateContext::new(id.as_str(), tag))
            .collect();
        by_tag_id(&mut candidates);
        candidates
    }
}
