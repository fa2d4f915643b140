//! Error taxonomy for the decision path.
//!
//! Cache errors distinguish a failed refresh from a key that is simply absent.
//! Engine errors are what the HTTP layer turns into a no-content response.

use std::fmt;

/// Errors returned by [`crate::serving::SnapshotCache`] accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Fetching or parsing the serving blob failed and no usable snapshot exists.
    StaleData(String),
    /// The key is absent from a fresh snapshot.
    NotFound { kind: &'static str, key: String },
}

impl CacheError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        CacheError::NotFound {
            kind,
            key: key.to_string(),
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::StaleData(reason) => write!(f, "serving data unavailable: {}", reason),
            CacheError::NotFound { kind, key } => write!(f, "no data for {} {}", kind, key),
        }
    }
}

impl std::error::Error for CacheError {}

/// Why a request was turned away before any candidate was considered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingTargetingId,
    MissingAdTagId,
    /// Direct ad tag is inactive and not flagged as test.
    NotActive,
    /// Domain is marked black in the global default list.
    DomainBlacklisted,
    /// Domain fails the publisher link's own list.
    DomainNotAllowed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingTargetingId => write!(f, "no publisher targeting id"),
            RejectReason::MissingAdTagId => write!(f, "no adtagpubid in request"),
            RejectReason::NotActive => write!(f, "ad tag is not active"),
            RejectReason::DomainBlacklisted => write!(f, "domain is in the default black list"),
            RejectReason::DomainNotAllowed => write!(f, "domain is not allowed for this link"),
        }
    }
}

/// Outcome of the decision path that ends in an empty response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    StaleData(String),
    NotFound(String),
    /// Inbound price was malformed and the link has no positive fallback price.
    PriceParse { targeting_id: String },
    /// Filtering or selection produced nothing. Normal no-fill.
    NoCandidate,
    Rejected(RejectReason),
    /// Building the outbound payload or destination failed.
    Encoding(String),
}

impl EngineError {
    /// No-fill and rejections are expected traffic, not faults.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            EngineError::NoCandidate | EngineError::NotFound(_) | EngineError::Rejected(_)
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::StaleData(reason) => write!(f, "stale serving data: {}", reason),
            EngineError::NotFound(what) => write!(f, "not found: {}", what),
            EngineError::PriceParse { targeting_id } => {
                write!(f, "price was not set, targeting_id = {}", targeting_id)
            }
            EngineError::NoCandidate => write!(f, "no candidate"),
            EngineError::Rejected(reason) => write!(f, "rejected: {}", reason),
            EngineError::Encoding(reason) => write!(f, "encoding failed: {}", reason),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<CacheError> for EngineError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::StaleData(reason) => EngineError::StaleData(reason),
            not_found @ CacheError::NotFound { .. } => EngineError::NotFound(not_found.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_error_maps_to_engine_error() {
        let stale: EngineError = CacheError::StaleData("store down".into()).into();
        assert_eq!(stale, EngineError::StaleData("store down".into()));

        let missing: EngineError = CacheError::not_found("publisher link", "abc").into();
        assert_eq!(
            missing,
            EngineError::NotFound("no data for publisher link abc".into())
        );
        assert!(missing.is_expected());
    }

    #[test]
    fn test_no_candidate_is_expected_but_encoding_is_not() {
        assert!(EngineError::NoCandidate.is_expected());
        assert!(!EngineError::Encoding("bad url".into()).is_expected());
        assert!(!EngineError::StaleData("x".into()).is_expected());
    }
}
