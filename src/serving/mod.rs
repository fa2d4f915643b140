//! Serving configuration: snapshot model, time-boxed cache, blob sources
//! and domain lists.

pub mod cache;
pub mod data;
pub mod domain_lists;
pub mod source;

pub use cache::{SnapshotCache, DEFAULT_SNAPSHOT_TTL};
pub use data::{
    AdTagConfig, AdTagTargeting, AdvertiserConfig, DomainListRef, ListMode, ParameterMapping,
    PublisherLinkConfig, ServingSnapshot, TotalStats, YieldStats, WORLDWIDE_GEO,
};
pub use domain_lists::{domain_passes, DomainListStore, InMemoryDomainLists, ListMark};
pub use source::{FileSnapshotSource, HttpSnapshotSource, SnapshotSource};
