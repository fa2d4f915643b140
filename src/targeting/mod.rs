//! Candidate building, elimination filters and yield-based selection.

pub mod candidate;
pub mod filters;
pub mod selection;
pub mod url_mapping;

pub use candidate::{CandidateContext, CandidateSet, Elimination};
pub use filters::{FilterPipeline, PoolKind, SelectionPool};
pub use selection::{
    select_many, select_one, OptimizationStrategy, SelectionParams, DEFAULT_MULTI_PICK, DEFAULT_STUDY_REQUESTS,
};
pub use url_mapping::{map_destination_url, merge_request_query};
