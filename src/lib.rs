//! Rotator Backend Library
//!
//! Ad-traffic decision engine: snapshot cache, targeting filters, yield-based
//! selection and the RTB auction. `main.rs` wraps it in an HTTP server.

pub mod api;
pub mod auction;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod request;
pub mod serving;
pub mod targeting;
pub mod telemetry;

pub use config::EngineConfig;
pub use engine::DecisionEngine;
pub use error::{CacheError, EngineError};
