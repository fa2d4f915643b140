//! HTTP surface: query extraction and status codes around the decision engine.

pub mod middleware;
pub mod routes;

pub use middleware::request_logging;
pub use routes::{create_router, AppState};
