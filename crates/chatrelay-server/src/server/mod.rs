//! HTTP surface of the relay.

pub mod error;
pub mod routes;

pub use error::ApiError;
pub use routes::{AppState, build_router};
