//! Cadence HTTP service
//!
//! Exposes the tick trigger and manual actions over HTTP, and hosts the worker
//! pool and hold-expiry sweeper that run alongside it.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod runtime;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
