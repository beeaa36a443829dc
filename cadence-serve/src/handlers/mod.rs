//! API handlers.

pub mod actions;
pub mod credits;
pub mod health;
pub mod jobs;
pub mod schedule;
