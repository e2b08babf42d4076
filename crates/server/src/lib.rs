//! HTTP surface of the fleetguard orchestration engine.

pub mod api;
pub mod metrics;
pub mod state;
