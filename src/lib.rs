//! Sensorstream: broker cluster lifecycle orchestration and the sensor telemetry pipeline.

mod app;
mod config;
#[cfg(test)]
mod config_test;
pub mod control_plane;
pub mod endpoint;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod graph;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod poll;

// Public exports for binaries.
pub use crate::{app::App, config::Config};
