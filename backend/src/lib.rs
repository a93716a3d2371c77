//! Irrigation Backend Library
//!
//! This library provides the core of the irrigation service, including:
//! - Schedule execution: firing watering runs and ending them
//! - Device liveness tracking from inbound MQTT traffic
//! - Sensor telemetry ingestion
//! - The MQTT command bus shared by the engine and the HTTP handlers

pub mod api;
pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod schema;
pub mod services;
pub mod store;

#[cfg(test)]
mod testing;
