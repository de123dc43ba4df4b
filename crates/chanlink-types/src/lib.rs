//! Shared types for the chanlink peer-to-peer channel engine.
//!
//! This crate holds the configuration value objects passed to transports and
//! hubs at construction time. It contains no networking logic.

pub mod config;

pub use config::{EngineConfig, HubConfig, RetryConfig, TransportConfig, WireFormat};
