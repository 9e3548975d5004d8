//! # nexus-common
//!
//! Shared configuration, error handling, and event types used across the Nexus SFU crates.
//! This is the foundation layer: no media logic, just primitives and contracts.

pub mod config;
pub mod error;
pub mod gateway_event;
