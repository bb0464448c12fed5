//! # nexus-common
//!
//! Shared identity types and configuration used across the Nexus voice crates.
//! Foundation layer: primitives and contracts, no voice logic.

pub mod config;
pub mod ids;

pub use ids::{ChannelId, UserId};
