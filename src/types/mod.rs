//! Shared types for the wormhole crate

pub mod error;

pub use error::{Result, WormholeError};
