//! Domain layer - Port definitions
//!
//! This module defines the traits (ports) that adapters implement: the
//! authoritative backing store and the nodes of the distributed tier.

pub mod ports;

pub use ports::*;
