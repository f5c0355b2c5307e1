//! Domain layer - Core types and port definitions
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles.

pub mod driver;
pub mod ports;
pub mod types;

pub use driver::*;
pub use ports::*;
pub use types::*;
