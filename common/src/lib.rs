//! Common Utilities and Types Library
//! 
//! This crate provides shared types and utilities used across the RLC workspace.

pub mod buffer;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use buffer::*;
pub use types::*;
pub use utils::*;
