//! Utility functions for formatting and serialization helpers.

pub mod duration_ms;
pub mod format;

// Re-export commonly used functions at module level
pub use format::{format_age, format_duration, truncate_string};
