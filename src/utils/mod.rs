//! Utility functions shared across the codebase

pub mod keys;
pub mod math;
pub mod text;
pub mod window;

// Re-export commonly used utilities
pub use keys::content_key;
pub use math::euclidean_distance;
pub use window::SlidingWindow;
