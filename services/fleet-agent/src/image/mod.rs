//! Image build coordination.
//!
//! - `cache`: per-host registry of build latches keyed by image name

mod cache;

pub use cache::{BuildState, CacheStats, ImageCache, ImageCacheConfig, ImageLatch};
