pub mod cached_data;
pub mod errors;
pub mod mirror;
pub mod mirror_registry;
pub mod result_cache;
pub mod sweeper;

pub use cached_data::{CacheEntry, Freshness};
pub use mirror::{Attachment, KubeWatchSource, Mirror, MirrorView, WatchSource};
pub use mirror_registry::MirrorRegistry;
pub use result_cache::{CacheStats, ResultCache};
