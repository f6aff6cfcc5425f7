//! The caching engine behind the proxpi package-index proxy.
//!
//! Three layers compose here, leaves first:
//!
//! - [`IndexSource`]: talks to one upstream simple-repository index and
//!   caches its parsed listings with a per-source TTL.
//! - [`Aggregator`]: merges the root index with any extra indexes into a
//!   single ordered view and brokers invalidation.
//! - [`FileCache`]: materializes downloaded artifacts on disk under a byte
//!   budget, coalescing concurrent downloads of the same artifact and
//!   falling back to upstream redirects when a download is slow.

mod aggregator;
mod config;
mod error;
mod file_cache;
pub mod http;
mod index;

pub use aggregator::Aggregator;
pub use config::Config;
pub use error::FetchError;
pub use file_cache::{CachedFile, FetchOutcome, FileCache, FileKey};
pub use index::IndexSource;
