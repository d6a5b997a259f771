//! Composable caching and partitioning backends.
//!
//! Each wrapper holds its "next" backend by reference, so chains are built
//! by composition and stay substitutable at runtime:
//!
//! ```
//! use std::sync::Arc;
//! use mnemo_core::pipeline::ObjectCache;
//! use mnemo_core::storage::{MemoryBackend, Options, StorageBackend};
//!
//! let terminal = Arc::new(MemoryBackend::new(&Options::new()));
//! let chain: Arc<dyn StorageBackend> =
//!     Arc::new(ObjectCache::new(terminal, &Options::new()));
//! let _ = chain;
//! ```

mod aged;
mod burned;
mod cache;
mod partition;

pub use aged::AgedCache;
pub use burned::BurnedCache;
pub use cache::ObjectCache;
pub use partition::VerticalPartitioner;
