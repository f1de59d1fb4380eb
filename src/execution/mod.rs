//! Request execution.
//!
//! This module schedules and runs region reads:
//! - [`scheduler`]: cooperative worker pool running requests as tasks
//! - [`request`]: request handles, events and region reads
//! - [`pool`]: batches of reads awaited together
//! - [`cache`]: the blockwise caching operator
//! - [`eviction`]: tile eviction policies for the cache

pub mod cache;
pub mod eviction;
pub mod pool;
pub mod request;
pub mod scheduler;

pub use cache::{BlockwiseCache, CacheOptions, CacheStats, InvalidationMode};
pub use eviction::{EvictionPolicy, LruEviction};
pub use pool::RequestPool;
pub use request::{Event, ReadRequest, RequestHandle};
pub use scheduler::{Scheduler, SchedulerStats};
