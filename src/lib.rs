//! # Roiflow - Lazy blockwise array graphs
//!
//! Roiflow evaluates graphs of operators over large N-dimensional arrays on
//! demand. Nothing is computed until a region of interest (ROI) of some
//! output is requested; the request then pulls exactly the regions it needs
//! from upstream, and blockwise caches keep computed tiles around.
//!
//! ## Features
//!
//! - **Lazy region reads**: request any ROI of any output slot
//! - **Metadata propagation**: output shapes and dtypes follow their inputs
//!   as the graph is edited
//! - **Implicit lanes**: connecting a list of arrays to an operator expecting
//!   one runs a copy of the operator per lane
//! - **Cooperative scheduling**: requests waiting on other requests park
//!   instead of blocking a worker
//! - **Blockwise caching**: at most one upstream fetch per tile, lazy
//!   invalidation through generation counters
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use roiflow::prelude::*;
//! use ndarray::ArrayD;
//!
//! let graph = Graph::with_workers(4);
//! let source = graph.add_operator(ArraySource::new(ArrayD::<f32>::zeros(vec![2048, 2048])));
//! let cache = graph.add_operator(BlockwiseCache::with_block_shape(vec![256, 256]));
//! graph.connect(graph.input(cache, "Input")?, graph.output(source, "Output")?)?;
//!
//! let output = graph.output(cache, "Output")?;
//! let tile = graph.read(output, Roi::new(vec![0, 0], vec![300, 300])?)?.wait()?;
//! assert_eq!(tile.shape(), &[300, 300]);
//!
//! // Tiles intersecting the region are fetched again on the next read
//! graph.set_dirty(graph.output(source, "Output")?, Some(Roi::new(vec![0, 0], vec![10, 10])?))?;
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: ROIs, array types, slots, the `Operator` trait and errors
//! - [`graph`]: graph editing, metadata propagation and lane wrapping
//! - [`execution`]: scheduler, request handles and the blockwise cache
//! - [`operators`]: built-in sources and pass-through
//! - [`config`]: engine configuration

#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod execution;
pub mod graph;
pub mod operators;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```rust,ignore
/// use roiflow::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::roi::{block_bounds, determine_block_shape, intersecting_blocks, Roi};
    pub use crate::core::types::{ArrayBuffer, ArrayMeta, DType, Element};

    // Operators and slots
    pub use crate::core::operator::{Operator, OperatorMetadata};
    pub use crate::core::slot::{SlotDefinition, SlotDirection};

    // Contexts
    pub use crate::core::context::{DirtyContext, ExecutionContext, SetupContext, SlotMeta};

    // Errors
    pub use crate::core::error::{
        ConfigError, ExecutionError, ExecutionResult, GraphError, GraphResult, OperatorId,
        RoiError, RoiflowError, RoiflowResult, SlotId,
    };

    // Graph
    pub use crate::graph::{Graph, GraphSnapshot, SubscriptionId};

    // Execution
    pub use crate::execution::cache::{BlockwiseCache, CacheOptions, CacheStats, InvalidationMode};
    pub use crate::execution::eviction::{EvictionPolicy, LruEviction};
    pub use crate::execution::pool::RequestPool;
    pub use crate::execution::request::{Event, ReadRequest, RequestHandle};
    pub use crate::execution::scheduler::{Scheduler, SchedulerStats};

    // Built-in operators
    pub use crate::operators::{ArraySource, LaneSource, Piper};

    // Configuration
    pub use crate::config::EngineConfig;
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Install an `env_logger` logger honouring `RUST_LOG`, defaulting to `warn`.
///
/// Safe to call more than once; later calls leave the installed logger alone.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .try_init();
}
