//! Built-in operators.
//!
//! - [`ArraySource`]: serves an in-memory array
//! - [`LaneSource`]: serves one array per lane of a level-1 output
//! - [`Piper`]: passes its input through unchanged

pub mod lanes;
pub mod piper;
pub mod source;

pub use lanes::LaneSource;
pub use piper::Piper;
pub use source::ArraySource;
