//! Operator graphs.
//!
//! A graph owns operators and the slots connecting them. Edits are applied
//! under a write lock and metadata is re-derived before the edit returns.
//! Operators whose input is one level deeper than declared are wrapped
//! implicitly: the graph runs one copy of the operator per lane.

pub mod snapshot;
pub mod structure;

pub(crate) mod topology;

mod propagation;
mod wrapper;

pub use snapshot::{GraphSnapshot, OperatorSnapshot, SlotSnapshot};
pub use structure::{DirtyCallback, Graph, SubscriptionId};
