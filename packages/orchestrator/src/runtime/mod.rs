// Runtime: traversal state, cancellation, internal actions, the graph
// walker, and the per-node-type executors.

pub mod actions;
pub mod cancel;
pub mod nodes;
pub mod state;
pub mod walker;

pub use cancel::CancellationRegistry;
pub use state::{ApprovalRequest, RunState};
pub use walker::GraphWalker;
