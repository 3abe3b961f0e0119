//! Engine: the dispatch loop and the queue facade used by producers and
//! operators.

pub mod dispatcher;
pub mod queue;

pub use dispatcher::{Dispatcher, Waker};
pub use queue::Queue;
