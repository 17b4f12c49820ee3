//! In-process coordination primitives: bounded work queues with close
//! semantics and the shutdown signal shared by every worker.

pub mod queue;
pub mod shutdown;
