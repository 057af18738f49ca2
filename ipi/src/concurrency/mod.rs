//! Concurrency primitives shared by the engine's background workers.
//!
//! Workers coordinate through a broadcast [`shutdown`] signal: the engine flips it once on stop
//! and every worker observes it at its next suspension point. Each worker cycle runs under
//! [`panic::catch_panic`] so a single bad cycle is logged instead of ending the worker.

pub mod panic;
pub mod shutdown;
