//! Dispatch pipeline.
//!
//! Every inbound job flows through:
//! 1. `ConcurrentQueue::enqueue()`: from the broker callback
//! 2. `Dispatcher` tick: dequeues one job at a time
//! 3. `RulesEngine::evaluate()`: routing code
//! 4. `TransferExecutor::transfer()`: lftp with directory/file fallback
//!
//! **At most one transfer is in flight.** The next job is not dequeued until
//! the current one has finished, fallback included.

pub mod processor;
pub mod queue;
pub mod rules;
pub mod types;

pub use processor::{DEFAULT_TICK, DispatchStats, Dispatcher, DispatcherHandle};
pub use queue::ConcurrentQueue;
pub use rules::RulesEngine;
pub use types::{Job, JobField, Operator, RoutingConfig, RoutingRule};
