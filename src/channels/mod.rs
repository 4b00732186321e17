//! Broker channels that feed the dispatch queue.

pub mod mqtt;

pub use mqtt::{DEFAULT_TOPIC, handle_payload, publish, subscribe};
