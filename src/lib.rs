//! q4d: queue-driven lftp download dispatcher.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod transfer;
