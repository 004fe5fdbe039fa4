//! Broker - topic-keyed publish/subscribe fan-out.
//!
//! Every subscriber owns a bounded delivery queue. Publishing never waits on
//! a subscriber: when a queue is full the event is dropped for that
//! subscriber only and the broker's loss counter is incremented. Readers
//! observe channel closure once they unsubscribe or the broker stops.

/// Broker implementation (subscriber registry and fan-out).
pub mod bus;
/// Configuration and error types.
pub mod types;

pub use bus::{Broker, Unsubscribe};
pub use types::{BrokerConfig, BrokerError};

#[cfg(test)]
mod tests;
