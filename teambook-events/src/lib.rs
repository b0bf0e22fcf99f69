//! Teambook Events - In-Process Domain Event Bus
//!
//! Fan-out of domain events to in-process handlers and streaming clients.
//!
//! Every teambook has a logical channel `teambook:<name>:events`. Mutating
//! kernel operations publish a [`DomainEvent`] here *after* the backing
//! write has committed; publish failures never roll back the write. The bus
//! is backed by a `tokio::sync::broadcast` channel, so slow consumers lag
//! (and are told so) instead of blocking writers.

mod bus;
mod event;

pub use bus::{EventBus, EventBusHandle, SubscriberStream};
pub use event::{DomainEvent, WireEvent};

/// Logical pub/sub channel name for a teambook.
pub fn channel_for(teambook: &str) -> String {
    format!("teambook:{}:events", teambook)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_for("demo"), "teambook:demo:events");
    }
}
