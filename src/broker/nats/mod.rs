//! NATS JetStream broker.
//!
//! Enabled with the `transport_nats` feature. Without it the constructor
//! is still available but always fails.

#[cfg(feature = "transport_nats")]
mod jetstream;

#[cfg(feature = "transport_nats")]
pub use jetstream::create_broker as create_nats_broker;

#[cfg(not(feature = "transport_nats"))]
pub async fn create_nats_broker(_url: &str) -> crate::Result<crate::BrokerPtr> {
    Err(crate::ListenerError::Transport(
        "transport_nats feature is not enabled".into(),
    ))
}
