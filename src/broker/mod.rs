//! Broker implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Broker` trait. Network brokers are hidden behind feature flags and
//! exposed only through constructor functions.
//!
//! Domain code must not depend on broker-specific types.

mod memory;
mod nats;

pub use memory::create_broker as create_memory_broker;
pub use memory::{BrokerOp, FaultPoint, MemoryBroker};

pub use nats::create_nats_broker;
