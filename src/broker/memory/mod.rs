// src/broker/memory/mod.rs

//! In-memory broker implementation.
//!
//! This module provides a pure in-process implementation of the
//! domain-level `Broker` trait. It is intended primarily for testing,
//! local execution, and as a reference for broker semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory broker defines the **reference behavior** for the broker
//! layer. The JetStream broker is expected to approximate it as closely as
//! the server allows and to document any unavoidable deviations.
//!
//! In particular, the in-memory broker establishes the following
//! expectations:
//!
//! - A missing stream or consumer is reported as a 404 API error.
//! - Creating or updating a consumer twice with the same definition
//!   leaves the same broker-visible state as doing it once.
//! - Once a subscription is bound, stored messages for its consumer are
//!   deliverable; nothing is dropped because of timing or scheduling.
//! - A nak makes the message deliverable again, bounded by `max_deliver`.

mod broker;

pub use broker::{create_broker, BrokerOp, FaultPoint, MemoryBroker};
