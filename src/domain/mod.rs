//! Domain layer public interface.
//!
//! This module defines broker-level abstractions that are independent of
//! any concrete client library, wire protocol, or deployment.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod broker;
mod message;
mod resources;

// --- Broker domain re-exports ---

pub use broker::{
    //
    BoxFuture,
    Broker,
    BrokerPtr,
    MessageCallback,
    PullBinding,
    PullHandle,
    PullHandlePtr,
    PushBinding,
    PushSubscriptionHandle,
};

pub use message::{
    //
    Acknowledger,
    Headers,
    InboundMessage,
    OutboundMessage,
    PublishAck,
    MSG_ID_HEADER,
};

pub use resources::{
    //
    AckPolicy,
    ConsumerConfig,
    ConsumerInfo,
    RetentionPolicy,
    StorageKind,
    StreamConfig,
    StreamInfo,
};
