//! Declarative durable-consumer registration and bounded dispatch over
//! JetStream-style message brokers.
//!
//! Applications register listeners, each with a static declaration
//! naming its stream, filter subject and delivery settings. On start the
//! container resolves every declaration against per-subject overrides,
//! provisions the stream and durable consumer, and subscribes in push or
//! pull mode. Delivered messages are decoded and handed to a bounded
//! worker pool per listener; a handler's outcome decides between ack and
//! nak.
//!
//! The broker sits behind the [`Broker`] trait. An in-memory reference
//! broker is always available; a NATS JetStream broker is enabled with the
//! `transport_nats` feature.
//!

// Import all sub modules once...
mod broker;
mod codec;
mod config;
mod container;
mod dispatch;
mod domain;
mod listener;
mod provision;
mod publisher;
mod subject;
mod subscription;

mod error;
mod macros;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

use std::sync::{Mutex, MutexGuard};

/// Acquire mutex guard, ignoring poisoning
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Re-exported so listener implementations need no direct dependency.
pub use async_trait::async_trait;

// Re-export main types
pub use container::{ListenerContainer, ListenerContainerBuilder, StartupReport};
pub use publisher::{MessageId, Publisher};
pub use subscription::SubscriptionInfo;

pub use codec::{Codec, JsonCodec, PayloadDecoder, PayloadType};
pub use listener::{listener_fn, text_listener_fn, FnListener, Listener, TextFnListener};

pub use dispatch::{DispatchStats, DrainMode};
pub use provision::Provisioner;

pub use error::{HandlerError, ListenerError, Result, BAD_REQUEST, NOT_FOUND};

pub use broker::{create_memory_broker, create_nats_broker};
pub use broker::{BrokerOp, FaultPoint, MemoryBroker};

pub use config::{
    //
    EffectiveConfig,
    ListenerDeclaration,
    ListenerDeclarationBuilder,
    PoolSettings,
    PullSettings,
    SaturationPolicy,
    SubjectOverride,
    SubjectOverrides,
    SubscriptionMode,
    DEFAULT_BLOCKING_QUEUE_SIZE,
    DEFAULT_CONSUME_THREAD_MAX,
    DEFAULT_CONSUME_THREAD_NUMBER,
    DEFAULT_KEEP_ALIVE,
    DEFAULT_MAX_DELIVER,
    DEFAULT_MAX_WAIT,
    DEFAULT_PULL_BATCH_SIZE,
    DEFAULT_PULL_DELAY,
    DEFAULT_PULL_INTERVAL,
};

// --- public re-exports
pub use domain::{
    //
    AckPolicy,
    Acknowledger,
    BoxFuture,
    Broker,
    BrokerPtr,
    ConsumerConfig,
    ConsumerInfo,
    Headers,
    InboundMessage,
    MessageCallback,
    OutboundMessage,
    PublishAck,
    PullBinding,
    PullHandle,
    PullHandlePtr,
    PushBinding,
    PushSubscriptionHandle,
    RetentionPolicy,
    StorageKind,
    StreamConfig,
    StreamInfo,
    MSG_ID_HEADER,
};
