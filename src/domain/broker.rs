// src/domain/broker.rs

//! Broker domain abstractions.
//!
//! This module defines the broker interface used by the provisioning,
//! subscription and publishing layers. It intentionally avoids any
//! reference to concrete client libraries or wire protocols.
//!
//! The broker is treated as a trusted collaborator: it owns streams,
//! durable consumers, delivery state and redelivery. Higher-level
//! semantics (config resolution, decoding, bounded dispatch) live
//! elsewhere in the crate.
//!
//! Concrete implementations of this interface live under `src/broker/`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::message::{InboundMessage, OutboundMessage, PublishAck};
use super::resources::{ConsumerConfig, ConsumerInfo, StreamConfig, StreamInfo};
use crate::Result;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback invoked by the broker for each push-delivered message.
///
/// The broker awaits the returned future before handing the same
/// subscriber its next message.
pub type MessageCallback = Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Binding of a push subscription to an existing durable consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushBinding {
    // ---
    pub stream: String,
    pub consumer: String,
    pub filter_subject: String,
    /// Delivery group the subscriber joins for load-balanced delivery.
    pub deliver_group: Option<String>,
}

/// Binding of a pull subscription to an existing durable consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullBinding {
    // ---
    pub stream: String,
    pub consumer: String,
    pub filter_subject: String,
}

/// Handle to a running push subscription.
///
/// The broker delivers on its own task; the handle only stops it.
/// Dropping the handle without calling [`unsubscribe`](Self::unsubscribe)
/// leaves delivery running for the process lifetime.
pub struct PushSubscriptionHandle {
    // ---
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PushSubscriptionHandle {
    // ---
    /// Wrap a broker delivery task.
    ///
    /// The task is expected to exit once `stop_tx` fires or is dropped.
    pub fn new(stop_tx: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            stop_tx: Some(stop_tx),
            task,
        }
    }

    /// Stop delivery and wait for the delivery task to finish the
    /// callback it is currently running, if any.
    pub async fn unsubscribe(mut self) {
        // ---
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

/// Pull side of a subscription: the consumer asks for batches.
#[async_trait::async_trait]
pub trait PullHandle: Send + Sync {
    // ---
    /// Request up to `batch_size` messages, waiting at most `max_wait`
    /// for the first one. An empty vector means nothing was available.
    async fn fetch(&self, batch_size: usize, max_wait: Duration) -> Result<Vec<InboundMessage>>;

    /// Wait until a new message may be available or `timeout` elapses.
    ///
    /// Returns `true` if woken by a new message. Brokers that cannot signal
    /// availability simply sleep for `timeout`.
    async fn wait_for_message(&self, timeout: Duration) -> bool {
        // ---
        tokio::time::sleep(timeout).await;
        false
    }
}

/// Shared pull handle pointer.
pub type PullHandlePtr = Arc<dyn PullHandle>;

/// Broker abstraction.
///
/// Implementations must ensure that:
/// - `stream_info()` reports a missing stream as an API error whose
///   [`is_not_found`](crate::ListenerError::is_not_found) is `true`.
/// - `create_or_update_consumer()` is idempotent for identical
///   definitions.
/// - Once `subscribe_push()` or `subscribe_pull()` returns, messages
///   stored for the bound consumer are deliverable.
///
/// The in-memory broker serves as the reference implementation of these
/// semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Treat methods as normal `async fn`s.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    // ---
    /// Identifier used in log lines.
    fn broker_id(&self) -> &str;

    /// Look up a stream by name.
    async fn stream_info(&self, name: &str) -> Result<StreamInfo>;

    /// Create a stream. Fails if a stream with that name already exists.
    async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo>;

    /// Create the durable consumer, or update its definition if it exists.
    async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo>;

    /// Bind a push subscription to an existing consumer.
    async fn subscribe_push(
        &self,
        binding: PushBinding,
        callback: MessageCallback,
    ) -> Result<PushSubscriptionHandle>;

    /// Bind a pull subscription to an existing consumer.
    async fn subscribe_pull(&self, binding: PullBinding) -> Result<PullHandlePtr>;

    /// Publish a message and wait for the broker to store it.
    async fn publish(&self, msg: OutboundMessage) -> Result<PublishAck>;

    /// Close the broker connection and release associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared broker pointer.
///
/// `.clone()` only bumps a reference count; every listener shares the
/// same underlying connection.
pub type BrokerPtr = Arc<dyn Broker>;
