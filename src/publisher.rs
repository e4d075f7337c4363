//! Message publishing.
//!
//! A thin typed layer over [`Broker::publish`](crate::Broker::publish).
//! Bodies are either raw bytes, raw UTF-8 text, or values encoded through
//! the codec. A [`MessageId`] travels in the `Nats-Msg-Id` header and lets
//! the broker store a retried publish only once.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::codec::{Codec, JsonCodec};
use crate::{log_debug, BrokerPtr, OutboundMessage, PublishAck, Result};

/// De-duplication id attached to a published message.
///
/// Publishing twice under the same id stores the message once; the second
/// [`PublishAck`] reports `duplicate` with the original sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    /// Random id for a publish that has no natural key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Publishes messages through a shared broker.
pub struct Publisher<C: Codec = JsonCodec> {
    broker: BrokerPtr,
    codec: Arc<C>,
}

impl<C: Codec> Clone for Publisher<C> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl Publisher<JsonCodec> {
    /// Publisher encoding structured values as JSON.
    pub fn new(broker: BrokerPtr) -> Self {
        Self::with_codec(broker, JsonCodec)
    }
}

impl<C: Codec> Publisher<C> {
    // ---
    pub fn with_codec(broker: BrokerPtr, codec: C) -> Self {
        Self::from_shared(broker, Arc::new(codec))
    }

    pub(crate) fn from_shared(broker: BrokerPtr, codec: Arc<C>) -> Self {
        Self { broker, codec }
    }

    /// Publish raw bytes.
    pub async fn publish_bytes(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<PublishAck> {
        self.send(OutboundMessage::new(subject, payload)).await
    }

    /// Publish raw bytes with a de-duplication id.
    pub async fn publish_bytes_with_id(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        msg_id: impl Into<MessageId>,
    ) -> Result<PublishAck> {
        // ---
        let msg_id: MessageId = msg_id.into();
        let msg = OutboundMessage::new(subject, payload).with_message_id(msg_id);
        self.send(msg).await
    }

    /// Publish text verbatim, bypassing the codec.
    pub async fn publish_text(&self, subject: &str, text: &str) -> Result<PublishAck> {
        self.publish_bytes(subject, Bytes::copy_from_slice(text.as_bytes()))
            .await
    }

    /// Encode `value` with the codec and publish it.
    ///
    /// # Errors
    ///
    /// Fails if encoding fails or the broker does not store the message.
    pub async fn publish<T: Serialize + ?Sized>(&self, subject: &str, value: &T) -> Result<PublishAck> {
        // ---
        let payload = self.codec.encode(value)?;
        self.publish_bytes(subject, payload).await
    }

    /// Encode and publish `value` with a de-duplication id.
    pub async fn publish_with_id<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        value: &T,
        msg_id: impl Into<MessageId>,
    ) -> Result<PublishAck> {
        // ---
        let payload = self.codec.encode(value)?;
        self.publish_bytes_with_id(subject, payload, msg_id).await
    }

    /// Encode and publish `value` under a freshly generated message id.
    ///
    /// Returns the id so a retry can reuse it and be de-duplicated.
    pub async fn publish_unique<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        value: &T,
    ) -> Result<(MessageId, PublishAck)> {
        // ---
        let id = MessageId::generate();
        let ack = self.publish_with_id(subject, value, id.clone()).await?;
        Ok((id, ack))
    }

    /// Publish without waiting; the returned task resolves to the broker's
    /// acknowledgement.
    ///
    /// The value is encoded before this returns, so encoding errors are
    /// reported immediately.
    pub fn publish_detached<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        value: &T,
    ) -> Result<JoinHandle<Result<PublishAck>>> {
        // ---
        let msg = OutboundMessage::new(subject, self.codec.encode(value)?);
        let broker = self.broker.clone();

        Ok(tokio::spawn(async move { broker.publish(msg).await }))
    }

    async fn send(&self, msg: OutboundMessage) -> Result<PublishAck> {
        // ---
        let subject = msg.subject.clone();
        let ack = self.broker.publish(msg).await?;
        log_debug!(
            "published to {subject}: stream {} seq {} duplicate {}",
            ack.stream,
            ack.sequence,
            ack.duplicate
        );
        Ok(ack)
    }
}
