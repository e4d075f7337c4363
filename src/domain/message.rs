// src/domain/message.rs

//! Messages exchanged with the broker.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::Result;

/// Header carrying the publisher-assigned message id used for broker-side
/// de-duplication.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Message headers.
///
/// A header name may carry several values; insertion order of values is
/// kept, names iterate in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value for `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        // ---
        self.0.entry(name.into()).or_default().push(value.into());
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// First value recorded for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        // ---
        self.0
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values recorded for `name`.
    pub fn get_all(&self, name: &str) -> &[String] {
        // ---
        self.0.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Acknowledgement channel back to the broker for one delivered message.
///
/// Implemented by each broker; the dispatcher calls exactly one of
/// [`ack`](Self::ack) or [`nak`](Self::nak) per delivery.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positive acknowledgement: the message is done.
    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgement: ask the broker to redeliver.
    async fn nak(&self) -> Result<()>;
}

/// A message delivered by the broker, not yet acknowledged.
///
/// Not `Clone`: each delivery is owned by exactly one
/// dispatch path until it is acked or naked.
pub struct InboundMessage {
    // ---
    subject: Arc<str>,
    payload: Bytes,
    headers: Headers,
    acker: Arc<dyn Acknowledger>,
}

impl InboundMessage {
    // ---
    pub fn new(
        subject: impl Into<Arc<str>>,
        payload: Bytes,
        headers: Headers,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        // ---
        Self {
            subject: subject.into(),
            payload,
            headers,
            acker,
        }
    }

    /// Subject the message was published on.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Raw message body.
    pub fn bytes(&self) -> &Bytes {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Publisher-assigned message id, if any.
    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(MSG_ID_HEADER)
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nak(&self) -> Result<()> {
        self.acker.nak().await
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("InboundMessage")
            .field("subject", &self.subject)
            .field("len", &self.payload.len())
            .field("headers", &self.headers)
            .finish()
    }
}

/// A message to publish.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    // ---
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
}

impl OutboundMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        // ---
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    /// Attach a message id for broker-side de-duplication.
    pub fn with_message_id(mut self, msg_id: impl Into<String>) -> Self {
        self.headers.insert(MSG_ID_HEADER, msg_id);
        self
    }
}

/// Broker acknowledgement of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    /// `true` when the broker recognised the message id and did not store
    /// a second copy.
    pub duplicate: bool,
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn headers_keep_multiple_values() {
        // ---
        let mut headers = Headers::new();
        headers.insert("trace", "a");
        headers.insert("trace", "b");

        assert_eq!(headers.get("trace"), Some("a"));
        assert_eq!(headers.get_all("trace"), ["a", "b"]);
        assert!(headers.get_all("missing").is_empty());
    }

    #[test]
    fn outbound_message_id_goes_into_headers() {
        // ---
        let msg = OutboundMessage::new("orders.new", "{}").with_message_id("m-1");
        assert_eq!(msg.headers.get(MSG_ID_HEADER), Some("m-1"));
    }
}
