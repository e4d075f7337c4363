//! Message codec bridge.
//!
//! Converts raw message bodies into the payload type a listener declares.
//! The payload type and its decoding strategy are fixed once per listener
//! at registration time:
//!
//! - [`PayloadType::Text`] hands the body over as UTF-8 text, with no
//!   structured parse.
//! - [`PayloadType::Structured`] delegates to the pluggable [`Codec`].
//!
//! A payload type of `String` is always delivered as text, whatever the
//! declared payload type.
//!
//! Bodies are read as UTF-8 with invalid sequences replaced, matching the
//! way text payloads have always been read by existing publishers.

use std::any::TypeId;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::value::{Error as ValueError, StringDeserializer};
use serde::de::{DeserializeOwned, IntoDeserializer};
use serde::Serialize;

use crate::{ListenerError, Result};

/// Pluggable conversion between wire text and typed application objects.
pub trait Codec: Send + Sync + 'static {
    // ---
    /// MIME type describing encoded payloads.
    fn content_type(&self) -> &'static str;

    /// Parse `text` into `T`.
    fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T>;

    /// Encode `value` into wire bytes.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes>;
}

/// JSON codec backed by `serde_json`. The default codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    // ---
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
        // ---
        serde_json::from_str(text).map_err(|e| ListenerError::Decode {
            type_name: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

/// How a listener's payload is produced from the message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    /// The body text itself; the payload type must accept a plain string.
    Text,
    /// The body parsed by the codec.
    Structured,
}

/// Per-listener decoder, resolved once at registration.
#[derive(Debug, Clone, Copy)]
pub struct PayloadDecoder<T> {
    // ---
    payload_type: PayloadType,
    type_name: &'static str,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned + 'static> PayloadDecoder<T> {
    // ---
    pub fn new(payload_type: PayloadType) -> Self {
        // ---
        let payload_type = if TypeId::of::<T>() == TypeId::of::<String>() {
            PayloadType::Text
        } else {
            payload_type
        };

        Self {
            payload_type,
            type_name: std::any::type_name::<T>(),
            _phantom: PhantomData,
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    /// Name of the payload type, for log lines.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Verify that the payload type can be produced at all.
    ///
    /// A text listener whose payload type does not accept a plain string
    /// could never receive a message.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Capability`] naming `listener`.
    pub fn check_capability(&self, listener: &str) -> Result<()> {
        // ---
        if self.payload_type == PayloadType::Structured {
            return Ok(());
        }

        text_into::<T>(String::new())
            .map(|_| ())
            .map_err(|e| ListenerError::Capability {
                listener: listener.to_string(),
                reason: format!("{} cannot receive text payloads: {e}", self.type_name),
            })
    }

    /// Convert a message body into the payload type.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Decode`] if the conversion fails.
    pub fn decode<C: Codec>(&self, body: &Bytes, codec: &C) -> Result<T> {
        // ---
        let text = String::from_utf8_lossy(body);

        match self.payload_type {
            PayloadType::Text => {
                text_into::<T>(text.into_owned()).map_err(|e| ListenerError::Decode {
                    type_name: self.type_name,
                    reason: e.to_string(),
                })
            }
            PayloadType::Structured => codec.decode::<T>(&text),
        }
    }
}

/// Hand `text` to `T` as a bare string value, no parsing involved.
fn text_into<T: DeserializeOwned>(text: String) -> std::result::Result<T, ValueError> {
    // ---
    let deserializer: StringDeserializer<ValueError> = text.into_deserializer();
    T::deserialize(deserializer)
}
