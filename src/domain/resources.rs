// src/domain/resources.rs

//! Broker-side resource descriptors.
//!
//! Streams and durable consumers are owned by the broker. This crate only
//! names them and chooses the values it requests at provisioning time.

use serde::{Deserialize, Serialize};

/// Where the broker keeps stream data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    File,
    Memory,
}

/// When the broker may discard stream messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    /// Keep messages until stream limits are reached.
    Limits,
    /// Keep messages while any consumer is interested.
    Interest,
    /// Remove each message once it has been acknowledged.
    WorkQueue,
}

/// How a consumer expects messages to be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckPolicy {
    /// Every message must be acknowledged individually.
    Explicit,
    /// Acknowledging a message acknowledges all earlier ones.
    All,
    /// No acknowledgement is required.
    None,
}

/// Requested stream definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    // ---
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: StorageKind,
    pub retention: RetentionPolicy,
}

impl StreamConfig {
    /// Stream definition used when provisioning listener streams:
    /// file storage with work-queue retention.
    pub fn work_queue(name: impl Into<String>, subjects: Vec<String>) -> Self {
        // ---
        Self {
            name: name.into(),
            subjects,
            storage: StorageKind::File,
            retention: RetentionPolicy::WorkQueue,
        }
    }
}

/// Broker view of an existing stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub config: StreamConfig,
    /// Messages currently stored, when the broker reports it.
    pub messages: u64,
}

impl StreamInfo {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn subjects(&self) -> &[String] {
        &self.config.subjects
    }
}

/// Requested durable consumer definition.
///
/// A consumer with both `deliver_subject` and `deliver_group` is a push
/// consumer; without them it is a pull consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    // ---
    pub durable_name: String,
    pub filter_subject: String,
    pub ack_policy: AckPolicy,
    /// Maximum delivery attempts per message; `-1` means unlimited.
    pub max_deliver: i64,
    pub deliver_subject: Option<String>,
    pub deliver_group: Option<String>,
}

impl ConsumerConfig {
    /// Returns `true` when the broker pushes to a deliver subject.
    pub fn is_push(&self) -> bool {
        self.deliver_subject.is_some()
    }
}

/// Broker view of a durable consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    pub config: ConsumerConfig,
}
