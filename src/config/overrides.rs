// src/config/overrides.rs

//! Per-subject runtime overrides.
//!
//! Overrides are loaded once at startup, usually from a configuration file
//! the application parses itself. Each record is keyed by the exact filter
//! subject of the listener it tunes; every field is optional and an unset
//! field inherits the listener's declared value.

use std::collections::HashMap;

use serde::Deserialize;

use crate::{log_warn, Result};

/// Optional overrides for the listener whose filter subject equals
/// [`subject`](Self::subject).
///
/// Field names accept both snake_case and the camelCase spelling used by
/// existing deployment files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubjectOverride {
    // ---
    pub subject: String,

    #[serde(alias = "autoAck")]
    pub auto_ack: Option<bool>,

    #[serde(alias = "maxDeliver")]
    pub max_deliver: Option<i64>,

    #[serde(alias = "consumeThreadNumber")]
    pub consume_thread_number: Option<usize>,

    #[serde(alias = "consumeThreadMax")]
    pub consume_thread_max: Option<usize>,

    #[serde(alias = "blockingQueueSize")]
    pub blocking_queue_size: Option<usize>,

    #[serde(alias = "keepAliveTime")]
    pub keep_alive_ms: Option<u64>,

    /// Clamped to at least 1.
    #[serde(alias = "pullBatchSize")]
    pub pull_batch_size: Option<i64>,

    /// Clamped to at least 1 ms.
    #[serde(alias = "pullInterval")]
    pub pull_interval_ms: Option<i64>,

    /// Clamped to at least 1 ms.
    #[serde(alias = "maxWaitTime")]
    pub max_wait_ms: Option<i64>,

    #[serde(alias = "pullDelayTime")]
    pub pull_delay_ms: Option<u64>,
}

impl SubjectOverride {
    /// Empty override for `subject`; fill fields directly.
    pub fn for_subject(subject: impl Into<String>) -> Self {
        // ---
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OverrideDocument {
    List(Vec<SubjectOverride>),
    Wrapped { overrides: Vec<SubjectOverride> },
}

/// All override records, keyed by subject.
///
/// When several records name the same subject the last one wins and a
/// warning is logged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectOverrides {
    by_subject: HashMap<String, SubjectOverride>,
}

impl SubjectOverrides {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect records in order, last write wins per subject.
    pub fn from_entries(entries: impl IntoIterator<Item = SubjectOverride>) -> Self {
        // ---
        let mut by_subject = HashMap::new();

        for entry in entries {
            if entry.subject.is_empty() {
                log_warn!("ignoring subject override without a subject: {entry:?}");
                continue;
            }
            if by_subject.contains_key(&entry.subject) {
                log_warn!(
                    "duplicate override for subject {}, the later entry replaces the earlier one",
                    entry.subject
                );
            }
            by_subject.insert(entry.subject.clone(), entry);
        }

        Self { by_subject }
    }

    /// Parse records from JSON text.
    ///
    /// Accepts a bare array of records or an object with an `overrides`
    /// array.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Serialization`](crate::ListenerError::Serialization)
    /// if the text is not a valid override document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        // ---
        let entries = match serde_json::from_str::<OverrideDocument>(text)? {
            OverrideDocument::List(entries) => entries,
            OverrideDocument::Wrapped { overrides } => overrides,
        };
        Ok(Self::from_entries(entries))
    }

    /// Override for an exact filter subject.
    pub fn get(&self, subject: &str) -> Option<&SubjectOverride> {
        self.by_subject.get(subject)
    }

    pub fn len(&self) -> usize {
        self.by_subject.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_subject.is_empty()
    }
}

impl FromIterator<SubjectOverride> for SubjectOverrides {
    fn from_iter<I: IntoIterator<Item = SubjectOverride>>(iter: I) -> Self {
        Self::from_entries(iter)
    }
}
