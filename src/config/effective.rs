// src/config/effective.rs

//! Effective per-listener configuration.
//!
//! The resolver merges a [`ListenerDeclaration`] with the matching
//! [`SubjectOverride`] (exact filter-subject match) and normalizes values
//! the runtime depends on. The result is computed once at registration
//! and never changes afterwards.

use std::time::Duration;

use super::declaration::{ListenerDeclaration, PoolSettings};
use super::overrides::{SubjectOverride, SubjectOverrides};
use crate::domain::{AckPolicy, ConsumerConfig};

/// How a listener receives messages. Chosen once per listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// The broker pushes to `deliver_subject`, load-balanced across
    /// `deliver_group`.
    Push {
        deliver_subject: String,
        deliver_group: String,
    },

    /// A dedicated loop fetches batches.
    Pull {
        batch_size: usize,
        interval: Duration,
        max_wait: Duration,
        initial_delay: Duration,
    },
}

impl SubscriptionMode {
    pub fn is_push(&self) -> bool {
        matches!(self, Self::Push { .. })
    }

    /// Short label for logs and introspection.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Push { .. } => "push",
            Self::Pull { .. } => "pull",
        }
    }
}

/// Fully resolved configuration of one registered listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    // ---
    pub listener_name: String,
    pub stream: String,
    pub filter_subject: String,
    pub durable_name: String,
    pub max_deliver: i64,
    pub auto_ack: bool,
    pub pool: PoolSettings,
    pub mode: SubscriptionMode,
}

impl EffectiveConfig {
    /// Merge `declaration` with the override for its filter subject.
    ///
    /// Unset override fields keep the declared value. Pull batch size,
    /// pull interval and max wait are clamped to at least 1 (message or
    /// millisecond). Pool bounds are normalized so the pool can always be
    /// built: at least one eager worker and one queue slot, and no more
    /// eager workers than the maximum.
    pub fn resolve(
        listener_name: &str,
        declaration: &ListenerDeclaration,
        overrides: &SubjectOverrides,
    ) -> Self {
        // ---
        let empty = SubjectOverride::default();
        let ov = overrides.get(&declaration.filter_subject).unwrap_or(&empty);

        let durable_name = if declaration.durable_name.is_empty() {
            listener_name.to_string()
        } else {
            declaration.durable_name.clone()
        };

        let max_workers = ov
            .consume_thread_max
            .unwrap_or(declaration.pool.max_workers)
            .max(1);
        let core_workers = ov
            .consume_thread_number
            .unwrap_or(declaration.pool.core_workers)
            .clamp(1, max_workers);

        let pool = PoolSettings {
            core_workers,
            max_workers,
            queue_capacity: ov
                .blocking_queue_size
                .unwrap_or(declaration.pool.queue_capacity)
                .max(1),
            keep_alive: ov
                .keep_alive_ms
                .map(Duration::from_millis)
                .unwrap_or(declaration.pool.keep_alive),
            saturation: declaration.pool.saturation,
        };

        let mode = match push_target(declaration) {
            Some((deliver_subject, deliver_group)) => SubscriptionMode::Push {
                deliver_subject,
                deliver_group,
            },
            None => {
                let pull = &declaration.pull;
                SubscriptionMode::Pull {
                    batch_size: ov
                        .pull_batch_size
                        .map(clamp_count)
                        .unwrap_or(pull.batch_size)
                        .max(1),
                    interval: clamp_millis(ov.pull_interval_ms, pull.interval),
                    max_wait: clamp_millis(ov.max_wait_ms, pull.max_wait),
                    initial_delay: ov
                        .pull_delay_ms
                        .map(Duration::from_millis)
                        .unwrap_or(pull.initial_delay),
                }
            }
        };

        Self {
            listener_name: listener_name.to_string(),
            stream: declaration.stream.clone(),
            filter_subject: declaration.filter_subject.clone(),
            durable_name,
            max_deliver: ov.max_deliver.unwrap_or(declaration.max_deliver),
            auto_ack: ov.auto_ack.unwrap_or(declaration.auto_ack),
            pool,
            mode,
        }
    }

    /// Durable consumer definition requested from the broker.
    ///
    /// Pull listeners get a pull consumer: deliver subject and group are
    /// only sent in push mode.
    pub fn consumer_config(&self) -> ConsumerConfig {
        // ---
        let (deliver_subject, deliver_group) = match &self.mode {
            SubscriptionMode::Push {
                deliver_subject,
                deliver_group,
            } => (Some(deliver_subject.clone()), Some(deliver_group.clone())),
            SubscriptionMode::Pull { .. } => (None, None),
        };

        ConsumerConfig {
            durable_name: self.durable_name.clone(),
            filter_subject: self.filter_subject.clone(),
            ack_policy: AckPolicy::Explicit,
            max_deliver: self.max_deliver,
            deliver_subject,
            deliver_group,
        }
    }
}

/// Push target, present only when both subject and group are non-empty.
fn push_target(declaration: &ListenerDeclaration) -> Option<(String, String)> {
    // ---
    let subject = declaration.deliver_subject.as_deref().unwrap_or_default();
    let group = declaration.deliver_group.as_deref().unwrap_or_default();

    if subject.is_empty() || group.is_empty() {
        return None;
    }
    Some((subject.to_string(), group.to_string()))
}

fn clamp_count(value: i64) -> usize {
    usize::try_from(value.max(1)).unwrap_or(usize::MAX)
}

fn clamp_millis(value: Option<i64>, declared: Duration) -> Duration {
    // ---
    match value {
        Some(ms) => Duration::from_millis(ms.max(1).unsigned_abs()),
        None => declared.max(Duration::from_millis(1)),
    }
}
