// src/config/declaration.rs

//! Static listener declarations.
//!
//! A declaration is written once per listener by the application and never
//! mutated. Runtime overrides are applied later by
//! [`EffectiveConfig::resolve`](super::EffectiveConfig::resolve).

use std::time::Duration;

use crate::subject::is_valid_filter;
use crate::{ListenerError, Result};

/// Default maximum delivery attempts (unlimited).
pub const DEFAULT_MAX_DELIVER: i64 = -1;
/// Default upper bound of workers per listener.
pub const DEFAULT_CONSUME_THREAD_MAX: usize = 64;
/// Default number of workers started eagerly per listener.
pub const DEFAULT_CONSUME_THREAD_NUMBER: usize = 20;
/// Default worker pool queue capacity.
pub const DEFAULT_BLOCKING_QUEUE_SIZE: usize = 2000;
/// Default idle time before a surplus worker exits.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_millis(60_000);
/// Default number of messages requested per pull.
pub const DEFAULT_PULL_BATCH_SIZE: usize = 10;
/// Default wait after an empty pull.
pub const DEFAULT_PULL_INTERVAL: Duration = Duration::from_millis(1000);
/// Default maximum time a single fetch may wait.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(3000);
/// Default delay before the first pull.
pub const DEFAULT_PULL_DELAY: Duration = Duration::ZERO;

/// What a worker pool does when its queue is full and it cannot grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaturationPolicy {
    /// The submitter waits for queue space. Pull loops and push callbacks
    /// slow down to the pace of the handlers.
    #[default]
    Block,

    /// The message is naked so the broker redelivers it later. The
    /// refusal is logged as [`ListenerError::PoolSaturated`] and counted
    /// in `DispatchStats::rejected`.
    Reject,
}

/// Worker pool bounds for one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Workers started at registration and kept for the pool lifetime.
    pub core_workers: usize,
    /// Upper bound on workers; extra workers are added while the queue is full.
    pub max_workers: usize,
    /// Capacity of the queue between receipt and processing.
    pub queue_capacity: usize,
    /// How long a surplus worker may idle before exiting.
    pub keep_alive: Duration,
    pub saturation: SaturationPolicy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        // ---
        Self {
            core_workers: DEFAULT_CONSUME_THREAD_NUMBER,
            max_workers: DEFAULT_CONSUME_THREAD_MAX,
            queue_capacity: DEFAULT_BLOCKING_QUEUE_SIZE,
            keep_alive: DEFAULT_KEEP_ALIVE,
            saturation: SaturationPolicy::Block,
        }
    }
}

/// Pull loop pacing for one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullSettings {
    pub batch_size: usize,
    /// Wait after an empty fetch before fetching again.
    pub interval: Duration,
    /// Maximum time one fetch may wait for messages.
    pub max_wait: Duration,
    /// Delay before the first fetch.
    pub initial_delay: Duration,
}

impl Default for PullSettings {
    fn default() -> Self {
        // ---
        Self {
            batch_size: DEFAULT_PULL_BATCH_SIZE,
            interval: DEFAULT_PULL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
            initial_delay: DEFAULT_PULL_DELAY,
        }
    }
}

/// Declarative description of one listener.
///
/// Build with [`ListenerDeclaration::builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerDeclaration {
    // ---
    /// Stream holding the listener's messages (required).
    pub stream: String,
    /// Subject filter of the durable consumer (required).
    pub filter_subject: String,
    /// Durable consumer name. Empty means "use the registered listener name".
    pub durable_name: String,
    /// Push delivery subject.
    pub deliver_subject: Option<String>,
    /// Push delivery group for load-balanced delivery.
    pub deliver_group: Option<String>,
    /// Maximum delivery attempts; `-1` means unlimited.
    pub max_deliver: i64,
    /// Acknowledge automatically after the handler returns normally.
    pub auto_ack: bool,
    pub pool: PoolSettings,
    pub pull: PullSettings,
}

impl ListenerDeclaration {
    /// Start building a declaration.
    pub fn builder() -> ListenerDeclarationBuilder {
        ListenerDeclarationBuilder::new()
    }
}

/// Builder for [`ListenerDeclaration`].
///
/// # Example
///
/// ```
/// use mom_listener::ListenerDeclaration;
/// use std::time::Duration;
///
/// let decl = ListenerDeclaration::builder()
///     .stream("ORDERS")
///     .filter_subject("orders.new")
///     .durable_name("order-audit")
///     .pull_batch_size(50)
///     .pull_interval(Duration::from_millis(250))
///     .build()
///     .unwrap();
///
/// assert_eq!(decl.pull.batch_size, 50);
/// ```
#[derive(Debug, Default)]
pub struct ListenerDeclarationBuilder {
    // ---
    stream: Option<String>,
    filter_subject: Option<String>,
    durable_name: Option<String>,
    deliver_subject: Option<String>,
    deliver_group: Option<String>,
    max_deliver: Option<i64>,
    auto_ack: Option<bool>,
    pool: PoolSettings,
    pull: PullSettings,
}

impl ListenerDeclarationBuilder {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stream name (required).
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Set the consumer filter subject (required).
    pub fn filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = Some(subject.into());
        self
    }

    /// Set the durable consumer name.
    ///
    /// Default: the name the listener is registered under.
    pub fn durable_name(mut self, name: impl Into<String>) -> Self {
        self.durable_name = Some(name.into());
        self
    }

    /// Set the push delivery subject.
    ///
    /// Push mode is used only when a delivery group is set as well.
    pub fn deliver_subject(mut self, subject: impl Into<String>) -> Self {
        self.deliver_subject = Some(subject.into());
        self
    }

    /// Set the push delivery group.
    pub fn deliver_group(mut self, group: impl Into<String>) -> Self {
        self.deliver_group = Some(group.into());
        self
    }

    /// Set the maximum delivery attempts.
    ///
    /// Default: -1 (unlimited).
    pub fn max_deliver(mut self, attempts: i64) -> Self {
        self.max_deliver = Some(attempts);
        self
    }

    /// Enable or disable acknowledgement after a successful handler call.
    ///
    /// Default: true.
    pub fn auto_ack(mut self, enabled: bool) -> Self {
        self.auto_ack = Some(enabled);
        self
    }

    /// Set the number of eagerly started workers.
    ///
    /// Default: 20.
    pub fn consume_thread_number(mut self, workers: usize) -> Self {
        self.pool.core_workers = workers;
        self
    }

    /// Set the maximum number of workers.
    ///
    /// Default: 64.
    pub fn consume_thread_max(mut self, workers: usize) -> Self {
        self.pool.max_workers = workers;
        self
    }

    /// Set the worker queue capacity.
    ///
    /// Default: 2000.
    pub fn blocking_queue_size(mut self, capacity: usize) -> Self {
        self.pool.queue_capacity = capacity;
        self
    }

    /// Set the idle time before surplus workers exit.
    ///
    /// Default: 60s.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.pool.keep_alive = keep_alive;
        self
    }

    /// Set the policy applied when the worker queue is full.
    ///
    /// Default: [`SaturationPolicy::Block`].
    pub fn saturation_policy(mut self, policy: SaturationPolicy) -> Self {
        self.pool.saturation = policy;
        self
    }

    /// Set the number of messages requested per pull.
    ///
    /// Default: 10.
    pub fn pull_batch_size(mut self, batch_size: usize) -> Self {
        self.pull.batch_size = batch_size;
        self
    }

    /// Set the wait after an empty pull.
    ///
    /// Default: 1s.
    pub fn pull_interval(mut self, interval: Duration) -> Self {
        self.pull.interval = interval;
        self
    }

    /// Set the maximum wait of a single fetch.
    ///
    /// Default: 3s.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.pull.max_wait = max_wait;
        self
    }

    /// Set the delay before the first pull.
    ///
    /// Default: none.
    pub fn pull_delay(mut self, delay: Duration) -> Self {
        self.pull.initial_delay = delay;
        self
    }

    /// Build the declaration (consumes self).
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::MissingConfig`] if `stream` or
    /// `filter_subject` is missing or empty, and
    /// [`ListenerError::InvalidConfig`] if `filter_subject` is not a
    /// well-formed subject.
    pub fn build(self) -> Result<ListenerDeclaration> {
        // ---
        let stream = self
            .stream
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ListenerError::MissingConfig("stream".into()))?;
        let filter_subject = self
            .filter_subject
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ListenerError::MissingConfig("filter_subject".into()))?;
        if !is_valid_filter(&filter_subject) {
            return Err(ListenerError::InvalidConfig(format!(
                "filter_subject {filter_subject:?} is not a valid subject"
            )));
        }

        Ok(ListenerDeclaration {
            stream,
            filter_subject,
            durable_name: self.durable_name.unwrap_or_default(),
            deliver_subject: self.deliver_subject,
            deliver_group: self.deliver_group,
            max_deliver: self.max_deliver.unwrap_or(DEFAULT_MAX_DELIVER),
            auto_ack: self.auto_ack.unwrap_or(true),
            pool: self.pool,
            pull: self.pull,
        })
    }
}
