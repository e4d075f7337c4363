// src/dispatch/dispatcher.rs

//! Per-listener dispatcher.
//!
//! Receipt paths hand every delivered message to [`Dispatcher::dispatch`],
//! which decodes it and submits it to the listener's worker pool. A worker
//! then calls the handler and settles the message:
//!
//! | outcome                         | disposition           |
//! |---------------------------------|-----------------------|
//! | handler returns `Ok`, auto-ack  | ack                   |
//! | handler returns `Ok`, no auto-ack | none (handler's job) |
//! | handler returns `Err` or panics | nak                   |
//! | payload fails to decode         | nak, handler not run  |
//! | pool rejects or drains the work | nak                   |
//!
//! Failures never escape to the submitter; they are logged with listener
//! name and subject and counted in [`DispatchStats`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;

use super::pool::{DrainMode, Work, WorkerPool};
use crate::codec::{Codec, PayloadDecoder};
use crate::config::EffectiveConfig;
use crate::{
    //
    log_debug,
    log_error,
    log_warn,
    InboundMessage,
    Listener,
    ListenerError,
};

/// Snapshot of a listener's dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages delivered by the broker.
    pub received: u64,
    /// Messages accepted by the worker pool.
    pub submitted: u64,
    pub acked: u64,
    pub naked: u64,
    /// Handler calls that returned an error or panicked.
    pub handler_failures: u64,
    pub decode_failures: u64,
    /// Submissions refused by a saturated or closed pool.
    pub rejected: u64,
    /// Pull fetches that failed at the transport level.
    pub fetch_errors: u64,
    /// Ack or nak calls the broker did not accept.
    pub settle_failures: u64,
}

#[derive(Default)]
pub(crate) struct DispatchCounters {
    // ---
    received: AtomicU64,
    submitted: AtomicU64,
    acked: AtomicU64,
    naked: AtomicU64,
    handler_failures: AtomicU64,
    decode_failures: AtomicU64,
    rejected: AtomicU64,
    fetch_errors: AtomicU64,
    settle_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl DispatchCounters {
    // ---
    pub(crate) fn snapshot(&self) -> DispatchStats {
        // ---
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DispatchStats {
            received: get(&self.received),
            submitted: get(&self.submitted),
            acked: get(&self.acked),
            naked: get(&self.naked),
            handler_failures: get(&self.handler_failures),
            decode_failures: get(&self.decode_failures),
            rejected: get(&self.rejected),
            fetch_errors: get(&self.fetch_errors),
            settle_failures: get(&self.settle_failures),
        }
    }
}

struct DispatchContext<L> {
    // ---
    name: Arc<str>,
    listener: Arc<L>,
    auto_ack: bool,
    counters: DispatchCounters,
}

impl<L> DispatchContext<L> {
    // ---
    async fn nak(&self, message: &InboundMessage) {
        // ---
        bump(&self.counters.naked);
        if let Err(err) = message.nak().await {
            bump(&self.counters.settle_failures);
            log_error!(
                "listener {}: nak failed for {}: {err}",
                self.name,
                message.subject()
            );
        }
    }

    async fn handler_failed(&self, message: &InboundMessage, err: ListenerError) {
        // ---
        bump(&self.counters.handler_failures);
        log_error!("listener {}: {err} (subject {})", self.name, message.subject());
        self.nak(message).await;
    }

    async fn ack(&self, message: &InboundMessage) {
        // ---
        if let Err(err) = message.ack().await {
            bump(&self.counters.settle_failures);
            log_error!(
                "listener {}: ack failed for {}: {err}",
                self.name,
                message.subject()
            );
            return;
        }
        bump(&self.counters.acked);
    }
}

/// A decoded message waiting for a worker.
pub(crate) struct InFlightMessage<L: Listener> {
    // ---
    message: InboundMessage,
    payload: L::Message,
    ctx: Arc<DispatchContext<L>>,
}

#[async_trait::async_trait]
impl<L: Listener> Work for InFlightMessage<L> {
    // ---
    async fn run(self) {
        // ---
        let Self {
            message,
            payload,
            ctx,
        } = self;

        let outcome = AssertUnwindSafe(ctx.listener.on_message(payload))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                if ctx.auto_ack {
                    ctx.ack(&message).await;
                }
            }
            Ok(Err(err)) => {
                ctx.handler_failed(&message, ListenerError::Handler(err.to_string()))
                    .await;
            }
            Err(panic) => {
                let reason = format!("panicked: {}", panic_message(&*panic));
                ctx.handler_failed(&message, ListenerError::Handler(reason))
                    .await;
            }
        }
    }

    async fn abandon(self) {
        // ---
        log_debug!(
            "listener {}: returning unprocessed {} to the broker",
            self.ctx.name,
            self.message.subject()
        );
        self.ctx.nak(&self.message).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    // ---
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Type-erased receipt side of a dispatcher, used by subscriptions.
#[async_trait::async_trait]
pub(crate) trait MessageSink: Send + Sync {
    // ---
    /// Decode `message` and submit it for handling.
    async fn dispatch(&self, message: InboundMessage);

    fn record_fetch_error(&self);

    fn stats(&self) -> DispatchStats;

    /// Stop the worker pool.
    async fn shutdown(&self, mode: DrainMode);
}

pub(crate) type SinkPtr = Arc<dyn MessageSink>;

pub(crate) struct Dispatcher<L: Listener, C: Codec> {
    // ---
    ctx: Arc<DispatchContext<L>>,
    decoder: PayloadDecoder<L::Message>,
    codec: Arc<C>,
    pool: WorkerPool<InFlightMessage<L>>,
}

impl<L: Listener, C: Codec> Dispatcher<L, C> {
    // ---
    /// Build the dispatcher and start its worker pool.
    pub fn new(config: &EffectiveConfig, listener: Arc<L>, codec: Arc<C>) -> Self {
        // ---
        let ctx = Arc::new(DispatchContext {
            name: Arc::from(config.listener_name.as_str()),
            listener,
            auto_ack: config.auto_ack,
            counters: DispatchCounters::default(),
        });

        Self {
            ctx,
            decoder: PayloadDecoder::new(L::PAYLOAD),
            codec,
            pool: WorkerPool::new(&config.listener_name, config.pool.clone()),
        }
    }
}

#[async_trait::async_trait]
impl<L: Listener, C: Codec> MessageSink for Dispatcher<L, C> {
    // ---
    async fn dispatch(&self, message: InboundMessage) {
        // ---
        let ctx = &self.ctx;
        bump(&ctx.counters.received);

        let payload = match self.decoder.decode(message.bytes(), &*self.codec) {
            Ok(payload) => payload,
            Err(err) => {
                bump(&ctx.counters.decode_failures);
                log_error!(
                    "listener {}: dropping undecodable {} to redelivery: {err}",
                    ctx.name,
                    message.subject()
                );
                ctx.nak(&message).await;
                return;
            }
        };

        let job = InFlightMessage {
            message,
            payload,
            ctx: ctx.clone(),
        };

        match self.pool.submit(job).await {
            Ok(()) => bump(&ctx.counters.submitted),
            Err(refused) => {
                bump(&ctx.counters.rejected);
                let (job, _err) = refused.into_parts(&ctx.name);
                log_warn!(
                    "listener {}: {_err}, returning {} to the broker",
                    ctx.name,
                    job.message.subject()
                );
                job.abandon().await;
            }
        }
    }

    fn record_fetch_error(&self) {
        bump(&self.ctx.counters.fetch_errors);
    }

    fn stats(&self) -> DispatchStats {
        self.ctx.counters.snapshot()
    }

    async fn shutdown(&self, mode: DrainMode) {
        self.pool.shutdown(mode).await;
    }
}
