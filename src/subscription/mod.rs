//! Subscription manager.
//!
//! Binds one provisioned listener to the broker in the mode its
//! configuration selected: a broker-driven push callback, or a dedicated
//! pull loop. Either way every delivered message goes to the listener's
//! dispatcher.

mod pull;
mod push;

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{EffectiveConfig, SubscriptionMode};
use crate::dispatch::{DispatchStats, DrainMode, SinkPtr};
use crate::{
    //
    log_info,
    BrokerPtr,
    ConsumerInfo,
    ListenerError,
    PullBinding,
    PushBinding,
    PushSubscriptionHandle,
    Result,
};

use pull::PullLoop;
use push::delivery_callback;

/// Point-in-time view of one active listener subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub name: String,
    pub config: EffectiveConfig,
    pub consumer: ConsumerInfo,
    pub stats: DispatchStats,
}

impl SubscriptionInfo {
    pub fn mode(&self) -> &SubscriptionMode {
        &self.config.mode
    }
}

enum Driver {
    Push(PushSubscriptionHandle),
    Pull {
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
}

/// A running subscription. Owns the delivery driver and the dispatcher.
pub(crate) struct ActiveSubscription {
    // ---
    config: EffectiveConfig,
    consumer: ConsumerInfo,
    sink: SinkPtr,
    driver: Driver,
}

impl ActiveSubscription {
    // ---
    /// Start delivery for a provisioned consumer.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Subscribe`] if the broker refuses the
    /// binding.
    pub async fn open(
        broker: &BrokerPtr,
        config: EffectiveConfig,
        consumer: ConsumerInfo,
        sink: SinkPtr,
    ) -> Result<Self> {
        // ---
        let name: Arc<str> = Arc::from(config.listener_name.as_str());
        let fail = |err: ListenerError| ListenerError::Subscribe {
            listener: config.listener_name.clone(),
            reason: err.to_string(),
        };

        let driver = match &config.mode {
            SubscriptionMode::Push { deliver_group, .. } => {
                let binding = PushBinding {
                    stream: config.stream.clone(),
                    consumer: consumer.name.clone(),
                    filter_subject: config.filter_subject.clone(),
                    deliver_group: Some(deliver_group.clone()),
                };
                let handle = broker
                    .subscribe_push(binding, delivery_callback(name, sink.clone()))
                    .await
                    .map_err(fail)?;
                Driver::Push(handle)
            }
            SubscriptionMode::Pull {
                batch_size,
                interval,
                max_wait,
                initial_delay,
            } => {
                let binding = PullBinding {
                    stream: config.stream.clone(),
                    consumer: consumer.name.clone(),
                    filter_subject: config.filter_subject.clone(),
                };
                let handle = broker.subscribe_pull(binding).await.map_err(fail)?;

                let (stop, stop_rx) = oneshot::channel();
                let pull_loop = PullLoop {
                    name,
                    handle,
                    sink: sink.clone(),
                    batch_size: *batch_size,
                    interval: *interval,
                    max_wait: *max_wait,
                    initial_delay: *initial_delay,
                };
                Driver::Pull {
                    stop,
                    task: pull_loop.spawn(stop_rx),
                }
            }
        };

        log_info!(
            "listener {} subscribed ({}) to {} on {} via consumer {}",
            config.listener_name,
            config.mode.label(),
            config.filter_subject,
            config.stream,
            consumer.name
        );

        Ok(Self {
            config,
            consumer,
            sink,
            driver,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.listener_name
    }

    pub fn info(&self) -> SubscriptionInfo {
        // ---
        SubscriptionInfo {
            name: self.config.listener_name.clone(),
            config: self.config.clone(),
            consumer: self.consumer.clone(),
            stats: self.sink.stats(),
        }
    }

    /// Stop receipt, then drain the worker pool.
    pub async fn close(self, mode: DrainMode) -> DispatchStats {
        // ---
        match self.driver {
            Driver::Push(handle) => handle.unsubscribe().await,
            Driver::Pull { stop, task } => {
                let _ = stop.send(());
                let _ = task.await;
            }
        }

        self.sink.shutdown(mode).await;
        log_info!("listener {} stopped", self.config.listener_name);
        self.sink.stats()
    }
}
