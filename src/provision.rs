//! Stream and durable consumer provisioning.
//!
//! Runs before a listener subscribes. Both operations are idempotent:
//! an existing stream is left untouched and consumer creation goes
//! through the broker's create-or-update call.

use crate::config::EffectiveConfig;
use crate::subject::covers;
use crate::{
    //
    log_debug,
    log_info,
    log_warn,
    BrokerPtr,
    ConsumerConfig,
    ConsumerInfo,
    ListenerError,
    Result,
    StreamConfig,
    StreamInfo,
    BAD_REQUEST,
};

/// Ensures broker-side resources exist for listeners.
#[derive(Clone)]
pub struct Provisioner {
    broker: BrokerPtr,
}

impl Provisioner {
    // ---
    pub fn new(broker: BrokerPtr) -> Self {
        Self { broker }
    }

    /// Look up stream `name`, creating it when the broker reports it
    /// missing.
    ///
    /// New streams use file storage and work-queue retention with the
    /// given subjects. An existing stream is never modified, even when its
    /// subjects do not cover `subjects`; that case is logged.
    ///
    /// # Errors
    ///
    /// Any lookup failure other than "not found", and any create failure.
    pub async fn ensure_stream(&self, name: &str, subjects: &[String]) -> Result<StreamInfo> {
        // ---
        match self.broker.stream_info(name).await {
            Ok(info) => {
                for subject in subjects {
                    if !covers(info.subjects(), subject) {
                        log_warn!(
                            "stream {name} exists but its subjects {:?} do not cover {subject}",
                            info.subjects()
                        );
                    }
                }
                log_debug!("stream {name} already exists");
                Ok(info)
            }
            Err(err) if err.is_not_found() => {
                log_info!(
                    "[{}] creating stream {name} for subjects {subjects:?}",
                    self.broker.broker_id()
                );
                let config = StreamConfig::work_queue(name, subjects.to_vec());

                match self.broker.create_stream(config).await {
                    Ok(info) => Ok(info),
                    // Lost a create race with another process.
                    Err(ListenerError::Api { code, .. }) if code == BAD_REQUEST => {
                        self.broker.stream_info(name).await
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Create the durable consumer or update its definition.
    pub async fn ensure_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo> {
        // ---
        log_debug!(
            "[{}] create or update consumer {} on {stream} (filter {}, push: {})",
            self.broker.broker_id(),
            config.durable_name,
            config.filter_subject,
            config.is_push()
        );
        self.broker.create_or_update_consumer(stream, config).await
    }

    /// Provision everything one listener needs.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Provisioning`] naming the listener.
    pub async fn provision(&self, config: &EffectiveConfig) -> Result<ConsumerInfo> {
        // ---
        let fail = |err: ListenerError| ListenerError::Provisioning {
            listener: config.listener_name.clone(),
            reason: err.to_string(),
        };

        self.ensure_stream(&config.stream, std::slice::from_ref(&config.filter_subject))
            .await
            .map_err(fail)?;

        self.ensure_consumer(&config.stream, config.consumer_config())
            .await
            .map_err(fail)
    }
}
