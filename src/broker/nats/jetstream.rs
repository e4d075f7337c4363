//! JetStream broker implementation using `async-nats`.
//!
//! This module provides an implementation of the `Broker` trait backed by
//! a single NATS connection and its JetStream context. The connection is
//! shared by every listener; `async-nats` multiplexes it internally.
//!
//! ## Mapping
//!
//! - `stream_info` / `create_stream` map to the JetStream stream API.
//!   Server errors keep their status code, so a missing stream is a 404.
//! - `create_or_update_consumer` uses the create-or-update consumer call
//!   with a push or pull configuration.
//! - Push subscriptions consume the bound push consumer's message stream,
//!   joining the deliver group as a queue subscriber.
//! - Pull fetches request a batch that expires after `max_wait`.
//! - Nak maps to `AckKind::Nak` without a delay.
//!
//! ## Deviations from the reference broker
//!
//! - The server cannot signal that a pull consumer has new messages, so
//!   `wait_for_message` sleeps for the full interval.
//! - Redelivery of unacknowledged messages also happens after the
//!   consumer's ack wait, not only on nak.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, context::GetStreamErrorKind, stream, AckKind};
use async_nats::HeaderMap;
use futures_util::StreamExt;
use tokio::sync::oneshot;

use crate::{
    //
    log_debug,
    log_info,
    log_warn,
    Acknowledger,
    Broker,
    BrokerPtr,
    ConsumerConfig,
    ConsumerInfo,
    Headers,
    InboundMessage,
    ListenerError,
    MessageCallback,
    OutboundMessage,
    PublishAck,
    PullBinding,
    PullHandle,
    PullHandlePtr,
    PushBinding,
    PushSubscriptionHandle,
    Result,
    RetentionPolicy,
    StorageKind,
    StreamConfig,
    StreamInfo,
};

fn transport(err: impl Display) -> ListenerError {
    ListenerError::Transport(err.to_string())
}

fn api(err: &jetstream::Error) -> ListenerError {
    ListenerError::api(u16::try_from(err.code()).unwrap_or(500), err.to_string())
}

fn stream_info_from(info: &stream::Info) -> StreamInfo {
    // ---
    let storage = match info.config.storage {
        stream::StorageType::File => StorageKind::File,
        stream::StorageType::Memory => StorageKind::Memory,
    };
    let retention = match info.config.retention {
        stream::RetentionPolicy::Limits => RetentionPolicy::Limits,
        stream::RetentionPolicy::Interest => RetentionPolicy::Interest,
        stream::RetentionPolicy::WorkQueue => RetentionPolicy::WorkQueue,
    };

    StreamInfo {
        config: StreamConfig {
            name: info.config.name.clone(),
            subjects: info.config.subjects.clone(),
            storage,
            retention,
        },
        messages: info.state.messages,
    }
}

fn consumer_error(err: stream::ConsumerError) -> ListenerError {
    match err.kind() {
        stream::ConsumerErrorKind::JetStream(js) => api(&js),
        _ => transport(err),
    }
}

fn headers_from(map: &HeaderMap) -> Headers {
    // ---
    let mut headers = Headers::new();
    for (name, values) in map.iter() {
        for value in values {
            headers.insert(name.to_string(), value.as_str());
        }
    }
    headers
}

fn header_map_from(headers: &Headers) -> HeaderMap {
    // ---
    let mut map = HeaderMap::new();
    for (name, values) in headers.iter() {
        for value in values {
            map.append(name, value.as_str());
        }
    }
    map
}

fn inbound(message: jetstream::Message) -> InboundMessage {
    // ---
    let subject: Arc<str> = Arc::from(message.subject.as_str());
    let payload = message.payload.clone();
    let headers = message
        .headers
        .as_ref()
        .map(headers_from)
        .unwrap_or_default();

    InboundMessage::new(subject, payload, headers, Arc::new(NatsAcker { message }))
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait::async_trait]
impl Acknowledger for NatsAcker {
    // ---
    async fn ack(&self) -> Result<()> {
        self.message.ack().await.map_err(transport)
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(transport)
    }
}

struct NatsPullHandle {
    consumer: consumer::PullConsumer,
}

#[async_trait::async_trait]
impl PullHandle for NatsPullHandle {
    // ---
    async fn fetch(&self, batch_size: usize, max_wait: Duration) -> Result<Vec<InboundMessage>> {
        // ---
        let mut batch = Box::pin(
            self.consumer
                .batch()
                .max_messages(batch_size)
                .expires(max_wait)
                .messages()
                .await
                .map_err(transport)?,
        );

        let mut out = Vec::with_capacity(batch_size);
        while let Some(next) = batch.next().await {
            match next {
                Ok(message) => out.push(inbound(message)),
                Err(err) if out.is_empty() => return Err(transport(err)),
                Err(err) => {
                    log_warn!("batch ended early after {} messages: {err}", out.len());
                    break;
                }
            }
        }
        Ok(out)
    }
}

/// JetStream broker sharing one NATS connection.
struct NatsBroker {
    // ---
    id: String,
    client: async_nats::Client,
    context: jetstream::Context,
}

impl NatsBroker {
    // ---
    async fn stream(&self, name: &str) -> Result<stream::Stream> {
        // ---
        self.context
            .get_stream(name)
            .await
            .map_err(|err| match err.kind() {
                GetStreamErrorKind::JetStream(js) => api(&js),
                _ => transport(err),
            })
    }
}

#[async_trait::async_trait]
impl Broker for NatsBroker {
    // ---
    fn broker_id(&self) -> &str {
        &self.id
    }

    async fn stream_info(&self, name: &str) -> Result<StreamInfo> {
        let stream = self.stream(name).await?;
        Ok(stream_info_from(stream.cached_info()))
    }

    async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        // ---
        let storage = match config.storage {
            StorageKind::File => stream::StorageType::File,
            StorageKind::Memory => stream::StorageType::Memory,
        };
        let retention = match config.retention {
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
            RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
        };

        let stream = self
            .context
            .create_stream(stream::Config {
                name: config.name,
                subjects: config.subjects,
                storage,
                retention,
                ..Default::default()
            })
            .await
            .map_err(|err| match err.kind() {
                jetstream::context::CreateStreamErrorKind::JetStream(js) => api(&js),
                _ => transport(err),
            })?;

        Ok(stream_info_from(stream.cached_info()))
    }

    async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo> {
        // ---
        let stream = self.stream(stream).await?;
        let ack_policy = match config.ack_policy {
            crate::AckPolicy::Explicit => consumer::AckPolicy::Explicit,
            crate::AckPolicy::All => consumer::AckPolicy::All,
            crate::AckPolicy::None => consumer::AckPolicy::None,
        };

        let info = match &config.deliver_subject {
            Some(deliver_subject) => {
                let push = consumer::push::Config {
                    durable_name: Some(config.durable_name.clone()),
                    deliver_subject: deliver_subject.clone(),
                    deliver_group: config.deliver_group.clone(),
                    filter_subject: config.filter_subject.clone(),
                    ack_policy,
                    max_deliver: config.max_deliver,
                    ..Default::default()
                };
                let consumer = stream.create_consumer(push).await.map_err(consumer_error)?;
                consumer.cached_info().clone()
            }
            None => {
                let pull = consumer::pull::Config {
                    durable_name: Some(config.durable_name.clone()),
                    filter_subject: config.filter_subject.clone(),
                    ack_policy,
                    max_deliver: config.max_deliver,
                    ..Default::default()
                };
                let consumer = stream.create_consumer(pull).await.map_err(consumer_error)?;
                consumer.cached_info().clone()
            }
        };

        Ok(ConsumerInfo {
            stream_name: info.stream_name,
            name: info.name,
            config,
        })
    }

    async fn subscribe_push(
        &self,
        binding: PushBinding,
        callback: MessageCallback,
    ) -> Result<PushSubscriptionHandle> {
        // ---
        let stream = self.stream(&binding.stream).await?;
        let consumer: consumer::PushConsumer = stream
            .get_consumer(&binding.consumer)
            .await
            .map_err(transport)?;
        let mut messages = Box::pin(consumer.messages().await.map_err(transport)?);

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let consumer_name = binding.consumer;

        let task = tokio::spawn(async move {
            // ---
            loop {
                let next = tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    next = messages.next() => next,
                };

                match next {
                    Some(Ok(message)) => callback(inbound(message)).await,
                    Some(Err(err)) => {
                        log_warn!("push consumer {consumer_name}: {err}");
                    }
                    None => break,
                }
            }
            log_debug!("push consumer {consumer_name} delivery stopped");
        });

        Ok(PushSubscriptionHandle::new(stop_tx, task))
    }

    async fn subscribe_pull(&self, binding: PullBinding) -> Result<PullHandlePtr> {
        // ---
        let stream = self.stream(&binding.stream).await?;
        let consumer: consumer::PullConsumer = stream
            .get_consumer(&binding.consumer)
            .await
            .map_err(transport)?;

        Ok(Arc::new(NatsPullHandle { consumer }))
    }

    async fn publish(&self, msg: OutboundMessage) -> Result<PublishAck> {
        // ---
        let headers = header_map_from(&msg.headers);

        let ack = self
            .context
            .publish_with_headers(msg.subject, headers, msg.payload)
            .await
            .map_err(transport)?
            .await
            .map_err(transport)?;

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    /// Flush pending publishes. The connection closes when the last
    /// handle to it is dropped.
    async fn close(&self) -> Result<()> {
        self.client.flush().await.map_err(transport)
    }
}

/// Connect to a NATS server and create a JetStream broker.
pub async fn create_broker(url: &str) -> Result<BrokerPtr> {
    // ---
    let client = async_nats::connect(url).await.map_err(transport)?;
    let context = jetstream::new(client.clone());
    log_info!("connected to NATS at {url}");

    Ok(Arc::new(NatsBroker {
        id: format!("nats:{url}"),
        client,
        context,
    }))
}
