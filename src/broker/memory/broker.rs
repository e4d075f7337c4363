// src/broker/memory/broker.rs

//! In-memory broker implementation.
//!
//! This file contains the concrete implementation of the domain-level
//! `Broker` trait using in-process data structures only.
//!
//! The memory broker is the **reference implementation** of broker
//! semantics. Other brokers are expected to approximate this behavior as
//! closely as their underlying systems allow and to document any
//! unavoidable deviations.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::subject::subject_matches;
use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
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
    StreamConfig,
    StreamInfo,
    BAD_REQUEST,
    MSG_ID_HEADER,
    NOT_FOUND,
};

/// Status returned when no stream captures a published subject.
const NO_RESPONDERS: u16 = 503;

/// One broker call or acknowledgement, as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    StreamInfo { stream: String },
    CreateStream { stream: String, subjects: Vec<String> },
    CreateOrUpdateConsumer { stream: String, durable: String },
    SubscribePush { stream: String, consumer: String },
    SubscribePull { stream: String, consumer: String },
    Fetch { consumer: String, batch_size: usize },
    Publish { subject: String },
    Ack { consumer: String, sequence: u64 },
    Nak { consumer: String, sequence: u64 },
    /// A nak that exhausted `max_deliver`; the message is not redelivered.
    Term { consumer: String, sequence: u64 },
}

/// Broker call that an injected fault can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    StreamInfo,
    CreateStream,
    CreateConsumer,
    Subscribe,
    Fetch,
    Publish,
}

struct StoredMessage {
    sequence: u64,
    subject: Arc<str>,
    payload: Bytes,
    headers: Headers,
}

struct Delivery {
    message: Arc<StoredMessage>,
    deliveries: i64,
}

struct ConsumerState {
    // ---
    config: ConsumerConfig,
    queue: VecDeque<Delivery>,
    in_flight: HashMap<u64, Delivery>,
    notify: Arc<Notify>,
}

struct StreamState {
    // ---
    config: StreamConfig,
    next_sequence: u64,
    stored: BTreeMap<u64, Arc<StoredMessage>>,
    msg_ids: HashMap<String, u64>,
    consumers: HashMap<String, ConsumerState>,
}

#[derive(Default)]
struct State {
    streams: BTreeMap<String, StreamState>,
    closed: bool,
}

struct Shared {
    // ---
    id: String,
    state: Mutex<State>,
    journal: Mutex<VecDeque<BrokerOp>>,
    faults: Mutex<HashMap<FaultPoint, VecDeque<ListenerError>>>,
}

fn not_found(what: &str, name: &str) -> ListenerError {
    ListenerError::api(NOT_FOUND, format!("{what} {name} not found"))
}

impl Shared {
    // ---
    fn record(&self, op: BrokerOp) {
        let mut journal = lock_ignore_poison(&self.journal);
        if journal.len() == MemoryBroker::JOURNAL_CAPACITY {
            journal.pop_front();
        }
        journal.push_back(op);
    }

    fn check_fault(&self, point: FaultPoint) -> Result<()> {
        // ---
        match lock_ignore_poison(&self.faults)
            .get_mut(&point)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn open_state(&self) -> Result<MutexGuard<'_, State>> {
        // ---
        let state = lock_ignore_poison(&self.state);
        if state.closed {
            return Err(ListenerError::Transport("memory broker is closed".into()));
        }
        Ok(state)
    }

    fn consumer_notify(&self, stream: &str, consumer: &str) -> Result<(Arc<Notify>, bool)> {
        // ---
        let state = self.open_state()?;
        let consumer = state
            .streams
            .get(stream)
            .ok_or_else(|| not_found("stream", stream))?
            .consumers
            .get(consumer)
            .ok_or_else(|| not_found("consumer", consumer))?;

        Ok((consumer.notify.clone(), consumer.config.is_push()))
    }

    fn has_pending(&self, stream: &str, consumer: &str) -> bool {
        // ---
        lock_ignore_poison(&self.state)
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .is_some_and(|c| !c.queue.is_empty())
    }

    fn settle(&self, stream: &str, consumer: &str, sequence: u64, ack: bool) {
        // ---
        let op = {
            let mut state = lock_ignore_poison(&self.state);
            let Some(StreamState {
                config,
                stored,
                consumers,
                ..
            }) = state.streams.get_mut(stream)
            else {
                return;
            };
            let Some(consumer_state) = consumers.get_mut(consumer) else {
                return;
            };
            // already settled
            let Some(delivery) = consumer_state.in_flight.remove(&sequence) else {
                return;
            };

            let consumer = consumer.to_string();
            let max_deliver = consumer_state.config.max_deliver;

            if ack {
                if config.retention == RetentionPolicy::WorkQueue {
                    stored.remove(&sequence);
                }
                BrokerOp::Ack { consumer, sequence }
            } else if max_deliver > 0 && delivery.deliveries >= max_deliver {
                BrokerOp::Term { consumer, sequence }
            } else {
                consumer_state.queue.push_front(delivery);
                consumer_state.notify.notify_one();
                BrokerOp::Nak { consumer, sequence }
            }
        };
        self.record(op);
    }
}

/// Move up to `max` queued messages of a consumer to in-flight.
///
/// Returns the messages and whether more are still queued.
fn take_batch(
    shared: &Arc<Shared>,
    stream: &str,
    consumer: &str,
    max: usize,
) -> Result<(Vec<InboundMessage>, bool)> {
    // ---
    let mut state = shared.open_state()?;
    let consumer_state = state
        .streams
        .get_mut(stream)
        .ok_or_else(|| not_found("stream", stream))?
        .consumers
        .get_mut(consumer)
        .ok_or_else(|| not_found("consumer", consumer))?;

    let mut batch = Vec::new();
    while batch.len() < max {
        let Some(mut delivery) = consumer_state.queue.pop_front() else {
            break;
        };
        delivery.deliveries += 1;

        let msg = delivery.message.clone();
        let acker = MemoryAcker {
            shared: shared.clone(),
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            sequence: msg.sequence,
        };
        consumer_state.in_flight.insert(msg.sequence, delivery);

        batch.push(InboundMessage::new(
            msg.subject.clone(),
            msg.payload.clone(),
            msg.headers.clone(),
            Arc::new(acker),
        ));
    }

    Ok((batch, !consumer_state.queue.is_empty()))
}

struct MemoryAcker {
    shared: Arc<Shared>,
    stream: String,
    consumer: String,
    sequence: u64,
}

#[async_trait::async_trait]
impl Acknowledger for MemoryAcker {
    // ---
    async fn ack(&self) -> Result<()> {
        self.shared
            .settle(&self.stream, &self.consumer, self.sequence, true);
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        self.shared
            .settle(&self.stream, &self.consumer, self.sequence, false);
        Ok(())
    }
}

struct MemoryPullHandle {
    shared: Arc<Shared>,
    stream: String,
    consumer: String,
    notify: Arc<Notify>,
}

#[async_trait::async_trait]
impl PullHandle for MemoryPullHandle {
    // ---
    async fn fetch(&self, batch_size: usize, max_wait: Duration) -> Result<Vec<InboundMessage>> {
        // ---
        self.shared.record(BrokerOp::Fetch {
            consumer: self.consumer.clone(),
            batch_size,
        });
        self.shared.check_fault(FaultPoint::Fetch)?;

        let deadline = Instant::now() + max_wait;
        loop {
            let (batch, _) = take_batch(&self.shared, &self.stream, &self.consumer, batch_size)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn wait_for_message(&self, timeout: Duration) -> bool {
        // ---
        if self.shared.has_pending(&self.stream, &self.consumer) {
            return true;
        }
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }
}

/// Push delivery loop for one subscriber.
///
/// Subscribers of the same consumer share its queue, so a delivery group
/// is load-balanced by whichever subscriber is free.
async fn push_delivery(
    shared: Arc<Shared>,
    stream: String,
    consumer: String,
    notify: Arc<Notify>,
    callback: MessageCallback,
    mut stop: oneshot::Receiver<()>,
) {
    // ---
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut stop => break,
            next = next_message(&shared, &stream, &consumer, &notify) => next,
        };

        match next {
            Ok(message) => {
                callback(message).await;
                tokio::task::yield_now().await;
            }
            Err(_err) => {
                log_debug!("push delivery for {consumer} stopped: {_err}");
                break;
            }
        }
    }
}

async fn next_message(
    shared: &Arc<Shared>,
    stream: &str,
    consumer: &str,
    notify: &Notify,
) -> Result<InboundMessage> {
    // ---
    loop {
        let (mut batch, more) = take_batch(shared, stream, consumer, 1)?;
        if let Some(message) = batch.pop() {
            if more {
                // let another group member pick up the rest
                notify.notify_one();
            }
            return Ok(message);
        }
        notify.notified().await;
    }
}

/// In-memory broker.
///
/// This broker simulates a JetStream-style server entirely within the
/// process. It is intended for testing and for validating listener
/// behavior without network or timing variability.
///
/// ## Semantics
///
/// - Stream subjects support `*` and `>` wildcards; a publish is stored
///   by the first stream (in name order) whose subjects match.
/// - A new durable consumer receives the stored messages matching its
///   filter, then every later match.
/// - Ack removes the message from a work-queue stream. Nak puts it back
///   at the head of the consumer queue until `max_deliver` deliveries
///   have been made.
/// - Publishes carrying an already seen `Nats-Msg-Id` are reported as
///   duplicates and not stored again.
/// - Every call is appended to a journal readable with
///   [`journal`](Self::journal). The journal keeps the most recent
///   [`JOURNAL_CAPACITY`](Self::JOURNAL_CAPACITY) entries.
///
/// ## Non-Goals
///
/// - Persistence, ack wait timeouts and stream limits
/// - Exact emulation of JetStream error codes beyond not-found (404)
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    // ---
    /// Number of journal entries kept; older entries are dropped first.
    pub const JOURNAL_CAPACITY: usize = 4096;

    pub fn new() -> Self {
        // ---
        Self {
            shared: Arc::new(Shared {
                id: "memory".to_string(),
                state: Mutex::new(State::default()),
                journal: Mutex::new(VecDeque::new()),
                faults: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Calls and acknowledgements seen so far, in order.
    pub fn journal(&self) -> Vec<BrokerOp> {
        lock_ignore_poison(&self.shared.journal)
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear_journal(&self) {
        lock_ignore_poison(&self.shared.journal).clear();
    }

    /// Make the next call at `point` fail with `err`.
    ///
    /// Faults queue up: injecting twice fails the next two calls.
    pub fn fail_next(&self, point: FaultPoint, err: ListenerError) {
        lock_ignore_poison(&self.shared.faults)
            .entry(point)
            .or_default()
            .push_back(err);
    }

    /// Messages a consumer has not acknowledged yet (queued or in flight).
    pub fn pending(&self, stream: &str, consumer: &str) -> usize {
        // ---
        lock_ignore_poison(&self.shared.state)
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .map_or(0, |c| c.queue.len() + c.in_flight.len())
    }

    /// Messages currently stored in a stream.
    pub fn stored(&self, stream: &str) -> usize {
        lock_ignore_poison(&self.shared.state)
            .streams
            .get(stream)
            .map_or(0, |s| s.stored.len())
    }

    /// Definition of an existing consumer.
    pub fn consumer_config(&self, stream: &str, consumer: &str) -> Option<ConsumerConfig> {
        lock_ignore_poison(&self.shared.state)
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .map(|c| c.config.clone())
    }

    pub fn stream_names(&self) -> Vec<String> {
        lock_ignore_poison(&self.shared.state)
            .streams
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    // ---
    fn broker_id(&self) -> &str {
        &self.shared.id
    }

    async fn stream_info(&self, name: &str) -> Result<StreamInfo> {
        // ---
        self.shared.record(BrokerOp::StreamInfo {
            stream: name.to_string(),
        });
        self.shared.check_fault(FaultPoint::StreamInfo)?;

        let state = self.shared.open_state()?;
        let stream = state
            .streams
            .get(name)
            .ok_or_else(|| not_found("stream", name))?;

        Ok(StreamInfo {
            config: stream.config.clone(),
            messages: stream.stored.len() as u64,
        })
    }

    async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        // ---
        self.shared.record(BrokerOp::CreateStream {
            stream: config.name.clone(),
            subjects: config.subjects.clone(),
        });
        self.shared.check_fault(FaultPoint::CreateStream)?;

        let mut state = self.shared.open_state()?;
        if state.streams.contains_key(&config.name) {
            return Err(ListenerError::api(
                BAD_REQUEST,
                format!("stream name {} already in use", config.name),
            ));
        }

        state.streams.insert(
            config.name.clone(),
            StreamState {
                config: config.clone(),
                next_sequence: 1,
                stored: BTreeMap::new(),
                msg_ids: HashMap::new(),
                consumers: HashMap::new(),
            },
        );

        Ok(StreamInfo {
            config,
            messages: 0,
        })
    }

    async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo> {
        // ---
        self.shared.record(BrokerOp::CreateOrUpdateConsumer {
            stream: stream.to_string(),
            durable: config.durable_name.clone(),
        });
        self.shared.check_fault(FaultPoint::CreateConsumer)?;

        if config.durable_name.is_empty() {
            return Err(ListenerError::api(BAD_REQUEST, "durable name is required"));
        }

        let mut state = self.shared.open_state()?;
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| not_found("stream", stream))?;

        match stream_state.consumers.get_mut(&config.durable_name) {
            Some(existing) => {
                if existing.config != config {
                    log_debug!("updating consumer {} on {stream}", config.durable_name);
                    existing.config = config.clone();
                }
            }
            None => {
                let queue: VecDeque<Delivery> = stream_state
                    .stored
                    .values()
                    .filter(|m| subject_matches(&config.filter_subject, &m.subject))
                    .map(|m| Delivery {
                        message: m.clone(),
                        deliveries: 0,
                    })
                    .collect();

                let notify = Arc::new(Notify::new());
                if !queue.is_empty() {
                    notify.notify_one();
                }

                stream_state.consumers.insert(
                    config.durable_name.clone(),
                    ConsumerState {
                        config: config.clone(),
                        queue,
                        in_flight: HashMap::new(),
                        notify,
                    },
                );
            }
        }

        Ok(ConsumerInfo {
            stream_name: stream.to_string(),
            name: config.durable_name.clone(),
            config,
        })
    }

    async fn subscribe_push(
        &self,
        binding: PushBinding,
        callback: MessageCallback,
    ) -> Result<PushSubscriptionHandle> {
        // ---
        self.shared.record(BrokerOp::SubscribePush {
            stream: binding.stream.clone(),
            consumer: binding.consumer.clone(),
        });
        self.shared.check_fault(FaultPoint::Subscribe)?;

        let (notify, is_push) = self
            .shared
            .consumer_notify(&binding.stream, &binding.consumer)?;
        if !is_push {
            return Err(ListenerError::api(
                BAD_REQUEST,
                format!("consumer {} is not a push consumer", binding.consumer),
            ));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(push_delivery(
            self.shared.clone(),
            binding.stream,
            binding.consumer,
            notify,
            callback,
            stop_rx,
        ));

        Ok(PushSubscriptionHandle::new(stop_tx, task))
    }

    async fn subscribe_pull(&self, binding: PullBinding) -> Result<PullHandlePtr> {
        // ---
        self.shared.record(BrokerOp::SubscribePull {
            stream: binding.stream.clone(),
            consumer: binding.consumer.clone(),
        });
        self.shared.check_fault(FaultPoint::Subscribe)?;

        let (notify, is_push) = self
            .shared
            .consumer_notify(&binding.stream, &binding.consumer)?;
        if is_push {
            return Err(ListenerError::api(
                BAD_REQUEST,
                format!("consumer {} is a push consumer", binding.consumer),
            ));
        }

        Ok(Arc::new(MemoryPullHandle {
            shared: self.shared.clone(),
            stream: binding.stream,
            consumer: binding.consumer,
            notify,
        }))
    }

    async fn publish(&self, msg: OutboundMessage) -> Result<PublishAck> {
        // ---
        self.shared.record(BrokerOp::Publish {
            subject: msg.subject.clone(),
        });
        self.shared.check_fault(FaultPoint::Publish)?;

        let mut state = self.shared.open_state()?;
        let Some((name, stream)) = state.streams.iter_mut().find(|(_, s)| {
            s.config
                .subjects
                .iter()
                .any(|pattern| subject_matches(pattern, &msg.subject))
        }) else {
            return Err(ListenerError::api(
                NO_RESPONDERS,
                format!("no stream captures subject {}", msg.subject),
            ));
        };

        let msg_id = msg.headers.get(MSG_ID_HEADER).map(str::to_string);
        if let Some(&sequence) = msg_id.as_ref().and_then(|id| stream.msg_ids.get(id)) {
            return Ok(PublishAck {
                stream: name.clone(),
                sequence,
                duplicate: true,
            });
        }

        let sequence = stream.next_sequence;
        stream.next_sequence += 1;

        let stored = Arc::new(StoredMessage {
            sequence,
            subject: Arc::from(msg.subject.as_str()),
            payload: msg.payload,
            headers: msg.headers,
        });
        stream.stored.insert(sequence, stored.clone());
        if let Some(id) = msg_id {
            stream.msg_ids.insert(id, sequence);
        }

        for consumer in stream.consumers.values_mut() {
            if subject_matches(&consumer.config.filter_subject, &stored.subject) {
                consumer.queue.push_back(Delivery {
                    message: stored.clone(),
                    deliveries: 0,
                });
                consumer.notify.notify_one();
            }
        }

        Ok(PublishAck {
            stream: name.clone(),
            sequence,
            duplicate: false,
        })
    }

    /// Close the broker.
    ///
    /// Every later call fails and running push deliveries stop.
    async fn close(&self) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.shared.state);
        state.closed = true;
        for stream in state.streams.values() {
            for consumer in stream.consumers.values() {
                consumer.notify.notify_waiters();
            }
        }
        Ok(())
    }
}

/// Create a new in-memory broker.
///
/// This broker is always available and requires no external resources.
pub async fn create_broker() -> Result<BrokerPtr> {
    Ok(Arc::new(MemoryBroker::new()))
}
