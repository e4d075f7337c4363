// tests/pull_loop.rs
//
// Pull loop pacing against a scripted broker. The tokio clock is paused,
// so every interval wait completes at its exact deadline.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use mom_listener::{
    //
    text_listener_fn,
    AckPolicy,
    Acknowledger,
    Broker,
    BrokerPtr,
    ConsumerConfig,
    ConsumerInfo,
    DrainMode,
    HandlerError,
    Headers,
    InboundMessage,
    ListenerContainer,
    ListenerDeclaration,
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
    StreamConfig,
    StreamInfo,
};

type Step = Result<Vec<&'static str>>;

#[derive(Default)]
struct Observed {
    fetches: Vec<Duration>,
    acks: Vec<String>,
}

struct RecordingAcker {
    body: &'static str,
    observed: Arc<Mutex<Observed>>,
}

#[mom_listener::async_trait]
impl Acknowledger for RecordingAcker {
    // ---
    async fn ack(&self) -> Result<()> {
        self.observed.lock().unwrap().acks.push(self.body.to_string());
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        Ok(())
    }
}

/// Pull handle replaying fixed fetch results. Once the script runs out,
/// fetches never complete.
struct ScriptedPull {
    steps: Mutex<VecDeque<Step>>,
    started: Instant,
    observed: Arc<Mutex<Observed>>,
}

#[mom_listener::async_trait]
impl PullHandle for ScriptedPull {
    // ---
    async fn fetch(&self, _batch_size: usize, _max_wait: Duration) -> Result<Vec<InboundMessage>> {
        // ---
        self.observed
            .lock()
            .unwrap()
            .fetches
            .push(self.started.elapsed());

        let step = self.steps.lock().unwrap().pop_front();
        let Some(step) = step else {
            return std::future::pending().await;
        };

        let bodies = step?;
        Ok(bodies
            .into_iter()
            .map(|body| {
                let acker = RecordingAcker {
                    body,
                    observed: self.observed.clone(),
                };
                InboundMessage::new(
                    "orders.new",
                    Bytes::from_static(body.as_bytes()),
                    Headers::new(),
                    Arc::new(acker),
                )
            })
            .collect())
    }
}

/// Broker whose streams and consumers always exist.
struct ScriptedBroker {
    pull: Mutex<Option<PullHandlePtr>>,
}

impl ScriptedBroker {
    fn new(steps: Vec<Step>, observed: Arc<Mutex<Observed>>) -> Self {
        // ---
        let pull = ScriptedPull {
            steps: Mutex::new(steps.into()),
            started: Instant::now(),
            observed,
        };
        Self {
            pull: Mutex::new(Some(Arc::new(pull))),
        }
    }
}

#[mom_listener::async_trait]
impl Broker for ScriptedBroker {
    // ---
    fn broker_id(&self) -> &str {
        "scripted"
    }

    async fn stream_info(&self, name: &str) -> Result<StreamInfo> {
        Ok(StreamInfo {
            config: StreamConfig::work_queue(name, vec!["orders.>".into()]),
            messages: 0,
        })
    }

    async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
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
        assert_eq!(config.ack_policy, AckPolicy::Explicit);
        Ok(ConsumerInfo {
            stream_name: stream.to_string(),
            name: config.durable_name.clone(),
            config,
        })
    }

    async fn subscribe_push(
        &self,
        _binding: PushBinding,
        _callback: MessageCallback,
    ) -> Result<PushSubscriptionHandle> {
        Err(ListenerError::api(400, "pull only"))
    }

    async fn subscribe_pull(&self, _binding: PullBinding) -> Result<PullHandlePtr> {
        self.pull
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ListenerError::api(400, "already bound"))
    }

    async fn publish(&self, _msg: OutboundMessage) -> Result<PublishAck> {
        Err(ListenerError::Transport("read-only broker".into()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn declaration(initial_delay: Duration) -> ListenerDeclaration {
    // ---
    ListenerDeclaration::builder()
        .stream("ORDERS")
        .filter_subject("orders.new")
        .pull_batch_size(10)
        .pull_interval(Duration::from_millis(1000))
        .max_wait(Duration::from_millis(3000))
        .pull_delay(initial_delay)
        .consume_thread_number(1)
        .consume_thread_max(1)
        .build()
        .expect("valid declaration")
}

async fn run_script(
    declaration: ListenerDeclaration,
    steps: Vec<Step>,
    expect_handled: usize,
) -> (Observed, Vec<String>, mom_listener::DispatchStats) {
    // ---
    let observed = Arc::new(Mutex::new(Observed::default()));
    let broker: BrokerPtr = Arc::new(ScriptedBroker::new(steps, observed.clone()));

    let handled = Arc::new(Mutex::new(Vec::new()));
    let sink = handled.clone();

    let container = ListenerContainer::builder(broker)
        .register(
            "audit",
            text_listener_fn(move |text: String| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(text);
                    Ok::<(), HandlerError>(())
                }
            }),
            declaration,
        )
        .build()
        .expect("container");

    let report = container.start().await.expect("start");
    assert!(report.is_healthy());

    let waited = tokio::time::timeout(Duration::from_secs(30), async {
        while handled.lock().unwrap().len() < expect_handled {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "messages were not handled");

    let stopped = container
        .shutdown(DrainMode::Complete)
        .await
        .expect("shutdown");

    let observed = std::mem::take(&mut *observed.lock().unwrap());
    let handled = handled.lock().unwrap().clone();
    (observed, handled, stopped[0].1)
}

fn assert_fetched_at(fetches: &[Duration], expected_ms: &[u64]) {
    // ---
    assert!(fetches.len() >= expected_ms.len(), "fetches: {fetches:?}");
    for (at, expected) in fetches.iter().zip(expected_ms) {
        let at = at.as_millis() as u64;
        assert!(
            at.abs_diff(*expected) <= 2,
            "fetch at {at}ms, expected {expected}ms ({fetches:?})"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn empty_fetches_wait_one_interval() {
    // ---
    let steps = vec![
        Ok(vec![]),
        Ok(vec![]),
        Ok(vec!["m1", "m2"]),
        Ok(vec![]),
        Ok(vec!["m3"]),
    ];

    let (observed, handled, stats) = run_script(declaration(Duration::ZERO), steps, 3).await;

    // five scripted fetches plus the one left pending at shutdown
    assert_eq!(observed.fetches.len(), 6);
    assert_fetched_at(&observed.fetches, &[0, 1000, 2000, 2000, 3000, 3000]);

    assert_eq!(handled, ["m1", "m2", "m3"]);
    assert_eq!(observed.acks, ["m1", "m2", "m3"]);

    assert_eq!(stats.received, 3);
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.acked, 3);
    assert_eq!(stats.fetch_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn fetch_error_does_not_stop_the_loop() {
    // ---
    let steps = vec![
        Err(ListenerError::Transport("connection reset".into())),
        Err(ListenerError::api(503, "no responders")),
        Ok(vec!["m1"]),
    ];

    let (observed, handled, stats) = run_script(declaration(Duration::ZERO), steps, 1).await;

    // errors wait the interval like an empty fetch
    assert_fetched_at(&observed.fetches, &[0, 1000, 2000, 2000]);
    assert_eq!(handled, ["m1"]);
    assert_eq!(stats.fetch_errors, 2);
    assert_eq!(stats.acked, 1);
}

#[tokio::test(start_paused = true)]
async fn first_fetch_waits_for_pull_delay() {
    // ---
    let steps = vec![Ok(vec!["m1"])];

    let (observed, handled, stats) =
        run_script(declaration(Duration::from_millis(500)), steps, 1).await;

    // nothing before the delay; the batch is followed by an immediate fetch
    assert_eq!(observed.fetches.len(), 2);
    assert_fetched_at(&observed.fetches, &[500, 500]);
    assert_eq!(handled, ["m1"]);
    assert_eq!(stats.acked, 1);
}
