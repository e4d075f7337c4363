// tests/container_memory.rs

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mom_listener::{
    //
    listener_fn,
    text_listener_fn,
    BrokerOp,
    BrokerPtr,
    DrainMode,
    HandlerError,
    Listener,
    ListenerContainer,
    ListenerDeclaration,
    ListenerError,
    MemoryBroker,
    PayloadType,
    SubjectOverride,
    SubjectOverrides,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    fail: bool,
}

fn order(id: u32) -> Order {
    Order { id, fail: false }
}

fn memory_broker() -> (Arc<MemoryBroker>, BrokerPtr) {
    // ---
    let memory = Arc::new(MemoryBroker::new());
    let broker: BrokerPtr = memory.clone();
    (memory, broker)
}

fn pull_declaration(stream: &str, subject: &str) -> ListenerDeclaration {
    // ---
    ListenerDeclaration::builder()
        .stream(stream)
        .filter_subject(subject)
        .pull_interval(Duration::from_millis(10))
        .max_wait(Duration::from_millis(20))
        .build()
        .expect("valid declaration")
}

/// Poll `check` until it holds, failing the test after two seconds.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    // ---
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn count_ops(memory: &MemoryBroker, pred: impl Fn(&BrokerOp) -> bool) -> usize {
    memory.journal().iter().filter(|op| pred(op)).count()
}

#[tokio::test]
async fn handler_outcome_decides_ack_or_nak() -> mom_listener::Result<()> {
    // ---
    init_logging();
    let (memory, broker) = memory_broker();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();

    let declaration = ListenerDeclaration::builder()
        .stream("ORDERS")
        .filter_subject("orders.new")
        .max_deliver(2)
        .pull_interval(Duration::from_millis(10))
        .max_wait(Duration::from_millis(20))
        .build()?;

    let container = ListenerContainer::builder(broker)
        .register(
            "audit",
            listener_fn(move |order: Order| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(order.id);
                    if order.fail {
                        return Err::<(), HandlerError>("rejected order".into());
                    }
                    Ok(())
                }
            }),
            declaration,
        )
        .build()?;

    let report = container.start().await?;
    assert!(report.is_healthy());

    let publisher = container.publisher();
    publisher.publish("orders.new", &order(1)).await?;
    publisher
        .publish("orders.new", &Order { id: 2, fail: true })
        .await?;

    eventually("settlements", || {
        count_ops(&memory, |op| {
            matches!(op, BrokerOp::Ack { .. } | BrokerOp::Term { .. })
        }) == 2
    })
    .await;

    let settled: Vec<BrokerOp> = memory
        .journal()
        .into_iter()
        .filter(|op| {
            matches!(
                op,
                BrokerOp::Ack { .. } | BrokerOp::Nak { .. } | BrokerOp::Term { .. }
            )
        })
        .collect();
    assert!(settled.contains(&BrokerOp::Ack {
        consumer: "audit".into(),
        sequence: 1
    }));
    assert!(settled.contains(&BrokerOp::Nak {
        consumer: "audit".into(),
        sequence: 2
    }));
    assert!(settled.contains(&BrokerOp::Term {
        consumer: "audit".into(),
        sequence: 2
    }));

    // failed order was delivered twice, then given up on
    let mut ids = seen.lock().unwrap().clone();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 2]);

    let stopped = container.shutdown(DrainMode::Complete).await?;
    let (name, stats) = &stopped[0];
    assert_eq!(name, "audit");
    assert_eq!(stats.received, 3);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.naked, 2);
    assert_eq!(stats.handler_failures, 2);
    Ok(())
}

#[tokio::test]
async fn undecodable_body_is_naked_without_calling_handler() -> mom_listener::Result<()> {
    // ---
    init_logging();
    let (memory, broker) = memory_broker();

    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();

    let container = ListenerContainer::builder(broker)
        .register(
            "billing",
            listener_fn(move |_order: Order| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Ok::<(), HandlerError>(())
                }
            }),
            ListenerDeclaration::builder()
                .stream("BILLING")
                .filter_subject("billing.due")
                .max_deliver(1)
                .pull_interval(Duration::from_millis(10))
                .max_wait(Duration::from_millis(20))
                .build()?,
        )
        .build()?;
    container.start().await?;

    container
        .publisher()
        .publish_text("billing.due", "not json")
        .await?;

    // a single delivery attempt, so the nak terminates it
    eventually("term", || {
        count_ops(&memory, |op| matches!(op, BrokerOp::Term { .. })) == 1
    })
    .await;

    assert_eq!(*calls.lock().unwrap(), 0);
    let stats = container.subscription("billing").expect("active").stats;
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.submitted, 0);
    assert_eq!(stats.acked, 0);

    container.shutdown(DrainMode::NakPending).await?;
    Ok(())
}

#[tokio::test]
async fn without_auto_ack_success_leaves_message_pending() -> mom_listener::Result<()> {
    // ---
    init_logging();
    let (memory, broker) = memory_broker();

    let handled = Arc::new(Mutex::new(false));
    let flag = handled.clone();

    let declaration = ListenerDeclaration::builder()
        .stream("MANUAL")
        .filter_subject("manual.work")
        .auto_ack(false)
        .pull_interval(Duration::from_millis(10))
        .max_wait(Duration::from_millis(20))
        .build()?;

    let container = ListenerContainer::builder(broker)
        .register(
            "manual",
            listener_fn(move |_order: Order| {
                let flag = flag.clone();
                async move {
                    *flag.lock().unwrap() = true;
                    Ok::<(), HandlerError>(())
                }
            }),
            declaration,
        )
        .build()?;
    container.start().await?;

    container.publisher().publish("manual.work", &order(7)).await?;
    eventually("handler call", || *handled.lock().unwrap()).await;

    let stats = container.shutdown(DrainMode::Complete).await?;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].1.acked, 0);
    assert_eq!(stats[0].1.naked, 0);

    assert_eq!(count_ops(&memory, |op| matches!(op, BrokerOp::Ack { .. })), 0);
    assert_eq!(memory.pending("MANUAL", "manual"), 1);
    Ok(())
}

#[tokio::test]
async fn text_listener_receives_body_verbatim() -> mom_listener::Result<()> {
    // ---
    init_logging();
    let (_memory, broker) = memory_broker();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let container = ListenerContainer::builder(broker)
        .register(
            "raw",
            text_listener_fn(move |text: String| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(text);
                    Ok::<(), HandlerError>(())
                }
            }),
            pull_declaration("RAW", "raw.in"),
        )
        .build()?;
    container.start().await?;

    let body = r#"{"id": 1,   "fail": false}"#;
    container.publisher().publish_text("raw.in", body).await?;

    eventually("text delivery", || !received.lock().unwrap().is_empty()).await;
    assert_eq!(received.lock().unwrap().as_slice(), [body.to_string()]);

    container.shutdown(DrainMode::Complete).await?;
    Ok(())
}

struct PlainText {
    received: Arc<Mutex<Vec<String>>>,
}

#[mom_listener::async_trait]
impl Listener for PlainText {
    type Message = String;

    async fn on_message(&self, text: String) -> Result<(), HandlerError> {
        self.received.lock().unwrap().push(text);
        Ok(())
    }
}

#[tokio::test]
async fn string_listener_with_default_payload_gets_raw_text() -> mom_listener::Result<()> {
    // ---
    init_logging();
    let (_memory, broker) = memory_broker();

    let received = Arc::new(Mutex::new(Vec::new()));
    let listener = PlainText {
        received: received.clone(),
    };

    let container = ListenerContainer::builder(broker)
        .register("plain", listener, pull_declaration("PLAIN", "plain.in"))
        .build()?;
    let report = container.start().await?;
    assert!(report.is_healthy());

    container.publisher().publish_text("plain.in", "hello").await?;

    eventually("text delivery", || !received.lock().unwrap().is_empty()).await;
    assert_eq!(received.lock().unwrap().as_slice(), ["hello".to_string()]);

    let stopped = container.shutdown(DrainMode::Complete).await?;
    assert_eq!(stopped[0].1.decode_failures, 0);
    assert_eq!(stopped[0].1.acked, 1);
    Ok(())
}

#[tokio::test]
async fn endlessly_redelivered_message_leaves_runtime_responsive() -> mom_listener::Result<()> {
    // ---
    init_logging();
    let (memory, broker) = memory_broker();

    // max_deliver stays unlimited, so the broken body comes back forever
    let container = ListenerContainer::builder(broker)
        .register(
            "counter",
            listener_fn(|_n: u32| async { Ok::<(), HandlerError>(()) }),
            pull_declaration("COUNTS", "counts.in"),
        )
        .build()?;
    container.start().await?;

    container
        .publisher()
        .publish_text("counts.in", "not-a-number")
        .await?;

    tokio::time::sleep(Duration::from_millis(20)).await;

    let stats = container.subscription("counter").expect("active").stats;
    assert!(stats.decode_failures > 1, "{stats:?}");
    assert!(memory.journal().len() <= MemoryBroker::JOURNAL_CAPACITY);
    assert_eq!(count_ops(&memory, |op| matches!(op, BrokerOp::Term { .. })), 0);

    let stopped = container.shutdown(DrainMode::NakPending).await?;
    assert_eq!(stopped[0].1.acked, 0);
    Ok(())
}

#[tokio::test]
async fn provisioning_precedes_first_fetch() -> mom_listener::Result<()> {
    // ---
    init_logging();
    let (memory, broker) = memory_broker();

    let declaration = ListenerDeclaration::builder()
        .stream("ORDERS")
        .filter_subject("orders.new")
        .durable_name("order-audit")
        .pull_interval(Duration::from_millis(10))
        .max_wait(Duration::from_millis(10))
        .build()?;

    let container = ListenerContainer::builder(broker)
        .register(
            "audit",
            listener_fn(|_order: Order| async { Ok::<(), HandlerError>(()) }),
            declaration,
        )
        .build()?;
    container.start().await?;

    eventually("first fetch", || {
        count_ops(&memory, |op| matches!(op, BrokerOp::Fetch { .. })) > 0
    })
    .await;
    container.shutdown(DrainMode::Complete).await?;

    let journal = memory.journal();
    assert_eq!(
        journal[..4],
        [
            BrokerOp::StreamInfo {
                stream: "ORDERS".into()
            },
            BrokerOp::CreateStream {
                stream: "ORDERS".into(),
                subjects: vec!["orders.new".into()],
            },
            BrokerOp::CreateOrUpdateConsumer {
                stream: "ORDERS".into(),
                durable: "order-audit".into(),
            },
            BrokerOp::SubscribePull {
                stream: "ORDERS".into(),
                consumer: "order-audit".into(),
            },
        ]
    );
    assert!(matches!(
        journal[4],
        BrokerOp::Fetch {
            batch_size: 10,
            ..
        }
    ));

    // pull consumers carry no push delivery fields
    let consumer = memory
        .consumer_config("ORDERS", "order-audit")
        .expect("consumer exists");
    assert_eq!(consumer.deliver_subject, None);
    assert_eq!(consumer.deliver_group, None);
    Ok(())
}

#[tokio::test]
async fn push_group_delivers_each_message_once() -> mom_listener::Result<()> {
    // ---
    init_logging();
    let (memory, broker) = memory_broker();

    let seen = Arc::new(Mutex::new(Vec::new()));

    let push = || {
        ListenerDeclaration::builder()
            .stream("JOBS")
            .filter_subject("jobs.run")
            .durable_name("job-workers")
            .deliver_subject("deliver.jobs")
            .deliver_group("job-workers")
            .build()
    };
    let worker = |seen: Arc<Mutex<Vec<u32>>>| {
        listener_fn(move |job: Order| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(job.id);
                Ok::<(), HandlerError>(())
            }
        })
    };

    let container = ListenerContainer::builder(broker)
        .register("worker-a", worker(seen.clone()), push()?)
        .register("worker-b", worker(seen.clone()), push()?)
        .build()?;

    let report = container.start().await?;
    assert_eq!(report.started, ["worker-a", "worker-b"]);
    assert!(container
        .subscriptions()
        .iter()
        .all(|info| info.mode().is_push()));

    let publisher = container.publisher();
    for id in 0..10 {
        publisher.publish("jobs.run", &order(id)).await?;
    }

    eventually("all jobs", || seen.lock().unwrap().len() == 10).await;
    eventually("all acks", || {
        count_ops(&memory, |op| matches!(op, BrokerOp::Ack { .. })) == 10
    })
    .await;

    let unique: BTreeSet<u32> = seen.lock().unwrap().iter().copied().collect();
    assert_eq!(unique, (0..10).collect());
    assert_eq!(memory.pending("JOBS", "job-workers"), 0);

    let stats = container.shutdown(DrainMode::Complete).await?;
    let acked: u64 = stats.iter().map(|(_, s)| s.acked).sum();
    assert_eq!(acked, 10);
    Ok(())
}

#[tokio::test]
async fn override_switches_listener_settings() -> mom_listener::Result<()> {
    // ---
    init_logging();
    let (memory, broker) = memory_broker();

    let mut ov = SubjectOverride::for_subject("audit.log");
    ov.max_deliver = Some(5);
    ov.pull_batch_size = Some(3);

    let container = ListenerContainer::builder(broker)
        .overrides(SubjectOverrides::from_entries([ov]))
        .register(
            "audit-log",
            text_listener_fn(|_text: String| async { Ok::<(), HandlerError>(()) }),
            pull_declaration("AUDIT", "audit.log"),
        )
        .build()?;
    container.start().await?;

    let info = container.subscription("audit-log").expect("active");
    assert_eq!(info.config.max_deliver, 5);
    assert_eq!(info.consumer.config.max_deliver, 5);

    eventually("fetch", || {
        count_ops(&memory, |op| {
            matches!(op, BrokerOp::Fetch { batch_size: 3, .. })
        }) > 0
    })
    .await;

    container.shutdown(DrainMode::Complete).await?;
    Ok(())
}

#[tokio::test]
async fn duplicate_listener_name_is_rejected() {
    // ---
    let (_memory, broker) = memory_broker();
    let noop = || text_listener_fn(|_text: String| async { Ok::<(), HandlerError>(()) });

    let result = ListenerContainer::builder(broker)
        .register("audit", noop(), pull_declaration("A", "a.x"))
        .register("audit", noop(), pull_declaration("B", "b.x"))
        .build();

    assert!(matches!(result, Err(ListenerError::DuplicateListener(name)) if name == "audit"));
}

struct MistypedText;

#[mom_listener::async_trait]
impl Listener for MistypedText {
    type Message = Order;
    const PAYLOAD: PayloadType = PayloadType::Text;

    async fn on_message(&self, _order: Order) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[tokio::test]
async fn capability_failure_is_isolated() -> mom_listener::Result<()> {
    // ---
    init_logging();
    let (memory, broker) = memory_broker();

    let container = ListenerContainer::builder(broker)
        .register("mistyped", MistypedText, pull_declaration("BAD", "bad.in"))
        .register(
            "healthy",
            text_listener_fn(|_text: String| async { Ok::<(), HandlerError>(()) }),
            pull_declaration("GOOD", "good.in"),
        )
        .build()?;

    let report = container.start().await?;
    assert!(!report.is_healthy());
    assert_eq!(report.started, ["healthy"]);
    assert!(matches!(
        report.failure("mistyped"),
        Some(ListenerError::Capability { listener, .. }) if listener == "mistyped"
    ));

    // the rejected listener never touched the broker
    assert_eq!(memory.stream_names(), ["GOOD"]);
    assert!(container.subscription("mistyped").is_none());

    container.shutdown(DrainMode::Complete).await?;
    Ok(())
}

#[tokio::test]
async fn lifecycle_is_one_shot() -> mom_listener::Result<()> {
    // ---
    init_logging();
    let (_memory, broker) = memory_broker();

    let container = ListenerContainer::builder(broker)
        .register(
            "audit",
            text_listener_fn(|_text: String| async { Ok::<(), HandlerError>(()) }),
            pull_declaration("ORDERS", "orders.new"),
        )
        .build()?;

    container.start().await?;
    assert!(matches!(
        container.start().await,
        Err(ListenerError::AlreadyStarted)
    ));
    assert_eq!(container.subscriptions().len(), 1);

    let stopped = container.shutdown(DrainMode::Complete).await?;
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].0, "audit");

    assert!(container.subscriptions().is_empty());
    assert!(container.shutdown(DrainMode::Complete).await?.is_empty());
    assert!(matches!(container.start().await, Err(ListenerError::ShutDown)));
    Ok(())
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
