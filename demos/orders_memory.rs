use std::time::Duration;

use mom_listener::{
    create_memory_broker, listener_fn, text_listener_fn, DrainMode, HandlerError,
    ListenerContainer, ListenerDeclaration, Result, SubjectOverride, SubjectOverrides,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct OrderCreated {
    id: u64,
    amount_cents: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let broker = create_memory_broker().await?;

    let overrides = SubjectOverrides::from_json_str(
        r#"{"overrides": [{"subject": "orders.new", "pullBatchSize": 5, "pullInterval": 200}]}"#,
    )?;

    let billing = ListenerDeclaration::builder()
        .stream("ORDERS")
        .filter_subject("orders.new")
        .durable_name("billing")
        .max_deliver(3)
        .build()?;

    let audit = ListenerDeclaration::builder()
        .stream("AUDIT")
        .filter_subject("audit.>")
        .deliver_subject("deliver.audit")
        .deliver_group("auditors")
        .build()?;

    let container = ListenerContainer::builder(broker.clone())
        .overrides(overrides)
        .register(
            "billing",
            listener_fn(|order: OrderCreated| async move {
                if order.amount_cents == 0 {
                    return Err::<(), HandlerError>("empty order".into());
                }
                println!("billing order {} for {} cents", order.id, order.amount_cents);
                Ok(())
            }),
            billing,
        )
        .register(
            "audit",
            text_listener_fn(|line: String| async move {
                println!("audit: {line}");
                Ok::<(), HandlerError>(())
            }),
            audit,
        )
        .build()?;

    let report = container.start().await?;
    println!("started: {:?}", report.started);

    let publisher = container.publisher();
    for id in 1..=3 {
        publisher
            .publish("orders.new", &OrderCreated {
                id,
                amount_cents: id * 1250,
            })
            .await?;
    }
    publisher.publish_text("audit.login", "user 42 logged in").await?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    for info in container.subscriptions() {
        println!("{} ({}): {:?}", info.name, info.mode().label(), info.stats);
    }

    container.shutdown(DrainMode::Complete).await?;
    broker.close().await?;
    Ok(())
}
