//! Publish a single user event, for poking at a running deployment.
//!
//! ```text
//! emit-event <user.created|user.updated|user.deleted> <user-id> [email] [name] [correlation-id]
//! ```

use anyhow::{Context, bail};
use event_relay_core::environment::SystemClock;
use event_relay_core::event::{EventType, User};
use event_relay_core::topology::DEFAULT_EXCHANGE;
use event_relay_rabbitmq::RabbitConnection;
use event_relay_services::lifecycle::init_tracing;
use event_relay_services::{Config, EventProducer};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info,emit_event=info");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (Some(event_type), Some(user_id)) = (args.first(), args.get(1)) else {
        bail!("usage: emit-event <event-type> <user-id> [email] [name] [correlation-id]");
    };
    let event_type: EventType = event_type.parse()?;
    let email = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| format!("{user_id}@example.com"));
    let name = args.get(3).cloned().unwrap_or_else(|| user_id.clone());
    let correlation_id = args.get(4).cloned();

    let config = Config::from_env("producer");
    let connection =
        RabbitConnection::connect_with_retry(&config.rabbitmq_url, &config.retry_policy())
            .await
            .context("Failed to connect to RabbitMQ")?;
    let publisher = connection
        .publisher(DEFAULT_EXCHANGE, config.publish_timeout)
        .await
        .context("Failed to open publisher")?;

    let producer = EventProducer::new(Arc::new(publisher), Arc::new(SystemClock));
    let event = producer
        .try_emit(event_type, User::new(user_id.as_str(), email, name), correlation_id)
        .await?;

    println!("{}", event.event_id);
    connection.close().await?;
    Ok(())
}
