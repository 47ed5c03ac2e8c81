//! Analytics consumer: keeps per-day counts of user events.

use event_relay_services::lifecycle::init_tracing;
use event_relay_services::{Config, ConsumerService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let service = ConsumerService::Analytics;
    init_tracing(&service.default_log_filter());

    tracing::info!("Starting analytics consumer");
    service.run(Config::from_env(service.name())).await
}
