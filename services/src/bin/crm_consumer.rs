//! CRM consumer: mirrors user events into the CRM sync log.

use event_relay_services::lifecycle::init_tracing;
use event_relay_services::{Config, ConsumerService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let service = ConsumerService::Crm;
    init_tracing(&service.default_log_filter());

    tracing::info!("Starting CRM consumer");
    service.run(Config::from_env(service.name())).await
}
