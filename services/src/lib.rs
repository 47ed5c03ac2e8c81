//! # Event Relay Services
//!
//! Deployable pieces built on the event relay crates:
//!
//! - [`service::ConsumerService`]: the CRM and analytics consumers, each with
//!   its own queue, dead-letter queue and tables
//! - [`producer::EventProducer`]: best-effort publishing for the user service
//! - [`config::Config`]: environment configuration shared by all binaries
//! - [`lifecycle`]: tracing setup and graceful shutdown
//!
//! ## Binaries
//!
//! | Binary               | Queue                   | Side effect                 |
//! |----------------------|-------------------------|-----------------------------|
//! | `crm-consumer`       | `crm.user.events`       | `crm_sync_log` row per event |
//! | `analytics-consumer` | `analytics.user.events` | `analytics_metrics` counter  |
//! | `emit-event`         | n/a                     | publishes one user event     |

pub mod config;
pub mod failure;
pub mod lifecycle;
pub mod producer;
pub mod service;

pub use config::Config;
pub use failure::RandomFailure;
pub use producer::EventProducer;
pub use service::ConsumerService;
