// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Extractor Worker - Message-Driven Job Dispatch
//!
//! Runs an external extractor command for every job:
//! - Broker mode: consumes the work queue, reports status, resubmits or
//!   escalates failures, broadcasts heartbeats
//! - Batch mode: reads job descriptors from files and writes a status log

use std::sync::Arc;
use tracing::{info, warn};

use extractor_repository::HttpRepository;
use extractor_worker::batch::BatchRunner;
use extractor_worker::broker::AmqpConnector;
use extractor_worker::command::CommandProcessor;
use extractor_worker::config::{Config, ConfigError, RunMode};
use extractor_worker::gateway::{BrokerGateway, GatewayConfig};
use extractor_worker::handler::HandlerContext;
use extractor_worker::heartbeat::HeartbeatConfig;
use extractor_worker::notify::{EmailConfig, LogNotifier, Notifier, SmtpNotifier};
use extractor_worker::resolver::ResourceResolver;
use extractor_worker::{Extractor, ExtractorInfo, RetryPolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "extractor_worker=info,extractor_repository=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;
    let info = ExtractorInfo::load(&config.extractor_info)?;

    let processor = CommandProcessor::new(config.command.clone())
        .ok_or(ConfigError::MissingEnvVar("EXTRACTOR_COMMAND"))?;

    info!(
        extractor = %info.name,
        version = %info.version,
        command = %processor.command_line(),
        mode = ?config.mode,
        mounts = config.mounts.len(),
        "Starting Extractor Worker"
    );

    let extractor = Extractor::new(info.clone(), move |resource, descriptor| {
        processor.run(resource, descriptor)
    })
    .with_default_kind(config.default_kind);

    // Repository collaborators
    let repository = Arc::new(HttpRepository::default());
    let resolver = ResourceResolver::new(
        repository.clone(),
        Arc::new(config.mounts.clone()),
        &config.staging_dir,
    );

    let notifier: Arc<dyn Notifier> = match EmailConfig::from_env() {
        Some(email) => {
            info!(smtp_host = %email.smtp_host, "Email notifications enabled");
            Arc::new(SmtpNotifier::new(email))
        }
        None => Arc::new(LogNotifier),
    };

    let context = Arc::new(HandlerContext {
        extractor,
        resolver,
        repository,
        notifier,
        retry: RetryPolicy::new(config.max_retry),
        host_override: config.host_override.clone(),
    });

    if config.mode == RunMode::Batch {
        let summary = BatchRunner::new(context, &config.batch_log)
            .run(&config.batch_inputs)
            .await?;
        info!(
            jobs = summary.jobs,
            failed = summary.failed,
            log = %config.batch_log.display(),
            "Extractor Worker batch complete"
        );
        return Ok(());
    }

    let queue = config.queue.clone().unwrap_or_else(|| info.name.clone());
    let mut gateway_config = GatewayConfig::new(queue);
    gateway_config.exchange = config.exchange.clone();
    gateway_config.routing_keys = info.routing_keys();
    gateway_config.poll_interval = config.poll_interval;
    gateway_config.heartbeat = HeartbeatConfig {
        exchange: config.heartbeat_exchange.clone(),
        interval: config.heartbeat_interval,
    };

    let connector = Arc::new(AmqpConnector::new(&config.broker_uri));
    let mut gateway = BrokerGateway::new(connector, context, gateway_config);
    gateway.connect().await?;

    info!(
        queue = %gateway.config().queue,
        instance_id = %gateway.instance_id(),
        "Extractor Worker ready"
    );

    // Wait for shutdown signal
    let shutdown = gateway.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown signal received");
        shutdown.notify_one();
    });

    gateway.listen().await?;

    info!("Extractor Worker shut down");

    Ok(())
}
