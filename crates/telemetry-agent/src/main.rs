// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_delivery::{
    config::AgentConfig,
    delivery_queue::DeliveryQueue,
    listener::{ListenerConfig, PutListener},
    stats::AttemptRecord,
    transport::BoundedTransport,
};
use tokio_util::sync::CancellationToken;

const AGENT_HOST: &str = "0.0.0.0";
const SHUTDOWN_FLUSH_BUDGET: Duration = Duration::from_secs(10);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("TELEMETRY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
        return;
    }

    debug!("Logging subsystem enabled");

    let config = match AgentConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on telemetry agent startup: {e}");
            return;
        }
    };
    let queue_config = match config.queue_config() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating delivery queue config: {e}");
            return;
        }
    };

    info!("Delivering points to {}", queue_config.url);
    let mut transport_options = config.transport_options();
    transport_options.observer = Some(Arc::new(|attempt: &AttemptRecord| {
        debug!(
            method = %attempt.method,
            status = ?attempt.status,
            retry = attempt.retry,
            retry_pending = attempt.retry_pending,
            "{} took {:?}{}",
            attempt.url,
            attempt.total_time(),
            attempt
                .error
                .as_deref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default()
        );
    }));
    let transport = Arc::new(BoundedTransport::new(transport_options));
    let queue = Arc::new(DeliveryQueue::new(queue_config, Arc::clone(&transport)));
    let cancel_token = CancellationToken::new();

    let listener_task = if config.listen_port > 0 {
        let listener_config = ListenerConfig {
            host: AGENT_HOST.to_string(),
            port: config.listen_port,
        };
        match PutListener::new(&listener_config, Arc::clone(&queue), cancel_token.clone()).await {
            Ok(listener) => {
                info!("put-udp: starting to listen on port {}", config.listen_port);
                Some(tokio::spawn(listener.spin()))
            }
            Err(e) => {
                error!("Unable to bind put listener on port {}: {e}", config.listen_port);
                return;
            }
        }
    } else {
        info!("put listener disabled");
        None
    };

    let delivery_task = {
        let queue = Arc::clone(&queue);
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move { queue.run(cancel_token).await })
    };

    let self_metrics_task = config.self_metrics_interval.map(|period| {
        let queue = Arc::clone(&queue);
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // discard first tick, which is instantaneous
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    _ = ticker.tick() => queue.record_self_metrics(),
                }
            }
        })
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {e}");
    }
    info!("Shutting down telemetry agent");
    cancel_token.cancel();

    for task in [listener_task, Some(delivery_task), self_metrics_task]
        .into_iter()
        .flatten()
    {
        if let Err(e) = task.await {
            warn!("Task ended abnormally during shutdown: {e}");
        }
    }

    if queue.flush(SHUTDOWN_FLUSH_BUDGET).await {
        debug!("Delivery queue flushed");
    } else {
        warn!("Shutting down with {} points still queued", queue.len());
    }
    transport.shutdown().await;

    let stats = queue.stats();
    info!(
        sent = stats.sent,
        dropped_stale = stats.dropped_stale,
        dropped_invalid = stats.dropped_invalid,
        dropped_overflow = stats.dropped_overflow,
        dropped_encoding = stats.dropped_encoding,
        failed_batches = stats.failed_batches,
        "Telemetry agent stopped"
    );
}
