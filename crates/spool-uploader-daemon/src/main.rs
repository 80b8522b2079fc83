// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use spool_uploader::{
    config::Config,
    directory_processor::SpoolDirectoryProcessor,
    http_utils::build_client,
    readiness::{AlwaysReady, HttpReadinessProbe, ReadinessProbe},
    scheduler::{AdaptiveScheduler, WorkerPoolState},
    uploader::AzureBlobUploader,
};

const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("SPOOL_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading config: {e}. Shutting down spool uploader.");
            return;
        }
    };

    let uploader = match AzureBlobUploader::from_config(&config) {
        Ok(uploader) => Arc::new(uploader),
        Err(e) => {
            error!("{e}. Shutting down spool uploader.");
            return;
        }
    };
    let processor = Arc::new(SpoolDirectoryProcessor::from_config(uploader, &config));

    let probe: Arc<dyn ReadinessProbe + Send + Sync> = match &config.readiness_url {
        Some(url) => match build_client(None, READINESS_TIMEOUT) {
            Ok(client) => Arc::new(HttpReadinessProbe::new(client, url.clone())),
            Err(e) => {
                error!("{e}. Shutting down spool uploader.");
                return;
            }
        },
        None => Arc::new(AlwaysReady),
    };

    let state = WorkerPoolState::from_config(&config);
    let scheduler = Arc::new(AdaptiveScheduler::new(&config, processor, probe));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received, finishing in-flight sweeps");
        shutdown.cancel();
    });

    info!(
        "Spool uploader started on {} with {} to {} workers",
        config.disk_path.display(),
        config.workers_min_count,
        config.workers_max_count
    );
    scheduler.run(state, cancel).await;
    info!("Spool uploader stopped");
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => error!("Failed to listen for SIGTERM: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
