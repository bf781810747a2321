// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use telemetry_collector::{config::Config, logger::Formatter, server};

const FALLBACK_LOG_LEVEL: &str = "info";

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = Config::from_env();
    let log_level = config
        .as_ref()
        .map_or(FALLBACK_LOG_LEVEL, |config| config.log_level.as_str());
    let env_filter = format!("h2=off,hyper=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .event_format(Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    debug!("Starting with {config:?}");

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
        }
    });

    match server::run(config, shutdown_token).await {
        Ok(()) => {
            info!("Telemetry collector stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
