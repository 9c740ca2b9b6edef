// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use sigportal::{
    cli::{Cli, Command},
    clock::SystemClock,
    config::{Config, load_config},
    dispatch::Agent,
    http::HyperTransport,
    platform::{LocalPlatform, LogDialogs},
    queue::{self, MessageQueue},
    trust::TrustStore,
};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt};

// The path, relative to $CONFIGURATION_DIRECTORY, of the default config file location.
const DEFAULT_CONFIG: &str = "sigportal/agent.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does not
    // implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "SIGPORTAL_AGENT_LOG contains an invalid log directive; refer to \
            https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
            filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let mut config = load_config::<Config>(opts.config, PathBuf::from(DEFAULT_CONFIG).as_path())?;

    match opts.command {
        Command::Run {
            credentials_directory,
        } => {
            if let Some(credentials_directory) = credentials_directory {
                config.with_credentials_dir(&credentials_directory)?;
            }

            let root_span = tracing::info_span!("agent");
            async move {
                let trust = Arc::new(TrustStore::load(
                    config.bundled_anchors.as_deref(),
                    &config.system_anchors,
                    &config.state_directory,
                )?);
                tracing::info!(
                    anchors = trust.anchor_count(),
                    learned_chains = trust.learned_chains().len(),
                    "Loaded trust store"
                );
                let transport = Arc::new(HyperTransport::new(
                    trust.clone(),
                    config.request_timeout(),
                ));
                let platform =
                    LocalPlatform::new(config.local_options(), trust, LogDialogs, SystemClock)?;
                let mut queue = MessageQueue::bind(&config.socket_path)?;

                let halt_token = CancellationToken::new();
                tokio::spawn(signal_handler(halt_token.clone()));
                Agent::new(transport, SystemClock, platform, config.client_id)
                    .run(&mut queue, halt_token)
                    .await;
                Ok::<_, anyhow::Error>(())
            }
            .instrument(root_span)
            .await?;
        }
        Command::Open { message } => {
            queue::send_message(&config.socket_path, &message).await?;
        }
        Command::Config {
            credentials_directory,
        } => {
            println!(
                "# This is the current configuration\n\n{config}\n# This concludes the configuration.\n"
            );
            if let Some(credentials_directory) = credentials_directory {
                _ = config.with_credentials_dir(&credentials_directory).inspect_err(|error|{
                    eprintln!("The configuration format is valid, but the referenced credentials aren't valid: {error:?}");
                });
            }
        }
    }

    Ok(())
}

/// Install and manage signal handlers for the process.
///
/// # SIGTERM and SIGINT
///
/// Sending SIGTERM or SIGINT to the process will cause it to stop accepting new
/// magic links. An exchange in progress is allowed to complete before the process
/// shuts down.
async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    loop {
        tokio::select! {
            _ = sigterm_stream.recv() => {
                tracing::info!("SIGTERM received, beginning agent shutdown");
                halt_token.cancel();
            }
            _ = sigint_stream.recv() => {
                tracing::info!("SIGINT received, beginning agent shutdown");
                halt_token.cancel();
            }
        }
    }
}
