//! Command line interface for the `courier` binary

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use courier_common::Message;
use courier_dispatch::DispatchService;
use courier_metrics::{LogAlertSink, Metrics};

use crate::{
    config::{CourierConfig, find_config_file},
    controller::Controller,
};

/// Resilient multi-provider transactional mail dispatcher
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Send transactional mail through a pool of providers", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to the configuration file (overrides `COURIER_CONFIG`)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the dispatcher and its background tasks until interrupted
    Run,
    /// Print the provider status report as JSON
    Status {
        /// Include each provider's rate limiter counters
        #[arg(long)]
        limits: bool,
    },
    /// Send one message and print the result as JSON
    Send {
        /// Envelope sender
        #[arg(long)]
        from: String,

        /// Recipient, repeat for more than one
        #[arg(long, required = true)]
        to: Vec<String>,

        #[arg(long)]
        subject: String,

        /// Plain text body
        #[arg(long, default_value = "")]
        text: String,

        /// HTML alternative body
        #[arg(long)]
        html: Option<String>,

        /// Extra header as `Name: value`, repeat for more than one
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
    /// Validate the configuration and summarise it
    Check,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("header {raw:?} must be written as Name: value"))?;

    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header {raw:?} has an empty name"));
    }

    Ok((name.to_string(), value.trim().to_string()))
}

fn load(cli: &Cli) -> anyhow::Result<CourierConfig> {
    let path = find_config_file(cli.config.as_deref())?;
    CourierConfig::load(&path).with_context(|| format!("Invalid configuration in {}", path.display()))
}

fn service(config: &CourierConfig) -> anyhow::Result<DispatchService> {
    let metrics = Arc::new(Metrics::new(config.metrics.clone(), Arc::new(LogAlertSink))?);
    Ok(DispatchService::from_config(&config.dispatch, metrics)?)
}

/// Human readable summary printed by `courier check`
#[must_use]
pub fn summary(config: &CourierConfig) -> String {
    let mut lines = vec![format!(
        "{} provider(s), rate limit store: {}",
        config.dispatch.providers.len(),
        config.dispatch.rate_limit_store.backend()
    )];

    for provider in &config.dispatch.providers {
        lines.push(format!(
            "  - {} ({:?}) tier {} weight {}{}",
            provider.name,
            provider.transport.kind(),
            provider.priority_tier,
            provider.weight,
            if provider.enabled { "" } else { " [disabled]" }
        ));
    }

    lines.join("\n")
}

/// Run the parsed command
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the dispatcher
/// cannot be built.
pub async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load(&cli)?;

    match cli.command {
        Commands::Run => {
            Controller::new(&config)?.run().await?;
        }
        Commands::Status { limits } => {
            let service = service(&config)?;
            let mut output = serde_json::to_value(service.provider_status())?;

            if limits {
                let mut stats = Vec::with_capacity(service.registry().len());
                for provider in service.registry().all() {
                    stats.push(service.rate_limit_stats(provider.name()).await?);
                }
                output["rate_limits"] = serde_json::to_value(stats)?;
            }

            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Send {
            from,
            to,
            subject,
            text,
            html,
            headers,
        } => {
            let service = service(&config)?;

            let mut message = Message::new(from, to, subject, text);
            if let Some(html) = html {
                message = message.with_html(html);
            }
            for (name, value) in headers {
                message = message.with_header(name, value);
            }

            let result = service.send(&message).await;
            println!("{}", serde_json::to_string_pretty(&result)?);

            if !result.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Check => {
            println!("{}", summary(&config));
        }
    }

    Ok(ExitCode::SUCCESS)
}
