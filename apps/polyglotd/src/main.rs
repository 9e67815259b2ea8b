mod calc;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use polyglot_connection::{JsonLinesReceiver, JsonLinesSender, KernelConnector, KernelHost, KernelHostOptions};
use polyglot_kernel::{CompositeKernel, KernelExt, LanguageKernel};
use polyglot_protocol::{KernelCommand, KernelCommandAndEventReceiver, KernelUri};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::calc::Calculator;

#[derive(Debug, Parser)]
#[command(name = "polyglotd")]
#[command(about = "Polyglot kernel daemon")]
struct Cli {
    /// Root URI of this host's composite kernel.
    #[arg(long, global = true, default_value = "kernel://local/")]
    host_uri: String,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
    /// Overrides `RUST_LOG`.
    #[arg(long, global = true)]
    log_filter: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit code to a local composite and log every event.
    Run {
        #[arg(long, default_value = "1+1")]
        code: String,
        /// Kernel to target instead of the default.
        #[arg(long)]
        kernel: Option<String>,
    },
    /// Host the composite over stdin/stdout, one JSON envelope per line.
    Serve,
}

fn init_tracing(format: LogFormat, filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(directives) => EnvFilter::try_new(directives).context("invalid --log-filter")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // stdout carries envelopes in serve mode.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn build_composite(host_uri: &KernelUri) -> Result<Arc<CompositeKernel>> {
    let composite = CompositeKernel::builder("polyglot")
        .with_aliases(LanguageKernel::new("calc", Calculator), ["calculator", "arith"])
        .default_kernel("calc")
        .host_uri(host_uri.clone())
        .build()
        .context("building composite kernel")?;
    Ok(composite)
}

async fn run(host_uri: &KernelUri, code: String, kernel: Option<String>) -> Result<()> {
    let composite = build_composite(host_uri)?;
    let mut command = KernelCommand::submit_code(code);
    if let Some(kernel) = kernel {
        command = command.with_target_kernel_name(kernel);
    }
    let result = composite.send(command).await;
    for event in result.events() {
        let rendered = event
            .to_envelope()
            .ok()
            .and_then(|envelope| serde_json::to_string(&envelope.event).ok())
            .unwrap_or_else(|| "{}".to_owned());
        info!(
            event_type = event.event_type(),
            token = ?event.token().map(ToString::to_string),
            slip = ?event.routing_slip().entries(),
            payload = %rendered,
            "event"
        );
    }
    match result.failure_message() {
        Some(message) => Err(anyhow!("command failed: {message}")),
        None => Ok(()),
    }
}

async fn serve(host_uri: &KernelUri) -> Result<()> {
    let composite = build_composite(host_uri)?;
    let receiver = Arc::new(JsonLinesReceiver::spawn(tokio::io::stdin()));
    let sender = Arc::new(JsonLinesSender::new(tokio::io::stdout()));

    let host = KernelHost::with_options(
        composite,
        KernelConnector::new(sender, receiver.clone()),
        KernelHostOptions {
            host_uri: host_uri.clone(),
            ..Default::default()
        },
    );
    let kernels = host.connect().await.context("announcing kernels")?;
    info!(host = %host.uri(), kernels = kernels.len(), "serving over stdio");

    let mut input = receiver.subscribe();

    tokio::select! {
        _ = async { while input.next().await.is_some() {} } => info!("stdin closed"),
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(%err, "ctrl-c handler failed");
            }
            info!("interrupted");
        }
    }
    host.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.log_filter.as_deref())?;

    let host_uri = KernelUri::parse(&cli.host_uri)
        .with_context(|| format!("invalid --host-uri {}", cli.host_uri))?;

    match cli.command {
        Command::Run { code, kernel } => run(&host_uri, code, kernel).await,
        Command::Serve => serve(&host_uri).await,
    }
}
