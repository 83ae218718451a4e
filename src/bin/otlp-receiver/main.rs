// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use otlp_receiver::init::config::Arguments;
use otlp_receiver::init::wait;
use otlp_receiver::receivers::otlp::receiver::OTLPReceiver;
use otlp_receiver::topology::consumer::ConsumerSet;
use otlp_receiver::topology::debug::{DebugLogConsumer, DebugVerbosity};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run the receiver
    Start(StartArgs),

    /// Return version
    Version,
}

#[derive(Debug, clap::Args)]
struct StartArgs {
    /// TOML configuration file, overlaid with OTLP_RECEIVER_ environment variables
    #[arg(long, env = "OTLP_RECEIVER_CONFIG")]
    config: Option<PathBuf>,

    /// Log each received batch
    #[arg(value_enum, long, env = "OTLP_RECEIVER_DEBUG_LOG", default_value = "basic")]
    debug_log: DebugLogArg,
}

#[derive(Debug, Parser)]
#[command(name = "otlp-receiver")]
#[command(bin_name = "otlp-receiver")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Cli {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "OTLP_RECEIVER_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
pub enum DebugLogArg {
    None,
    Basic,
    Detailed,
}

fn main() -> ExitCode {
    let opt = Cli::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version())
        }
        Some(Commands::Start(start)) => {
            let _guard = match setup_logging(&opt.log_format) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            if let Err(e) = run_receiver(start) {
                error!(error = %e, "Failed to run receiver.");
                return ExitCode::from(1);
            }
        }
        None => {
            // it shouldn't be possible to get here since we mark a subcommand as
            // required
            error!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_receiver(start: StartArgs) -> Result<(), BoxError> {
    let args = load_arguments(&start)?;
    let receiver = Arc::new(OTLPReceiver::new());
    let cancel_token = CancellationToken::new();

    let mut receiver_join_set = wait::TaskSet::new();
    {
        let receiver = receiver.clone();
        let token = cancel_token.clone();
        receiver_join_set
            .spawn(async move { receiver.run(&args, token).await.map_err(|e| e.into()) });
    }

    let mut sig_hup = signal(SignalKind::hangup())?;
    loop {
        select! {
            res = signal_wait() => {
                res?;
                info!("Shutdown signal received.");
                cancel_token.cancel();
                break;
            },
            _ = sig_hup.recv() => {
                info!("Signal SIGHUP received, reloading configuration.");
                reload(&receiver, &start).await;
            },
            e = wait::wait_for_any_task(&mut receiver_join_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of receiver."),
                    Err(e) => return Err(e),
                }
                break;
            },
        }
    }

    // The receiver bounds its own shutdown, this only guards against a hang.
    wait::wait_for_tasks_with_timeout(&mut receiver_join_set, Duration::from_secs(10)).await
}

async fn reload(receiver: &OTLPReceiver, start: &StartArgs) {
    let args = match load_arguments(start) {
        Ok(args) => args,
        Err(e) => {
            error!(error = %e, "Unable to reload configuration, keeping current receiver.");
            return;
        }
    };

    match receiver.update(&args).await {
        Ok(bound) => info!(http = ?bound.http, grpc = ?bound.grpc, "Receiver reconfigured."),
        Err(e) => error!(error = %e, "Failed to reconfigure receiver."),
    }
}

fn load_arguments(start: &StartArgs) -> Result<Arguments, BoxError> {
    let args = Arguments::load(start.config.as_deref())?;

    let mut output = ConsumerSet::default();
    let verbosity = match start.debug_log {
        DebugLogArg::None => None,
        DebugLogArg::Basic => Some(DebugVerbosity::Basic),
        DebugLogArg::Detailed => Some(DebugVerbosity::Detailed),
    };
    if let Some(verbosity) = verbosity {
        let consumer = Arc::new(DebugLogConsumer::new(verbosity));
        output = output
            .with_traces(consumer.clone())
            .with_metrics(consumer.clone())
            .with_logs(consumer);
    }

    Ok(args.with_output(output))
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?
        .add_directive("opentelemetry=warn".parse()?)
        .add_directive("h2=warn".parse()?);

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io;
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = io::stdout().is_terminal();

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

async fn signal_wait() -> std::io::Result<()> {
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_int = signal(SignalKind::interrupt())?;

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
    Ok(())
}
