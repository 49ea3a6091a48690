//! Logmailer - mail the recent log history whenever a severe event is logged.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use logmailer::cli::{Cli, LogFormat};
use logmailer::config::Config;
use logmailer::metrics::initialize_metrics;
use logmailer::{
    AppendError, LineAssembler, LineParser, LogEvent, MailAppender, MetricsServer,
    record_parse_error,
};

/// Idle time after which a buffered multi-line record is considered complete.
const IDLE_FLUSH: Duration = Duration::from_millis(500);

/// Initialize the tracing subscriber with the specified log format.
fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    match format {
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .flatten_event(true)
                .with_env_filter(filter)
                .init();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    info!(config_path = %cli.config.display(), "Loading configuration");

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let config_dir = cli
        .config
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    info!("Validating configuration");
    let compiled = match config.validate(&config_dir) {
        Ok(compiled) => compiled,
        Err(errors) => {
            for e in &errors {
                error!(error = %e, "Configuration validation error");
            }
            error!(error_count = errors.len(), "Configuration validation failed");
            std::process::exit(1);
        }
    };

    if cli.validate {
        let appender = &compiled;
        println!("Configuration is valid: {}", cli.config.display());
        println!(
            "  SMTP: {}:{} ({:?})",
            appender.smtp.host, appender.smtp.port, appender.smtp.tls
        );
        println!(
            "  Recipients: {} to, {} cc, {} bcc",
            appender.to.len(),
            appender.cc.len(),
            appender.bcc.len()
        );
        println!(
            "  Buffer: {} events, {} mode",
            appender.buffer_size,
            if appender.asynchronous { "asynchronous" } else { "synchronous" }
        );
        println!(
            "  Metrics: {} (port {})",
            if config.metrics.enabled { "enabled" } else { "disabled" },
            config.metrics.port
        );
        return Ok(());
    }

    info!(config_path = %cli.config.display(), "logmailer starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config, config_dir, cli.input))
}

async fn run(config: Config, config_dir: PathBuf, input: Option<PathBuf>) -> Result<()> {
    let cancel = CancellationToken::new();

    let metrics_handle = if config.metrics.enabled {
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let server = MetricsServer::with_ready_signal(config.metrics.port, ready_tx);
        let cancel_metrics = cancel.clone();
        info!(port = config.metrics.port, "Starting metrics server");
        let handle = tokio::spawn(async move {
            if let Err(e) = server.run(cancel_metrics).await {
                error!(error = %e, "Metrics server error");
            }
        });
        if ready_rx.await.is_ok() {
            initialize_metrics();
        }
        Some(handle)
    } else {
        info!("Metrics server disabled");
        None
    };

    let parser = LineParser::new(&config.input.pattern)?;
    let appender = Arc::new(
        MailAppender::from_config(&config.appender, &config_dir)
            .context("failed to start mail appender")?,
    );

    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c signal");
            return;
        }
        info!("Received shutdown signal, initiating graceful shutdown");
        cancel_signal.cancel();
    });

    let result = match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open input {}", path.display()))?;
            pump(BufReader::new(file), LineAssembler::new(parser), &appender, &cancel).await
        }
        None => {
            pump(
                BufReader::new(tokio::io::stdin()),
                LineAssembler::new(parser),
                &appender,
                &cancel,
            )
            .await
        }
    };

    // input exhausted: let the last triggered send finish before stopping
    if !cancel.is_cancelled()
        && let Some(handle) = appender.pending_send_handle()
    {
        let bound = appender.config().send_timeout.saturating_mul(2);
        if let Err(e) = handle.wait(bound).await {
            warn!(error = %e, "Last send still running at shutdown");
        }
    }

    let stopping = Arc::clone(&appender);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;

    cancel.cancel();
    if let Some(handle) = metrics_handle {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    match result {
        Ok(()) => {
            info!("logmailer shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Input error");
            Err(e)
        }
    }
}

/// Feed input lines to the appender until EOF or cancellation.
async fn pump<R>(
    reader: R,
    mut assembler: LineAssembler,
    appender: &Arc<MailAppender>,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(IDLE_FLUSH, lines.next_line()) => next,
        };

        match next {
            Err(_elapsed) => {
                if let Some(event) = assembler.flush() {
                    deliver(appender, event)?;
                }
            }
            Ok(Ok(Some(line))) => match assembler.feed(&line) {
                Ok(Some(event)) => deliver(appender, event)?,
                Ok(None) => {}
                Err(e) => record_parse_error(&e),
            },
            Ok(Ok(None)) => break,
            Ok(Err(e)) => return Err(e).context("failed to read input"),
        }
    }

    if let Some(event) = assembler.flush() {
        deliver(appender, event)?;
    }
    Ok(())
}

/// Push one event; synchronous-mode send failures are logged, not fatal.
fn deliver(appender: &Arc<MailAppender>, event: LogEvent) -> Result<()> {
    // on_event blocks in synchronous mode
    match tokio::task::block_in_place(|| appender.on_event(event)) {
        Ok(_) => Ok(()),
        Err(AppendError::Send(e)) => {
            warn!(error = %e, "Synchronous send failed");
            Ok(())
        }
        Err(e @ AppendError::Stopped) => Err(e.into()),
    }
}
