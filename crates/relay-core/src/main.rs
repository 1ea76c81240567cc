//! `relay` command-line entry point.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_common::{RawTelemetry, SampleValue, StreamKind};
use relay_config::{resolve_config, ConfigError, LogFormat, RelayConfig, ResolvedConfig};
use relay_core::http::{HttpError, HttpServer, IngestEndpoint};
use relay_core::logging::init_logging;
use relay_core::pipeline::ShutdownReport;
use relay_core::producer::{activity_period, default_sensors};
use relay_core::viewer::ViewerServer;
use relay_core::{
    connect_upstream, ExitCode, Pipeline, PipelineHandle, Producers, RelayMetrics, SampleQueue,
    StreamServer, StreamSource, TransportError,
};
use relay_telemetry::{count_rows, LoadError, ParquetLoader, WriterConfig};

#[derive(Parser, Debug)]
#[command(name = "relay", author, version, about = "Telemetry ingestion relay")]
struct Cli {
    /// Configuration file (overrides RELAY_CONFIG and the XDG config file)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run simulated producers and serve their sample queues
    ServeStreams,
    /// Run ingestion pipelines against the upstream stream server
    Ingest,
    /// Run both halves in one process
    Run,
    /// Validate and print the effective configuration
    CheckConfig,
    /// Show committed row counts per table
    StorageStats,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum LogFormatArg {
    Human,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Human => LogFormat::Human,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Storage(#[from] LoadError),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
}

impl AppError {
    fn exit_code(&self) -> ExitCode {
        match self {
            AppError::Config(_) => ExitCode::ConfigError,
            AppError::Transport(_) | AppError::Bind { .. } => ExitCode::TransportError,
            AppError::Http(HttpError::Bind { .. }) => ExitCode::TransportError,
            AppError::Storage(_) => ExitCode::StorageError,
            AppError::Io(_) => ExitCode::IoError,
            AppError::Http(_) | AppError::Metrics(_) | AppError::Render(_) => {
                ExitCode::InternalError
            }
        }
    }
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let resolved = match resolve_config(cli.config.as_deref()) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("relay: {}", e);
            return ExitCode::ConfigError.into();
        }
    };

    let format = cli
        .log_format
        .map(LogFormat::from)
        .unwrap_or(resolved.config.logging.format);
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| resolved.config.logging.level.clone());
    init_logging(format, &level);
    info!(source = %resolved.source, path = ?resolved.path, "Configuration resolved");

    let outcome = match cli.command {
        Command::CheckConfig => check_config(&resolved),
        Command::StorageStats => storage_stats(&resolved.config),
        command => run_async(command, resolved.config),
    };

    match outcome {
        Ok(()) => ExitCode::Clean.into(),
        Err(e) => {
            error!(error = %e, "relay failed");
            e.exit_code().into()
        }
    }
}

fn check_config(resolved: &ResolvedConfig) -> Result<(), AppError> {
    let rendered = toml::to_string_pretty(&resolved.config)?;
    match &resolved.path {
        Some(path) => println!("# source: {} ({})", resolved.source, path.display()),
        None => println!("# source: {}", resolved.source),
    }
    print!("{}", rendered);
    Ok(())
}

fn storage_stats(config: &RelayConfig) -> Result<(), AppError> {
    for kind in config.pipeline_kinds() {
        let table = kind.table_name();
        let rows = count_rows(&config.storage.dir, &table)?;
        println!("{:<20} {}", table, rows);
    }
    Ok(())
}

fn run_async(command: Command, config: RelayConfig) -> Result<(), AppError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("relay-worker")
        .build()?;
    runtime.block_on(async move {
        let metrics = Arc::new(RelayMetrics::new()?);
        let shutdown = CancellationToken::new();

        let streams = match command {
            Command::ServeStreams | Command::Run => {
                Some(StreamSide::start(&config, &metrics, &shutdown).await?)
            }
            _ => None,
        };
        let ingest = match command {
            Command::Ingest | Command::Run => {
                Some(IngestSide::start(&config, &metrics, &shutdown).await?)
            }
            _ => None,
        };

        wait_for_signal().await;
        info!("Shutdown requested");
        shutdown.cancel();

        if let Some(ingest) = ingest {
            ingest.stop().await;
        }
        if let Some(streams) = streams {
            streams.stop().await;
        }
        Ok(())
    })
}

async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for ctrl-c, shutting down");
    }
}

async fn bind(addr: &str) -> Result<TcpListener, AppError> {
    TcpListener::bind(addr).await.map_err(|e| AppError::Bind {
        addr: addr.to_string(),
        source: e,
    })
}

/// Producers plus the stream server.
struct StreamSide {
    producers: Producers,
    server: JoinHandle<std::io::Result<()>>,
}

impl StreamSide {
    async fn start(
        config: &RelayConfig,
        metrics: &RelayMetrics,
        shutdown: &CancellationToken,
    ) -> Result<Self, AppError> {
        let capacity = config.queue.capacity;
        let mut producers = Producers::new();
        let mut server = StreamServer::new(config.stream.clone());

        for kind in config.pipeline_kinds() {
            let evictions = metrics.eviction_counter(kind);
            if kind.is_metric() {
                let queue = Arc::new(
                    SampleQueue::<SampleValue>::new(kind, capacity).with_eviction_counter(evictions),
                );
                producers.spawn_activity(kind, activity_period(kind), Arc::clone(&queue))?;
                server.add_source(StreamSource::Metric(queue));
            } else {
                let queue = Arc::new(
                    SampleQueue::<RawTelemetry>::new(kind, capacity)
                        .with_eviction_counter(evictions),
                );
                for spec in default_sensors() {
                    producers.spawn_sensor(spec, Arc::clone(&queue))?;
                }
                server.add_source(StreamSource::Telemetry(queue));
            }
        }

        let listener = bind(&config.stream.bind).await?;
        let server = tokio::spawn(Arc::new(server).serve(listener, shutdown.clone()));
        info!(producers = producers.len(), "Stream side started");
        Ok(Self { producers, server })
    }

    async fn stop(self) {
        match self.server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Stream server failed"),
            Err(e) => warn!(error = %e, "Stream server task failed"),
        }
        let producers = self.producers;
        if let Err(e) = tokio::task::spawn_blocking(move || producers.stop_and_join()).await {
            warn!(error = %e, "Producer shutdown failed");
        }
    }
}

type UpstreamStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Pipelines plus the viewer channel and HTTP endpoint.
struct IngestSide {
    pipelines: Vec<PipelineHandle>,
    viewer: JoinHandle<std::io::Result<()>>,
    http: Option<HttpServer>,
}

impl IngestSide {
    async fn start(
        config: &RelayConfig,
        metrics: &Arc<RelayMetrics>,
        shutdown: &CancellationToken,
    ) -> Result<Self, AppError> {
        let writer = WriterConfig::new(&config.storage.dir);
        let mut viewer = ViewerServer::new(config.viewer.session_buffer);
        let mut endpoint = IngestEndpoint::new(Arc::clone(metrics));
        let mut pipelines = Vec::new();

        for kind in config.pipeline_kinds() {
            let loader = Box::new(ParquetLoader::new(writer.clone()));
            let pipeline = Pipeline::new(kind, config, loader, metrics);
            viewer.add_pipeline(kind, Arc::clone(pipeline.broadcaster()));
            endpoint.add_pipeline(kind, Arc::clone(pipeline.broadcaster()));

            let upstream = upstream_for(&config.ingest.upstream, kind).await;
            pipelines.push(pipeline.start(upstream, shutdown));
        }

        let listener = bind(&config.viewer.bind).await?;
        let viewer = tokio::spawn(Arc::new(viewer).serve(listener, shutdown.clone()));

        let http = if config.http.enabled {
            Some(HttpServer::start(
                &config.http.bind,
                Arc::new(endpoint),
                tokio::runtime::Handle::current(),
            )?)
        } else {
            None
        };

        info!(pipelines = pipelines.len(), "Ingest side started");
        Ok(Self {
            pipelines,
            viewer,
            http,
        })
    }

    async fn stop(self) {
        for handle in self.pipelines {
            let report: ShutdownReport = handle.stop().await;
            if let Some(exit) = &report.reader {
                info!(
                    pipeline = %report.pipeline,
                    messages = exit.messages(),
                    "Reader summary"
                );
            }
        }
        if let Err(e) = self.viewer.await {
            warn!(error = %e, "Viewer channel task failed");
        }
        if let Some(http) = self.http {
            if let Err(e) = tokio::task::spawn_blocking(move || http.shutdown()).await {
                warn!(error = %e, "HTTP shutdown failed");
            }
        }
    }
}

/// Subscribe to `kind`; a connect failure becomes the stream's only item so
/// the reader reports it and the rest of the pipeline keeps running.
async fn upstream_for(addr: &str, kind: StreamKind) -> UpstreamStream {
    match connect_upstream(addr, kind).await {
        Ok(conn) => Box::pin(conn),
        Err(e) => Box::pin(tokio_stream::iter(vec![Err(e)])),
    }
}
