//! Rota Fetch - Entry Point
//!
//! Fetches every URL given on the command line through one transport pipeline.
//! Ctrl+C or SIGTERM cancels every call still in flight.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rota_fetch::config::LogConfig;
use rota_fetch::models::drain_body;
use rota_fetch::{transport, Config, FetchRequest, Pipeline, Transport};

#[derive(Parser, Debug)]
#[command(name = "rota-fetch", version, about = "Fetch URLs through a resilient transport pipeline")]
struct Args {
    /// YAML configuration file (otherwise read from the environment)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Extra request header, `name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// Override the retry count
    #[arg(long)]
    retries: Option<u32>,

    /// Override the concurrency cap
    #[arg(long)]
    workers: Option<usize>,

    /// Print one JSON object per result
    #[arg(long)]
    json: bool,

    /// URLs to fetch
    #[arg(required = true)]
    urls: Vec<String>,
}

#[derive(Debug, Serialize)]
struct FetchOutcome {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    elapsed_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::from_env().context("failed to load configuration from environment")?,
    };
    if let Some(retries) = args.retries {
        config.transport.retries = retries;
    }
    if let Some(workers) = args.workers {
        config.transport.workers = workers;
    }

    init_tracing(&config.log);
    info!("Starting Rota Fetch");

    let pipeline = transport::build(&config.transport)?;
    let template = request_template(&args)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, cancelling requests");
        on_signal.cancel();
    });

    let mut requests = Vec::with_capacity(args.urls.len());
    for raw in &args.urls {
        let url: url::Url = raw
            .parse()
            .with_context(|| format!("invalid URL: {}", raw))?;
        let mut request = template.clone().with_cancellation(cancel.clone());
        request.url = url;
        requests.push(request);
    }

    let outcomes =
        futures::future::join_all(requests.into_iter().map(|req| fetch_one(&pipeline, req))).await;

    let mut failed = 0;
    for outcome in &outcomes {
        if outcome.error.is_some() {
            failed += 1;
        }
        if args.json {
            println!("{}", serde_json::to_string(outcome)?);
        } else {
            match (&outcome.status, &outcome.error) {
                (Some(status), _) => println!(
                    "{} {} ({} bytes, {} ms)",
                    status,
                    outcome.url,
                    outcome.bytes.unwrap_or(0),
                    outcome.elapsed_ms
                ),
                (None, Some(err)) => println!("ERR {} ({})", outcome.url, err),
                (None, None) => println!("??? {}", outcome.url),
            }
        }
    }

    info!("Rota Fetch finished: {} ok, {} failed", outcomes.len() - failed, failed);
    if failed > 0 {
        bail!("{} of {} fetches failed", failed, outcomes.len());
    }
    Ok(())
}

async fn fetch_one(pipeline: &Pipeline, request: FetchRequest) -> FetchOutcome {
    let url = request.url.to_string();
    let start = Instant::now();

    let (status, bytes, error) = match pipeline.execute(request).await {
        Ok(response) => {
            let status = response.status().as_u16();
            let bytes = drain_body(response, usize::MAX).await;
            (Some(status), Some(bytes), None)
        }
        Err(e) => {
            error!(url = %url, "Fetch failed: {}", e);
            (None, None, Some(e.to_string()))
        }
    };

    FetchOutcome {
        url,
        status,
        bytes,
        error,
        elapsed_ms: start.elapsed().as_millis() as u64,
    }
}

/// Method, headers and body shared by every URL
fn request_template(args: &Args) -> anyhow::Result<FetchRequest> {
    let method = reqwest::Method::from_bytes(args.method.to_uppercase().as_bytes())
        .with_context(|| format!("invalid method: {}", args.method))?;
    let placeholder = url::Url::parse("http://localhost/").context("placeholder URL")?;

    let mut request = FetchRequest::new(method, placeholder);
    for raw in &args.headers {
        let Some((name, value)) = raw.split_once(':') else {
            bail!("header must be `name: value`, got {:?}", raw);
        };
        request = request.try_header(name, value)?;
    }
    if let Some(data) = &args.data {
        request = request.body(data.clone());
    }
    Ok(request)
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rota_fetch={}", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    // Results go to stdout, logs to stderr
    if log.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
