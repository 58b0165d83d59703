//! CLI entry point for the courier tool.

use std::io::{self, IsTerminal, Read};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Parser;
use courier_core::{
    Cache, DiskCache, EventKind, HttpTransport, Method, NoCache, QueueConfig, Request,
    RequestError, RequestQueue, Response, config,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

/// What the delivery executor reports back to `main`.
enum Outcome {
    Fetched { url: String, response: Response<Bytes> },
    Failed { url: String, error: RequestError },
    Finished,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = load_config(&args)?;
    debug!(?config, "configuration resolved");

    // Read input: from positional args or stdin
    let input_text = if !args.urls.is_empty() {
        args.urls.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        info!("No input provided. Pipe URLs via stdin or pass as arguments.");
        info!("Example: echo 'https://example.com/' | courier");
        return Ok(());
    };

    let urls = parse_urls(&input_text);
    if urls.is_empty() {
        info!("No valid URLs found in input");
        return Ok(());
    }

    let cache: Arc<dyn Cache> = if args.no_cache {
        debug!("disk cache disabled");
        Arc::new(NoCache)
    } else {
        let dir = config
            .resolved_cache_dir()
            .unwrap_or_else(|| std::env::temp_dir().join("courier"));
        debug!(cache_dir = %dir.display(), "using disk cache");
        Arc::new(DiskCache::new(
            dir,
            config.cache_capacity_bytes,
            config.low_watermark,
        ))
    };

    let queue = RequestQueue::new(cache, Arc::new(HttpTransport::new()), config)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let finished_tx = tx.clone();
    queue.add_listener(
        |_| true,
        move |event| {
            if matches!(event.kind, EventKind::Marker("done")) {
                let _ = finished_tx.send(Outcome::Finished);
            }
        },
    );

    for url in &urls {
        let sink = tx.clone();
        let reported = url.clone();
        queue.add(
            Request::bytes(Method::Get, url.as_str()).on_complete(move |result| {
                let outcome = match result {
                    Ok(response) => Outcome::Fetched {
                        url: reported.clone(),
                        response,
                    },
                    Err(error) => Outcome::Failed {
                        url: reported.clone(),
                        error,
                    },
                };
                let _ = sink.send(outcome);
            }),
        );
        debug!(url = %url, "Enqueued URL");
    }
    drop(tx);

    queue.start();

    let mut finished = 0;
    let mut failed = 0;
    while finished < urls.len() {
        let Some(outcome) = rx.recv().await else {
            break;
        };
        match outcome {
            Outcome::Fetched { url, response } => report(&url, &response),
            Outcome::Failed { url, error } => {
                failed += 1;
                warn!(url = %url, kind = %error.kind(), error = %error, "request failed");
            }
            Outcome::Finished => finished += 1,
        }
    }

    queue.stop().await;

    info!(
        completed = finished - failed,
        failed,
        total = urls.len(),
        "Fetch complete"
    );

    if failed > 0 {
        bail!("{failed} of {} requests failed", urls.len());
    }
    Ok(())
}

/// Resolves the config file and applies CLI overrides on top.
fn load_config(args: &Args) -> Result<QueueConfig> {
    let mut config = match &args.config {
        Some(path) => QueueConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => match config::resolve_default_config_path().filter(|path| path.is_file()) {
            Some(path) => {
                debug!(path = %path.display(), "loading default config file");
                QueueConfig::load(&path)?
            }
            None => QueueConfig::default(),
        },
    };

    if let Some(workers) = args.workers {
        config.network_workers = usize::from(workers);
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = u32::from(max_retries);
    }
    if let Some(cache_dir) = &args.cache_dir {
        config.cache_dir = Some(cache_dir.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Keeps whitespace-separated tokens that parse as http(s) URLs.
fn parse_urls(input: &str) -> Vec<String> {
    input
        .split_whitespace()
        .filter(|token| match url::Url::parse(token) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => true,
            _ => {
                warn!(skipped = %token, "Skipped unrecognized input");
                false
            }
        })
        .map(str::to_string)
        .collect()
}

fn report(url: &str, response: &Response<Bytes>) {
    let origin = if response.intermediate {
        "cache, refreshing"
    } else if response.from_cache {
        "cache"
    } else if response.not_modified {
        "revalidated"
    } else {
        "network"
    };
    println!(
        "{} {} bytes ({origin}) {url}",
        response.status,
        response.result.len()
    );
}
