//! CLI entry point for the courier tool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use courier_core::{Client, ClientOptions, RequestData};
use tracing::{debug, info};

mod cli;
mod progress_ui;

use cli::{Args, Command};

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
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let options = build_options(&args)?;
    let client = Client::new(options).context("failed to initialize client")?;
    forward_debug_events(&client);

    match args.command {
        Command::Get {
            url,
            query,
            header,
            output,
            fail_on_404,
        } => {
            let mut data = RequestData::get(url).is_404_error(fail_on_404);
            data.query.extend(query);
            data.headers.extend(header);
            run_get(&client, data, output.as_deref()).await
        }
        Command::Download {
            url,
            destination,
            header,
            no_progress,
        } => {
            let mut data = RequestData::get(url);
            data.headers.extend(header);
            run_download(&client, data, destination, !no_progress && !args.quiet).await
        }
    }
}

/// Loads the options file, if any, then applies flag overrides.
fn build_options(args: &Args) -> Result<ClientOptions> {
    let mut options = match &args.config {
        Some(path) => ClientOptions::from_json_file(path)
            .with_context(|| format!("failed to load options from {}", path.display()))?,
        None => ClientOptions::default(),
    };
    if let Some(dir) = &args.data_dir {
        options.data_dir.clone_from(dir);
    }
    if let Some(parallel) = args.parallel {
        options.download_parallel_count = usize::try_from(parallel)?;
    }
    if let Some(retries) = args.max_retries {
        options.download_max_retries = retries;
    }
    if let Some(ms) = args.rate_limit {
        options.rate_limit_time = Duration::from_millis(ms);
    }
    options.validate()?;
    Ok(options)
}

/// Mirrors the client's debug stream into tracing at debug level.
fn forward_debug_events(client: &Client) {
    let mut events = client.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(target: "courier::events", "{event}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "debug event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn run_get(client: &Client, data: RequestData, output: Option<&Path>) -> Result<()> {
    let link = data.link.clone();
    let body = client.requests().request(data).await?;
    let Some(body) = body else {
        info!(url = %link, "no content (404)");
        return Ok(());
    };
    match output {
        Some(path) => {
            tokio::fs::write(path, &body)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), bytes = body.len(), "response saved");
        }
        None => print!("{body}"),
    }
    Ok(())
}

async fn run_download(
    client: &Client,
    data: RequestData,
    destination: PathBuf,
    show_progress: bool,
) -> Result<()> {
    let bar = progress_ui::download_bar(show_progress);
    let data = data.with_listeners(progress_ui::listeners_for(&bar));

    let result = client.downloads().download(data, &destination).await;
    bar.finish_and_clear();

    let path = result?;
    info!(path = %path.display(), "download complete");
    Ok(())
}
