extern crate structopt;
extern crate ego_tree;
extern crate epub_builder;
extern crate html_escape;
extern crate reqwest;
extern crate scraper;
extern crate easy_error;
#[macro_use]
extern crate lazy_static;

mod book;
mod fetcher;
mod publisher;
mod scrape;
mod state;
mod text;
mod web;

use easy_error::{Error, ResultExt};
use fetcher::HttpFetcher;
use publisher::Publisher;
use reqwest::Url;
use state::StatusData;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::EnvFilter;
use web::{start_webserver, AppState};

/// Builds the latest chapter of The Wandering Inn into an EPUB and serves it over HTTP.
#[derive(StructOpt)]
struct Args {
    /// Port to listen on
    #[structopt(long, env = "PORT", default_value = "8080")]
    port: u16,
    /// Name shown by the greeting at /hello
    #[structopt(long, env = "NAME", default_value = "World")]
    name: String,
    /// Directory books are written to and served from
    #[structopt(long, env = "ASSETS_DIR", default_value = "assets", parse(from_os_str))]
    assets_dir: PathBuf,
    /// Homepage carrying the link to the latest chapter
    #[structopt(long, env = "SOURCE_URL", default_value = "https://wanderinginn.com/")]
    source_url: Url,
    /// Give up on a page that takes longer than this to download
    #[structopt(long, env = "FETCH_TIMEOUT_SECS", default_value = "30")]
    timeout_secs: u64,
    /// Service name shown on the status page
    #[structopt(long, env = "K_SERVICE", default_value = "twi-epub")]
    service: String,
    /// Revision shown on the status page, defaults to the crate version
    #[structopt(long, env = "K_REVISION")]
    revision: Option<String>,
}

fn main() -> Result<(), Error> {
    let args = Args::from_args();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    fs::create_dir_all(&args.assets_dir)
        .context(format!("Could not create asset directory {:?}", args.assets_dir))?;

    // Built before the runtime starts and dropped after it stops:
    // reqwest's blocking client cannot be created or dropped inside async code.
    let fetcher = HttpFetcher::new(Duration::from_secs(args.timeout_secs))
        .context("Could not create HTTP client")?;
    let source = Arc::new(fetcher);
    let publisher = Publisher::new(
        source.clone(),
        args.source_url.clone(),
        args.assets_dir.clone(),
    );
    let revision = args
        .revision
        .clone()
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    let state = AppState::new(
        Arc::new(publisher),
        StatusData::new(args.service.clone(), revision),
        &args.name,
    );

    info!(source = %args.source_url, assets = ?args.assets_dir, "Starting {}", args.service);
    let runtime = tokio::runtime::Runtime::new().context("Could not start async runtime")?;
    runtime
        .block_on(start_webserver(args.port, state))
        .context(format!("Web server on port {} failed", args.port))?;
    drop(runtime);
    drop(source);
    Ok(())
}
