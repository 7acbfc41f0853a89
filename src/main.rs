//! # DergiPark Gate
//!
//! Command-line front end: searches, converts and inspects DergiPark
//! articles through a shared, challenge-solving session.
//!
//! ## Usage
//!
//! ```sh
//! dergipark_gate search "yapay zeka" --sort newest
//! ```
//!
//! The outcome is printed as JSON on stdout. The process exits non-zero when
//! the outcome is anything but `ready`.

use clap::Parser;
use dergipark_gate::cli::{Cli, Command};
use dergipark_gate::config::Settings;
use dergipark_gate::service::{Gateway, Outcome};
use serde::Serialize;
use std::error::Error;
use std::process::ExitCode;
use tracing::{debug, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

fn render<T: Serialize>(outcome: &Outcome<T>) -> Result<ExitCode, Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    if outcome.is_ready() {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(status = outcome.status_code(), "Request did not succeed");
        Ok(ExitCode::FAILURE)
    }
}

#[tokio::main]
#[instrument]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    debug!(config = ?args.config, headless = args.headless, secrets = ?args.secrets(), "Parsed CLI arguments");

    let settings = Settings::load(args.config.as_deref())?;
    let gateway = Gateway::from_settings(&settings, &args.secrets(), args.headless)?;
    gateway.start().await;

    let code = match args.command {
        Command::Search(search) => render(&gateway.search(&search.into()).await),
        Command::Convert { input } => render(&gateway.convert(&input).await),
        Command::References { url } => render(&gateway.references(&url).await),
        Command::Session => render(&gateway.warm_session().await),
    };

    gateway.shutdown().await;
    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );
    code
}
