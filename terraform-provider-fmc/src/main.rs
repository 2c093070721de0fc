//! Terraform Provider for Cisco FMC
//!
//! This provider implements the Terraform Plugin Protocol for managing
//! Network Groups on a Secure Firewall Management Center, including groups
//! that contain each other.

mod client;
mod network_groups;
mod provider;
mod resources;
mod schema;

use anyhow::Context;
use clap::Parser;
use provider::FmcProvider;
use std::io::{self, BufRead, Write};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Terraform Provider for Cisco FMC
#[derive(Parser, Debug)]
#[command(name = "terraform-provider-fmc")]
#[command(about = "Terraform provider for Cisco Secure Firewall Management Center")]
struct Args {
    /// Enable debug mode
    #[arg(long)]
    debug: bool,

    /// Log level requested by Terraform
    #[arg(long, env = "TF_LOG", hide = true)]
    tf_log: Option<String>,
}

impl Args {
    fn log_level(&self) -> &'static str {
        let verbose = self
            .tf_log
            .as_deref()
            .map(|level| level.eq_ignore_ascii_case("debug") || level.eq_ignore_ascii_case("trace"))
            .unwrap_or(false);
        if self.debug || verbose {
            "debug"
        } else {
            "info"
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level().into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    tracing::info!("Starting Terraform Provider for FMC");

    // stdout carries protocol responses only; logs go to stderr
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut stdout_lock = stdout.lock();

    let provider = FmcProvider::new().context("failed to start the async runtime")?;

    for line in stdin.lock().lines() {
        let input = line.context("failed to read request")?;
        let response = provider.handle_request(&input);
        writeln!(stdout_lock, "{}", response).context("failed to write response")?;
        stdout_lock.flush().context("failed to flush stdout")?;
    }

    tracing::info!("Terraform Provider shutting down");
    Ok(())
}
