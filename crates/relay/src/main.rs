//! relay - bounded producer/consumer handoff demo.
//!
//! Reserves a source region straight from the OS page allocator, spawns a
//! consumer thread, streams a deterministic pattern across a counting
//! semaphore one packet per permit, then verifies the copy bit for bit.

use anyhow::Result;
use clap::Parser;
use relay_handoff::{driver, TransferPlan};
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Bounded producer/consumer handoff over a counting semaphore.
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bytes transferred per permit
    #[arg(long, default_value_t = TransferPlan::DEFAULT_PACKET_SIZE)]
    packet_size: usize,

    /// Total bytes to transfer
    #[arg(long, default_value_t = TransferPlan::DEFAULT_TOTAL_SIZE)]
    total_size: usize,

    /// Per-wait timeout in seconds
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Diagnostics go to stderr; stdout carries only the demo's own lines.
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Startup sanity line, as the original demo printed.
    println!(
        "π + e = {:.6}",
        std::f64::consts::PI + std::f64::consts::E
    );

    let plan = match TransferPlan::new(
        cli.packet_size,
        cli.total_size,
        Duration::from_secs(cli.timeout_secs),
    ) {
        Ok(plan) => plan,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    match driver::run(&plan) {
        Ok(report) => {
            if report.verification.is_ok() {
                println!("Verification completed!");
            }
            println!("Thread exit code is: {}", report.consumer_exit.code());
            std::process::exit(report.process_code());
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}
