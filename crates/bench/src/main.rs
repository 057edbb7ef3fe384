use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use bench_core::Bencher;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bench")]
#[command(about = "Drives benchmark workloads against FaaS endpoints")]
struct Args {
    /// The workload descriptor file
    #[arg(long, default_value = "workloads/b0.yml")]
    workload: PathBuf,

    /// Verbose logging
    #[arg(long)]
    verbose: bool,

    /// Run without waiting for user confirmation
    #[arg(short = 'y', long = "unattended")]
    unattended: bool,

    /// Abort the workload on the first error
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut bencher = Bencher::from_file(&args.workload)
        .with_context(|| {
            format!("failed to create workload from {}", args.workload.display())
        })?
        .strict(args.strict);

    println!("Using the following workload:");
    println!("{}", bencher.workload());

    if !args.unattended
        && !ask_for_confirmation(
            "Do you want to continue with this benchmark?",
            io::stdin().lock(),
        )
    {
        return Ok(());
    }

    let start = Instant::now();
    bencher.run().await?;

    println!("Benchmark completed in {:?}", start.elapsed());
    Ok(())
}

/// Prompt the user; only `y`/`yes` (case-insensitive) confirm, no by
/// default.
fn ask_for_confirmation(prompt: &str, mut input: impl BufRead) -> bool {
    print!("{prompt} [y/N]: ");
    let _ = io::stdout().flush();

    let mut response = String::new();
    if input.read_line(&mut response).is_err() {
        return false;
    }
    matches!(
        response.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    )
}
