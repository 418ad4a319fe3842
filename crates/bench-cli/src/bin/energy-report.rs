use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "energy-report",
    version,
    about = "Aggregate per-instance energy tables into phase and instance summaries"
)]
struct Cli {
    /// Directory searched recursively for instance tables.
    root_directory: PathBuf,
}

fn main() -> Result<()> {
    bench_cli::init_tracing();
    let cli = Cli::parse();
    let output = bench_analysis::analyze(&cli.root_directory)?;
    println!("instances: {}", output.instances);
    println!("timed_out: {}", output.timed_out);
    println!("phase_summary: {}", output.phase_summary.display());
    println!("instance_totals: {}", output.instance_totals.display());
    println!("summary: {}", output.summary.display());
    Ok(())
}
