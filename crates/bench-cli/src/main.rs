use anyhow::{Context, Result};
use bench_runner::{
    run_sweep, EnergySampler, HarnessConfig, PollingIdleGate, ProcessGroupExecutor, RaplSampler,
    SweepLayout, SystemLoadProbe, WallClockSampler,
};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "energy-bench",
    version,
    about = "Measure per-phase energy and time of a planner over every problem in a domain"
)]
struct Cli {
    /// Directory holding domain.hddl and the problem instances.
    input_directory: PathBuf,
}

fn default_tool_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate the running executable")?;
    Ok(exe
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".")))
}

fn main() -> Result<()> {
    bench_cli::init_tracing();
    let cli = Cli::parse();

    let config = HarnessConfig::load(&cli.input_directory, default_tool_dir()?)?;
    let output_root = std::env::current_dir().context("cannot read current directory")?;
    let layout = SweepLayout::discover(&cli.input_directory, &output_root)?;
    info!(
        planner = %config.planner,
        instances = layout.instances.len(),
        tool_dir = %config.tool_dir.display(),
        out = %layout.domain_dir.display(),
        "starting sweep"
    );

    let mut gate = PollingIdleGate::new(SystemLoadProbe::new(), config.idle.clone());
    let mut executor = ProcessGroupExecutor::default();
    let mut sampler: Box<dyn EnergySampler> =
        match RaplSampler::discover(&config.powercap_root, config.socket) {
            Ok(rapl) => Box::new(rapl),
            Err(err) => {
                warn!(error = %err, "RAPL counters unavailable; recording wall-clock time only");
                Box::new(WallClockSampler {
                    socket: config.socket,
                })
            }
        };

    let summary = run_sweep(&layout, &config, &mut gate, &mut executor, sampler.as_mut())?;

    println!("planner: {}", config.planner);
    println!("domain_dir: {}", summary.domain_dir.display());
    for instance in &summary.instances {
        match &instance.timed_out_phase {
            Some(phase) => println!(
                "instance: {} timed_out ({}) {}",
                instance.name,
                phase,
                instance.table_path.display()
            ),
            None => println!(
                "instance: {} completed {}",
                instance.name,
                instance.table_path.display()
            ),
        }
    }
    println!("manifest: {}", summary.manifest_path.display());
    Ok(())
}
