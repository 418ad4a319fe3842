use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bench_core::{atomic_write_json_pretty, ensure_dir};
use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::config::HarnessConfig;
use crate::energy::EnergySampler;
use crate::executor::CommandRunner;
use crate::idle::IdleGate;
use crate::pipeline::PipelineRunner;
use crate::planners::InstanceFiles;

pub const DOMAIN_FILE_NAME: &str = "domain.hddl";
pub const INSTANCE_EXTENSION: &str = "hddl";
pub const MANIFEST_FILE_NAME: &str = "sweep_manifest.json";

/// Where a sweep reads its inputs and writes its per-instance directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepLayout {
    pub input_dir: PathBuf,
    pub domain_file: PathBuf,
    /// `<output_root>/<domain-name>`
    pub domain_dir: PathBuf,
    /// Problem files in name order.
    pub instances: Vec<PathBuf>,
}

impl SweepLayout {
    pub fn discover(input_dir: &Path, output_root: &Path) -> Result<Self> {
        let input_dir = input_dir
            .canonicalize()
            .with_context(|| format!("input directory not found: {}", input_dir.display()))?;
        let domain_file = input_dir.join(DOMAIN_FILE_NAME);
        if !domain_file.is_file() {
            return Err(anyhow!(
                "missing domain definition {}",
                domain_file.display()
            ));
        }
        let domain_name = input_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("cannot name domain from {}", input_dir.display()))?;

        let mut instances = Vec::new();
        for entry in fs::read_dir(&input_dir)
            .with_context(|| format!("failed to list {}", input_dir.display()))?
        {
            let path = entry?.path();
            let is_instance = path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(INSTANCE_EXTENSION)
                && path.file_name().and_then(|n| n.to_str()) != Some(DOMAIN_FILE_NAME);
            if is_instance {
                instances.push(path);
            }
        }
        instances.sort();
        if instances.is_empty() {
            return Err(anyhow!(
                "no problem instances (*.{}) found in {}",
                INSTANCE_EXTENSION,
                input_dir.display()
            ));
        }

        Ok(Self {
            domain_dir: output_root.join(domain_name),
            input_dir,
            domain_file,
            instances,
        })
    }

    pub fn instance_name(problem_file: &Path) -> String {
        problem_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn instance_dir(&self, problem_file: &Path) -> PathBuf {
        self.domain_dir.join(Self::instance_name(problem_file))
    }

    /// `<domain-dir>/<instance>/<instance>.csv`
    pub fn table_path(&self, problem_file: &Path) -> PathBuf {
        let name = Self::instance_name(problem_file);
        self.domain_dir.join(&name).join(format!("{}.csv", name))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.domain_dir.join(MANIFEST_FILE_NAME)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceResult {
    pub name: String,
    pub table_path: PathBuf,
    pub attempted: usize,
    pub timed_out_phase: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepSummary {
    pub domain_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub instances: Vec<InstanceResult>,
}

/// Runs every instance in order, one fresh pipeline run at a time.
pub fn run_sweep<G, E, S>(
    layout: &SweepLayout,
    config: &HarnessConfig,
    gate: &mut G,
    executor: &mut E,
    sampler: &mut S,
) -> Result<SweepSummary>
where
    G: IdleGate + ?Sized,
    E: CommandRunner + ?Sized,
    S: EnergySampler + ?Sized,
{
    let started_at = Utc::now();
    ensure_dir(&layout.domain_dir)?;
    let mut results = Vec::with_capacity(layout.instances.len());

    for problem_file in &layout.instances {
        let name = SweepLayout::instance_name(problem_file);
        let work_dir = layout.instance_dir(problem_file);
        ensure_dir(&work_dir)?;
        info!(instance = %name, planner = %config.planner, "solving problem instance");

        let files = InstanceFiles {
            tool_dir: config.tool_dir.clone(),
            domain_file: layout.domain_file.clone(),
            problem_file: problem_file.clone(),
            work_dir,
        };
        let pipeline = config.planner.build_pipeline(&files)?;
        let table_path = layout.table_path(problem_file);

        let report = PipelineRunner::new(&mut *gate, &mut *executor, &mut *sampler, config.timeout)
            .run(&pipeline, &table_path)?;
        info!(
            instance = %name,
            table = %table_path.display(),
            timed_out = report.timed_out(),
            "instance finished"
        );
        results.push(InstanceResult {
            name,
            table_path,
            attempted: report.attempted,
            timed_out_phase: report.timed_out_phase,
        });
    }

    let manifest_path = layout.manifest_path();
    write_manifest(&manifest_path, layout, config, &results, started_at)?;
    Ok(SweepSummary {
        domain_dir: layout.domain_dir.clone(),
        manifest_path,
        instances: results,
    })
}

fn write_manifest(
    path: &Path,
    layout: &SweepLayout,
    config: &HarnessConfig,
    results: &[InstanceResult],
    started_at: chrono::DateTime<Utc>,
) -> Result<()> {
    let instances: Vec<_> = results
        .iter()
        .map(|r| {
            json!({
                "name": r.name,
                "table": r.table_path.display().to_string(),
                "status": if r.timed_out_phase.is_some() { "timed_out" } else { "completed" },
                "phases_attempted": r.attempted,
                "timed_out_phase": r.timed_out_phase,
            })
        })
        .collect();
    let payload = json!({
        "schema_version": "sweep_manifest_v1",
        "planner": config.planner.as_str(),
        "phases": config.planner.phase_labels(),
        "input_dir": layout.input_dir.display().to_string(),
        "domain_file": layout.domain_file.display().to_string(),
        "timeout_secs": config.timeout.as_secs(),
        "started_at": started_at.to_rfc3339(),
        "finished_at": Utc::now().to_rfc3339(),
        "instances": instances,
    });
    atomic_write_json_pretty(path, &payload)
}
