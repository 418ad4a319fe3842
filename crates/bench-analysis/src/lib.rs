use anyhow::{anyhow, Context, Result};
use bench_core::{atomic_write_bytes, atomic_write_json_pretty, find_row, read_table, PhaseRecord};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Output directory created under the report root. Never scanned for tables.
pub const ANALYSIS_DIR_NAME: &str = "analysis";
pub const PHASE_SUMMARY_FILE: &str = "phase_summary.csv";
pub const INSTANCE_TOTALS_FILE: &str = "instance_totals.csv";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseCell {
    pub instance: String,
    pub phase: String,
    pub pkg: f64,
    pub dram: f64,
    pub duration: f64,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceTotal {
    pub instance: String,
    pub pkg: f64,
    pub dram: f64,
    pub duration: f64,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub phases: Vec<String>,
    /// Instance-major, phases in label order.
    pub cells: Vec<PhaseCell>,
    pub totals: Vec<InstanceTotal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutput {
    pub analysis_dir: PathBuf,
    pub phase_summary: PathBuf,
    pub instance_totals: PathBuf,
    pub summary: PathBuf,
    pub instances: usize,
    pub timed_out: usize,
}

/// Every `*.csv` under `root` in path order, skipping `<root>/analysis`.
pub fn collect_tables(root: &Path) -> Result<Vec<PathBuf>> {
    let analysis_dir = root.join(ANALYSIS_DIR_NAME);
    let walker = walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.path() != analysis_dir);
    let mut tables = Vec::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        let is_csv = entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some("csv");
        if is_csv {
            tables.push(entry.path().to_path_buf());
        }
    }
    Ok(tables)
}

fn instance_label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Reads the tables and lines every instance up against the first table's phase labels.
pub fn build_report(tables: &[PathBuf]) -> Result<Report> {
    let first = tables
        .first()
        .ok_or_else(|| anyhow!("no instance tables to aggregate"))?;
    let phases: Vec<String> = read_table(first)?
        .into_iter()
        .map(|r| r.label)
        .collect();

    let mut cells = Vec::with_capacity(tables.len() * phases.len());
    let mut totals = Vec::with_capacity(tables.len());
    for path in tables {
        let records = read_table(path)?;
        let instance = instance_label(path);
        // Zero rows everywhere is the fallback table of a timed-out run.
        let timed_out = records.iter().all(PhaseRecord::is_zeroed);
        if timed_out {
            warn!(instance = %instance, table = %path.display(), "instance timed out");
        }

        let mut total = InstanceTotal {
            instance: instance.clone(),
            pkg: 0.0,
            dram: 0.0,
            duration: 0.0,
            timed_out,
        };
        for phase in &phases {
            let row = find_row(path, &records, phase)?;
            total.pkg += row.pkg;
            total.dram += row.dram;
            total.duration += row.duration;
            cells.push(PhaseCell {
                instance: instance.clone(),
                phase: phase.clone(),
                pkg: row.pkg,
                dram: row.dram,
                duration: row.duration,
                timed_out,
            });
        }
        totals.push(total);
    }

    Ok(Report {
        phases,
        cells,
        totals,
    })
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

impl Report {
    pub fn timed_out_instances(&self) -> Vec<&str> {
        self.totals
            .iter()
            .filter(|t| t.timed_out)
            .map(|t| t.instance.as_str())
            .collect()
    }

    /// Means over instances that ran to completion. `null` when none did.
    pub fn summary_json(&self, root: &Path) -> Value {
        let phase_means: Vec<Value> = self
            .phases
            .iter()
            .map(|phase| {
                let rows = || {
                    self.cells
                        .iter()
                        .filter(move |c| &c.phase == phase && !c.timed_out)
                };
                json!({
                    "phase": phase,
                    "pkg": mean(rows().map(|c| c.pkg)),
                    "dram": mean(rows().map(|c| c.dram)),
                    "duration": mean(rows().map(|c| c.duration)),
                })
            })
            .collect();
        let completed = || self.totals.iter().filter(|t| !t.timed_out);
        let timed_out = self.timed_out_instances();
        json!({
            "schema_version": "energy_summary_v1",
            "root": root.display().to_string(),
            "generated_at": Utc::now().to_rfc3339(),
            "phases": self.phases,
            "instances": self.totals.len(),
            "timed_out_instances": timed_out.len(),
            "timed_out": timed_out,
            "phase_means": phase_means,
            "total_means": {
                "pkg": mean(completed().map(|t| t.pkg)),
                "dram": mean(completed().map(|t| t.dram)),
                "duration": mean(completed().map(|t| t.duration)),
            },
        })
    }
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow!("failed to flush {}: {}", path.display(), e))?;
    atomic_write_bytes(path, &bytes)
}

pub fn write_report(root: &Path, report: &Report) -> Result<AnalysisOutput> {
    let analysis_dir = root.join(ANALYSIS_DIR_NAME);
    let phase_summary = analysis_dir.join(PHASE_SUMMARY_FILE);
    let instance_totals = analysis_dir.join(INSTANCE_TOTALS_FILE);
    let summary = analysis_dir.join(SUMMARY_FILE);
    write_csv(&phase_summary, &report.cells)?;
    write_csv(&instance_totals, &report.totals)?;
    atomic_write_json_pretty(&summary, &report.summary_json(root))?;
    Ok(AnalysisOutput {
        analysis_dir,
        phase_summary,
        instance_totals,
        summary,
        instances: report.totals.len(),
        timed_out: report.timed_out_instances().len(),
    })
}

/// Aggregates every instance table under `root` into `<root>/analysis/`.
pub fn analyze(root: &Path) -> Result<AnalysisOutput> {
    let tables = collect_tables(root)?;
    if tables.is_empty() {
        return Err(anyhow!("no *.csv tables found under {}", root.display()));
    }
    info!(root = %root.display(), tables = tables.len(), "aggregating instance tables");
    let report = build_report(&tables)?;
    write_report(root, &report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::{ensure_dir, write_table, TableError};
    use std::fs;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "bench_analysis_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    fn row(label: &str, duration: f64, pkg: f64, dram: f64) -> PhaseRecord {
        PhaseRecord {
            label: label.to_string(),
            timestamp: 1700000000.0,
            duration,
            pkg,
            dram,
            socket: 0,
        }
    }

    fn seed(root: &Path) {
        write_table(
            &root.join("p01").join("p01.csv"),
            &[row("Parsing", 1.0, 2.0, 0.5), row("Solving", 3.0, 6.0, 1.5)],
        )
        .expect("p01");
        write_table(
            &root.join("p02").join("p02.csv"),
            &[PhaseRecord::zeroed("Parsing"), PhaseRecord::zeroed("Solving")],
        )
        .expect("p02");
        // Rows out of order still match by label.
        write_table(
            &root.join("p03").join("p03.csv"),
            &[row("Solving", 5.0, 10.0, 2.5), row("Parsing", 2.0, 4.0, 1.0)],
        )
        .expect("p03");
    }

    #[test]
    fn report_sums_phases_and_flags_zero_tables() {
        let root = temp_root("report");
        seed(&root);
        let tables = collect_tables(&root).expect("collect");
        let report = build_report(&tables).expect("report");

        assert_eq!(report.phases, vec!["Parsing", "Solving"]);
        assert_eq!(report.cells.len(), 6);
        assert_eq!(report.cells[5].phase, "Solving");
        assert_eq!(report.cells[5].pkg, 10.0);
        let names: Vec<&str> = report.totals.iter().map(|t| t.instance.as_str()).collect();
        assert_eq!(names, vec!["p01", "p02", "p03"]);
        assert_eq!(report.totals[0].pkg, 8.0);
        assert_eq!(report.totals[0].duration, 4.0);
        assert_eq!(report.timed_out_instances(), vec!["p02"]);

        let summary = report.summary_json(&root);
        assert_eq!(summary["timed_out_instances"], 1);
        assert_eq!(summary["phase_means"][0]["phase"], "Parsing");
        assert_eq!(summary["phase_means"][0]["pkg"], 3.0);
        assert_eq!(summary["phase_means"][1]["duration"], 4.0);
        assert_eq!(summary["total_means"]["dram"], 2.75);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn analyze_writes_outputs_and_ignores_its_own_directory() {
        let root = temp_root("analyze");
        seed(&root);
        let first = analyze(&root).expect("first pass");
        assert_eq!(first.instances, 3);
        assert_eq!(first.timed_out, 1);

        let totals = fs::read_to_string(&first.instance_totals).expect("totals");
        let mut lines = totals.lines();
        assert_eq!(lines.next(), Some("instance,pkg,dram,duration,timed_out"));
        assert_eq!(lines.next(), Some("p01,8.0,2.0,4.0,false"));
        assert_eq!(lines.next(), Some("p02,0.0,0.0,0.0,true"));

        let cells = fs::read_to_string(&first.phase_summary).expect("cells");
        assert!(cells.starts_with("instance,phase,pkg,dram,duration,timed_out\n"));
        assert_eq!(cells.lines().count(), 7);

        let second = analyze(&root).expect("second pass");
        assert_eq!(second.instances, 3);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn table_missing_a_phase_label_is_an_error() {
        let root = temp_root("missing");
        write_table(
            &root.join("a.csv"),
            &[row("Parsing", 1.0, 1.0, 1.0), row("Solving", 1.0, 1.0, 1.0)],
        )
        .expect("a");
        write_table(&root.join("b.csv"), &[row("Parsing", 1.0, 1.0, 1.0)]).expect("b");
        let err = analyze(&root).expect_err("missing label");
        match err.downcast_ref::<TableError>() {
            Some(TableError::MissingLabel { label, .. }) => assert_eq!(label, "Solving"),
            other => panic!("unexpected error: {:?} ({})", other, err),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn empty_root_is_an_error() {
        let root = temp_root("empty");
        let err = analyze(&root).expect_err("no tables");
        assert!(err.to_string().contains("no *.csv tables"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }
}
