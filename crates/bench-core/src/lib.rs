use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Column order of every per-instance table. Downstream readers match on these names.
pub const TABLE_COLUMNS: [&str; 6] = ["label", "timestamp", "duration", "pkg", "dram", "socket"];

/// One measured phase: seconds for `duration`, joules for `pkg` and `dram`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub label: String,
    pub timestamp: f64,
    pub duration: f64,
    pub pkg: f64,
    pub dram: f64,
    pub socket: u32,
}

impl PhaseRecord {
    /// Row written in place of a measurement that never completed.
    pub fn zeroed(label: &str) -> Self {
        Self {
            label: label.to_string(),
            timestamp: 0.0,
            duration: 0.0,
            pkg: 0.0,
            dram: 0.0,
            socket: 0,
        }
    }

    pub fn is_zeroed(&self) -> bool {
        self.timestamp == 0.0
            && self.duration == 0.0
            && self.pkg == 0.0
            && self.dram == 0.0
            && self.socket == 0
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to read table {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("table {path} has columns {found:?}, expected {expected:?}")]
    Schema {
        path: PathBuf,
        found: Vec<String>,
        expected: Vec<String>,
    },
    #[error("table {path} has no row labelled '{label}'")]
    MissingLabel { path: PathBuf, label: String },
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file =
        fs::File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Serializes records with the fixed header and replaces `path` in one step.
pub fn write_table(path: &Path, records: &[PhaseRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if records.is_empty() {
        writer.write_record(TABLE_COLUMNS)?;
    }
    for record in records {
        writer.serialize(record)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to flush table buffer: {}", e))?;
    atomic_write_bytes(path, &bytes)
}

pub fn read_table(path: &Path) -> Result<Vec<PhaseRecord>, TableError> {
    let read_err = |source| TableError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(read_err)?;
    let headers = reader.headers().map_err(read_err)?.clone();
    if headers.iter().ne(TABLE_COLUMNS.iter().copied()) {
        return Err(TableError::Schema {
            path: path.to_path_buf(),
            found: headers.iter().map(|h| h.to_string()).collect(),
            expected: TABLE_COLUMNS.iter().map(|c| c.to_string()).collect(),
        });
    }
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row.map_err(read_err)?);
    }
    Ok(records)
}

pub fn find_row<'a>(
    path: &Path,
    records: &'a [PhaseRecord],
    label: &str,
) -> Result<&'a PhaseRecord, TableError> {
    records
        .iter()
        .find(|r| r.label == label)
        .ok_or_else(|| TableError::MissingLabel {
            path: path.to_path_buf(),
            label: label.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "bench_core_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    #[test]
    fn table_header_matches_fixed_columns() {
        let root = temp_root("header");
        let path = root.join("p01.csv");
        write_table(
            &path,
            &[PhaseRecord {
                label: "Parsing".to_string(),
                timestamp: 1700000000.5,
                duration: 1.0,
                pkg: 2.0,
                dram: 0.5,
                socket: 0,
            }],
        )
        .expect("write");
        let text = fs::read_to_string(&path).expect("read");
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("label,timestamp,duration,pkg,dram,socket"));
        assert_eq!(lines.next(), Some("Parsing,1700000000.5,1.0,2.0,0.5,0"));
        assert_eq!(lines.next(), None);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn write_table_overwrites_previous_contents() {
        let root = temp_root("overwrite");
        let path = root.join("p01.csv");
        let rows: Vec<PhaseRecord> = ["A", "B", "C"]
            .iter()
            .map(|l| PhaseRecord::zeroed(l))
            .collect();
        write_table(&path, &rows).expect("first write");
        write_table(&path, &rows[..1]).expect("second write");
        let back = read_table(&path).expect("read back");
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].label, "A");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn empty_table_still_carries_the_header() {
        let root = temp_root("empty");
        let path = root.join("empty.csv");
        write_table(&path, &[]).expect("write");
        let text = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["label,timestamp,duration,pkg,dram,socket"]);
        assert!(read_table(&path).expect("read back").is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn read_table_rejects_foreign_schema() {
        let root = temp_root("schema");
        let path = root.join("bad.csv");
        fs::write(&path, "name,energy\nParsing,1\n").expect("write");
        let err = read_table(&path).expect_err("schema mismatch");
        assert!(matches!(err, TableError::Schema { .. }), "unexpected: {}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn find_row_reports_missing_label() {
        let rows = vec![PhaseRecord::zeroed("Parsing")];
        let path = PathBuf::from("p01.csv");
        assert!(find_row(&path, &rows, "Parsing").is_ok());
        let err = find_row(&path, &rows, "Solving").expect_err("missing");
        assert!(err.to_string().contains("Solving"));
    }

    #[test]
    fn zeroed_rows_are_detected() {
        assert!(PhaseRecord::zeroed("Solving").is_zeroed());
        let mut row = PhaseRecord::zeroed("Solving");
        row.duration = 0.25;
        assert!(!row.is_zeroed());
    }
}
