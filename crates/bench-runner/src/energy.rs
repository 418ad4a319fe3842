use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::executor::ExecutionOutcome;

/// One reading in the sampler's native units: micro-seconds and micro-joules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawReading {
    pub timestamp: f64,
    pub duration_us: f64,
    pub pkg_uj: f64,
    pub dram_uj: f64,
    pub socket: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampled {
    pub outcome: ExecutionOutcome,
    /// `None` when the sampler could not bracket the call with two complete readings.
    pub reading: Option<RawReading>,
}

/// Measures energy and time spent inside exactly one call.
pub trait EnergySampler {
    fn measure(&mut self, call: &mut dyn FnMut() -> ExecutionOutcome) -> Sampled;
}

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Time-only sampler for hosts without energy counters. Energy readings are zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClockSampler {
    pub socket: u32,
}

impl EnergySampler for WallClockSampler {
    fn measure(&mut self, call: &mut dyn FnMut() -> ExecutionOutcome) -> Sampled {
        let timestamp = epoch_seconds();
        let started = Instant::now();
        let outcome = call();
        Sampled {
            outcome,
            reading: Some(RawReading {
                timestamp,
                duration_us: started.elapsed().as_micros() as f64,
                pkg_uj: 0.0,
                dram_uj: 0.0,
                socket: self.socket,
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct PowercapZone {
    energy_path: PathBuf,
    max_range_uj: u64,
}

impl PowercapZone {
    fn open(dir: &Path) -> Result<Self> {
        let energy_path = dir.join("energy_uj");
        let max_range_uj = read_counter(&dir.join("max_energy_range_uj"))?;
        read_counter(&energy_path)?;
        Ok(Self {
            energy_path,
            max_range_uj,
        })
    }

    fn read(&self) -> Result<u64> {
        read_counter(&self.energy_path)
    }

    /// Energy consumed between two counter reads, allowing for one wraparound.
    fn delta(&self, before: u64, after: u64) -> u64 {
        if after >= before {
            after - before
        } else {
            self.max_range_uj.saturating_sub(before) + after
        }
    }
}

fn read_counter(path: &Path) -> Result<u64> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("malformed counter in {}", path.display()))
}

fn zone_name(dir: &Path) -> Option<String> {
    fs::read_to_string(dir.join("name"))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Reads Linux powercap RAPL counters for one package and its DRAM sub-zone.
#[derive(Debug, Clone)]
pub struct RaplSampler {
    socket: u32,
    pkg: PowercapZone,
    dram: Option<PowercapZone>,
}

impl RaplSampler {
    pub const DEFAULT_POWERCAP_ROOT: &'static str = "/sys/class/powercap";

    pub fn discover(powercap_root: &Path, socket: u32) -> Result<Self> {
        let package_dir = powercap_root.join(format!("intel-rapl:{}", socket));
        let name = zone_name(&package_dir).ok_or_else(|| {
            anyhow!(
                "no RAPL package zone for socket {} under {}",
                socket,
                powercap_root.display()
            )
        })?;
        if !name.starts_with("package") {
            return Err(anyhow!(
                "{} is a '{}' zone, not a package zone",
                package_dir.display(),
                name
            ));
        }
        let pkg = PowercapZone::open(&package_dir)?;

        let prefix = format!("intel-rapl:{}:", socket);
        let mut dram = None;
        let mut entries: Vec<PathBuf> = fs::read_dir(&package_dir)
            .with_context(|| format!("failed to list {}", package_dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        entries.sort();
        for dir in entries {
            if zone_name(&dir).as_deref() == Some("dram") {
                dram = Some(PowercapZone::open(&dir)?);
                break;
            }
        }
        if dram.is_none() {
            warn!(socket, "no dram RAPL zone found; dram energy will read as zero");
        }
        debug!(socket, package = %package_dir.display(), "using RAPL powercap counters");
        Ok(Self { socket, pkg, dram })
    }

    fn read_all(&self) -> Result<(u64, Option<u64>)> {
        let pkg = self.pkg.read()?;
        let dram = match &self.dram {
            Some(zone) => Some(zone.read()?),
            None => None,
        };
        Ok((pkg, dram))
    }
}

impl EnergySampler for RaplSampler {
    fn measure(&mut self, call: &mut dyn FnMut() -> ExecutionOutcome) -> Sampled {
        let timestamp = epoch_seconds();
        let before = self.read_all();
        let started = Instant::now();
        let outcome = call();
        let duration_us = started.elapsed().as_micros() as f64;
        let after = self.read_all();

        let reading = match (before, after) {
            (Ok((pkg_before, dram_before)), Ok((pkg_after, dram_after))) => {
                let dram_uj = match (&self.dram, dram_before, dram_after) {
                    (Some(zone), Some(b), Some(a)) => zone.delta(b, a) as f64,
                    _ => 0.0,
                };
                Some(RawReading {
                    timestamp,
                    duration_us,
                    pkg_uj: self.pkg.delta(pkg_before, pkg_after) as f64,
                    dram_uj,
                    socket: self.socket,
                })
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "energy counters could not be read around the call");
                None
            }
        };
        Sampled { outcome, reading }
    }
}
