use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Source of system load readings. `window` is the span CPU usage is averaged over.
pub trait LoadProbe {
    fn sample(&mut self, window: Duration) -> LoadSample;
}

pub struct SystemLoadProbe {
    system: System,
}

impl SystemLoadProbe {
    pub fn new() -> Self {
        let refresh = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
            .with_memory(MemoryRefreshKind::nothing().with_ram());
        Self {
            system: System::new_with_specifics(refresh),
        }
    }
}

impl Default for SystemLoadProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProbe for SystemLoadProbe {
    fn sample(&mut self, window: Duration) -> LoadSample {
        self.system.refresh_cpu_usage();
        thread::sleep(window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL));
        self.system.refresh_cpu_usage();
        self.system
            .refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());

        let total = self.system.total_memory();
        let available = self.system.available_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            total.saturating_sub(available) as f64 * 100.0 / total as f64
        };
        LoadSample {
            cpu_percent: f64::from(self.system.global_cpu_usage()),
            memory_percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdleSettings {
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub poll_interval: Duration,
    pub sample_window: Duration,
    /// `None` waits for as long as it takes.
    pub max_wait: Option<Duration>,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            cpu_threshold: 1.0,
            memory_threshold: 5.0,
            poll_interval: Duration::from_secs(5),
            sample_window: Duration::from_secs(1),
            max_wait: None,
        }
    }
}

impl IdleSettings {
    pub fn is_idle(&self, sample: &LoadSample) -> bool {
        sample.cpu_percent < self.cpu_threshold && sample.memory_percent < self.memory_threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    Idle { samples: usize },
    WaitExpired { samples: usize },
}

pub trait IdleGate {
    fn await_idle(&mut self) -> IdleOutcome;
}

/// Samples load until both CPU and memory are strictly under their thresholds.
pub struct PollingIdleGate<P> {
    probe: P,
    settings: IdleSettings,
}

impl<P: LoadProbe> PollingIdleGate<P> {
    pub fn new(probe: P, settings: IdleSettings) -> Self {
        Self { probe, settings }
    }

    pub fn settings(&self) -> &IdleSettings {
        &self.settings
    }
}

impl<P: LoadProbe> IdleGate for PollingIdleGate<P> {
    fn await_idle(&mut self) -> IdleOutcome {
        let started = Instant::now();
        let mut samples = 0;
        loop {
            let sample = self.probe.sample(self.settings.sample_window);
            samples += 1;
            info!(
                cpu_percent = sample.cpu_percent,
                memory_percent = sample.memory_percent,
                "load sample"
            );
            if self.settings.is_idle(&sample) {
                info!("system is idle, ready to start measurement");
                return IdleOutcome::Idle { samples };
            }
            if let Some(max_wait) = self.settings.max_wait {
                if started.elapsed() >= max_wait {
                    warn!(
                        waited_secs = started.elapsed().as_secs_f64(),
                        "system did not become idle before the wait limit"
                    );
                    return IdleOutcome::WaitExpired { samples };
                }
            }
            info!("waiting for system to become idle");
            thread::sleep(self.settings.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedProbe {
        samples: VecDeque<LoadSample>,
        taken: usize,
    }

    impl ScriptedProbe {
        fn new(samples: &[(f64, f64)]) -> Self {
            Self {
                samples: samples
                    .iter()
                    .map(|&(cpu_percent, memory_percent)| LoadSample {
                        cpu_percent,
                        memory_percent,
                    })
                    .collect(),
                taken: 0,
            }
        }
    }

    impl LoadProbe for ScriptedProbe {
        fn sample(&mut self, _window: Duration) -> LoadSample {
            self.taken += 1;
            self.samples
                .pop_front()
                .expect("gate sampled past the end of the script")
        }
    }

    fn fast_settings() -> IdleSettings {
        IdleSettings {
            cpu_threshold: 5.0,
            memory_threshold: 20.0,
            poll_interval: Duration::ZERO,
            sample_window: Duration::ZERO,
            max_wait: None,
        }
    }

    #[test]
    fn returns_after_one_sample_when_already_idle() {
        let mut gate = PollingIdleGate::new(ScriptedProbe::new(&[(0.5, 3.0)]), fast_settings());
        assert_eq!(gate.await_idle(), IdleOutcome::Idle { samples: 1 });
        assert_eq!(gate.probe.taken, 1);
    }

    #[test]
    fn keeps_polling_while_either_metric_is_high() {
        let script = [(50.0, 3.0), (1.0, 80.0), (5.0, 3.0), (1.0, 20.0), (4.9, 19.9)];
        let mut gate = PollingIdleGate::new(ScriptedProbe::new(&script), fast_settings());
        assert_eq!(gate.await_idle(), IdleOutcome::Idle { samples: 5 });
    }

    #[test]
    fn thresholds_are_strict() {
        let settings = fast_settings();
        assert!(!settings.is_idle(&LoadSample {
            cpu_percent: 5.0,
            memory_percent: 0.0
        }));
        assert!(!settings.is_idle(&LoadSample {
            cpu_percent: 0.0,
            memory_percent: 20.0
        }));
        assert!(settings.is_idle(&LoadSample {
            cpu_percent: 4.99,
            memory_percent: 19.99
        }));
    }

    #[test]
    fn bounded_wait_gives_up() {
        let settings = IdleSettings {
            max_wait: Some(Duration::ZERO),
            ..fast_settings()
        };
        let mut gate = PollingIdleGate::new(ScriptedProbe::new(&[(99.0, 99.0)]), settings);
        assert_eq!(gate.await_idle(), IdleOutcome::WaitExpired { samples: 1 });
    }
}
