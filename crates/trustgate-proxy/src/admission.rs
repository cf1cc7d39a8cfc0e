//! Connection admission control for the peer-facing listener.
//!
//! Every accepted TCP connection is checked against a set of load ceilings
//! before any TLS or HTTP work is done for it. A refused socket is simply
//! dropped. The only state kept between attempts is the counter of
//! connections that were admitted and have not finished yet.

use crate::config::AntiDosConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One sample of system load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    /// Load average divided by the number of CPUs.
    pub cpu_load: f64,
    /// File handles still available to the process.
    pub free_file_handles: u64,
    /// Resident memory as a fraction of total memory.
    pub heap_usage: f64,
}

/// Source of load samples.
pub trait LoadProbe: Send + Sync {
    /// Takes a sample. `None` when the platform cannot tell, in which case
    /// only the connection ceiling applies.
    fn sample(&self) -> Option<LoadSample>;
}

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum Refusal {
    #[error("too many parallel connections ({0})")]
    Connections(usize),
    #[error("CPU load {0:.2} over ceiling")]
    CpuLoad(f64),
    #[error("only {0} free file handles left")]
    FileHandles(u64),
    #[error("heap usage {0:.2} over ceiling")]
    HeapUsage(f64),
}

/// Admits or refuses connections based on [`AntiDosConfig`] ceilings.
pub struct AdmissionController {
    config: AntiDosConfig,
    probe: Arc<dyn LoadProbe>,
    active: Arc<AtomicUsize>,
}

impl AdmissionController {
    pub fn new(config: AntiDosConfig, probe: Arc<dyn LoadProbe>) -> Self {
        Self {
            config,
            probe,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Connections admitted and not yet finished.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Decides on one freshly accepted connection. The returned permit must
    /// live as long as the connection.
    ///
    /// # Errors
    ///
    /// Returns the first ceiling found exceeded.
    pub fn try_admit(&self) -> Result<Option<ConnectionPermit>, Refusal> {
        if !self.config.enabled {
            return Ok(None);
        }
        let permit = self.acquire()?;
        if let Some(sample) = self.probe.sample() {
            self.check_sample(&sample)?;
        }
        Ok(Some(permit))
    }

    fn acquire(&self) -> Result<ConnectionPermit, Refusal> {
        loop {
            let current = self.active.load(Ordering::SeqCst);
            if current >= self.config.max_parallel_connections {
                return Err(Refusal::Connections(current));
            }
            if self
                .active
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(ConnectionPermit {
                    active: Arc::clone(&self.active),
                });
            }
        }
    }

    fn check_sample(&self, sample: &LoadSample) -> Result<(), Refusal> {
        // Ratios above 1 switch their check off.
        if self.config.max_cpu_load <= 1.0 && sample.cpu_load > self.config.max_cpu_load {
            return Err(Refusal::CpuLoad(sample.cpu_load));
        }
        if sample.free_file_handles < self.config.min_free_file_handles {
            return Err(Refusal::FileHandles(sample.free_file_handles));
        }
        if self.config.max_heap_usage <= 1.0 && sample.heap_usage > self.config.max_heap_usage {
            return Err(Refusal::HeapUsage(sample.heap_usage));
        }
        Ok(())
    }
}

/// Holds one slot of the connection ceiling until dropped.
#[derive(Debug)]
pub struct ConnectionPermit {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Samples load from `/proc` on Linux; elsewhere it reports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl LoadProbe for SystemProbe {
    fn sample(&self) -> Option<LoadSample> {
        if !cfg!(target_os = "linux") {
            return None;
        }
        Some(LoadSample {
            cpu_load: read_cpu_load().unwrap_or(0.0),
            free_file_handles: read_free_file_handles().unwrap_or(u64::MAX),
            heap_usage: read_heap_usage().unwrap_or(0.0),
        })
    }
}

fn read_cpu_load() -> Option<f64> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let one_minute: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    Some(one_minute / cpus as f64)
}

fn read_free_file_handles() -> Option<u64> {
    let limits = std::fs::read_to_string("/proc/self/limits").ok()?;
    let soft_limit: u64 = limits
        .lines()
        .find(|line| line.starts_with("Max open files"))?
        .split_whitespace()
        .nth(3)?
        .parse()
        .ok()?;
    let open = std::fs::read_dir("/proc/self/fd").ok()?.count() as u64;
    Some(soft_limit.saturating_sub(open))
}

fn kb_field(contents: &str, name: &str) -> Option<u64> {
    contents
        .lines()
        .find(|line| line.starts_with(name))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn read_heap_usage() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let resident = kb_field(&status, "VmRSS:")?;
    let total = kb_field(&meminfo, "MemTotal:")?;
    (total > 0).then(|| resident as f64 / total as f64)
}

/// Probe returning a fixed, replaceable sample.
#[derive(Debug)]
pub struct StaticProbe {
    sample: std::sync::Mutex<Option<LoadSample>>,
}

impl StaticProbe {
    pub fn new(sample: Option<LoadSample>) -> Self {
        Self {
            sample: std::sync::Mutex::new(sample),
        }
    }

    pub fn set(&self, sample: Option<LoadSample>) {
        *self.sample.lock().unwrap_or_else(|p| p.into_inner()) = sample;
    }
}

impl LoadProbe for StaticProbe {
    fn sample(&self) -> Option<LoadSample> {
        *self.sample.lock().unwrap_or_else(|p| p.into_inner())
    }
}
