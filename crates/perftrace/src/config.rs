//! Profiler configuration, read from the environment or built in code.

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Output file for the CPU profile
pub const ENV_CPUPROFILE: &str = "CPUPROFILE";
/// Signal number that toggles CPU profiling on and off
pub const ENV_CPUPROFILESIGNAL: &str = "CPUPROFILESIGNAL";
/// SIGPROF ticks per second
pub const ENV_CPUPROFILE_FREQUENCY: &str = "CPUPROFILE_FREQUENCY";
/// Prefix for heap profile dumps
pub const ENV_HEAPPROFILE: &str = "HEAPPROFILE";
/// Bytes allocated between sampled stack traces
pub const ENV_HEAPPROFILE_SAMPLE_INTERVAL: &str = "HEAPPROFILE_SAMPLE_INTERVAL";

pub const DEFAULT_FREQUENCY: u32 = 100;
pub const MAX_FREQUENCY: u32 = 4000;
pub const DEFAULT_SAMPLE_INTERVAL: usize = 512 * 1024;

/// Highest signal number accepted for the toggle signal
const MAX_SIGNAL: i32 = 64;

/// CPU profiler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerConfig {
    /// Profile destination. `None` leaves the profiler idle.
    pub output: Option<PathBuf>,
    /// When set, profiling starts and stops on each delivery of this signal
    /// instead of running from startup.
    pub toggle_signal: Option<i32>,
    /// Sampling frequency in Hz
    pub frequency: u32,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        ProfilerConfig {
            output: None,
            toggle_signal: None,
            frequency: DEFAULT_FREQUENCY,
        }
    }
}

impl ProfilerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ProfilerConfig::default();

        if let Some(path) = lookup(ENV_CPUPROFILE).filter(|s| !s.is_empty()) {
            config.output = Some(PathBuf::from(path));
        }

        if let Some(raw) = lookup(ENV_CPUPROFILESIGNAL) {
            let signal = raw.trim().parse::<i32>().map_err(|_| {
                Error::InvalidArgument(format!("{ENV_CPUPROFILESIGNAL}={raw} is not a number"))
            })?;
            config.toggle_signal = Some(signal);
        }

        if let Some(raw) = lookup(ENV_CPUPROFILE_FREQUENCY) {
            config.frequency = raw.trim().parse::<u32>().map_err(|_| {
                Error::InvalidArgument(format!(
                    "{ENV_CPUPROFILE_FREQUENCY}={raw} is not a number"
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn with_toggle_signal(mut self, signal: i32) -> Self {
        self.toggle_signal = Some(signal);
        self
    }

    pub fn with_frequency(mut self, frequency: u32) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.frequency == 0 || self.frequency > MAX_FREQUENCY {
            return Err(Error::InvalidArgument(format!(
                "CPU frequency must be between 1 and {MAX_FREQUENCY} Hz, got {}",
                self.frequency
            )));
        }

        if let Some(signal) = self.toggle_signal {
            if !(1..=MAX_SIGNAL).contains(&signal) {
                return Err(Error::InvalidArgument(format!(
                    "Toggle signal must be between 1 and {MAX_SIGNAL}, got {signal}"
                )));
            }
        }

        Ok(())
    }
}

/// Heap profiler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapProfilerConfig {
    /// Bytes allocated between sampled stack traces. 0 disables sampling.
    pub sample_interval: usize,
    /// Prefix for `prefix.NNNN.heap` dumps
    pub prefix: Option<PathBuf>,
}

impl Default for HeapProfilerConfig {
    fn default() -> Self {
        HeapProfilerConfig {
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            prefix: None,
        }
    }
}

impl HeapProfilerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = HeapProfilerConfig::default();

        if let Some(prefix) = lookup(ENV_HEAPPROFILE).filter(|s| !s.is_empty()) {
            config.prefix = Some(PathBuf::from(prefix));
        }

        if let Some(raw) = lookup(ENV_HEAPPROFILE_SAMPLE_INTERVAL) {
            config.sample_interval = raw.trim().parse::<usize>().map_err(|_| {
                Error::InvalidArgument(format!(
                    "{ENV_HEAPPROFILE_SAMPLE_INTERVAL}={raw} is not a byte count"
                ))
            })?;
        }

        Ok(config)
    }

    pub fn with_sample_interval(mut self, bytes: usize) -> Self {
        self.sample_interval = bytes;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Path of the `seq`-th heap profile dump, e.g. `prefix.0003.heap`.
    pub fn dump_path(&self, seq: u32) -> Option<PathBuf> {
        let prefix = self.prefix.as_ref()?;
        let mut name = prefix.clone().into_os_string();
        name.push(format!(".{seq:04}.heap"));
        Some(PathBuf::from(name))
    }
}
