use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use thiserror::Error;

use crate::memory_stress::MIB;

/// Upper bound on forked load workers.
pub const MAX_WORKERS: i64 = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker count must not be negative (got {0})")]
    NegativeWorkers(i64),
    #[error("worker count {0} exceeds the limit of {max}", max = MAX_WORKERS)]
    TooManyWorkers(i64),
    #[error("duration must not be negative (got {0}s)")]
    NegativeDuration(i64),
    #[error("memory size must not be negative (got {0} MiB)")]
    NegativeMemory(i64),
    #[error("memory size of {0} MiB does not fit in the address space")]
    MemoryTooLarge(i64),
}

/// Named starting points; explicit flags override individual values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Preset {
    /// 2 workers for 60 seconds, no memory load.
    #[default]
    Standard,
    /// 4 workers and 4000 MiB until the killfile appears.
    Heavy,
}

impl Preset {
    pub fn workers(self) -> i64 {
        match self {
            Preset::Standard => 2,
            Preset::Heavy => 4,
        }
    }

    pub fn duration_secs(self) -> i64 {
        match self {
            Preset::Standard => 60,
            Preset::Heavy => 0,
        }
    }

    pub fn mem_mb(self) -> i64 {
        match self {
            Preset::Standard => 0,
            Preset::Heavy => 4000,
        }
    }

    pub fn killfile(self) -> Option<PathBuf> {
        match self {
            Preset::Standard => None,
            Preset::Heavy => Some(std::env::temp_dir().join("loadgen.kill")),
        }
    }
}

/// Poll intervals and drain windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub supervisor_tick: Duration,
    pub killfile_poll: Duration,
    pub hold_poll: Duration,
    pub ramp_pause: Duration,
    pub cpu_drain: Duration,
    pub memory_drain: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            supervisor_tick: Duration::from_millis(500),
            killfile_poll: Duration::from_secs(1),
            hold_poll: Duration::from_secs(1),
            ramp_pause: Duration::from_millis(100),
            cpu_drain: Duration::from_secs(5),
            memory_drain: Duration::from_secs(2),
        }
    }
}

/// Validated run parameters. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    workers: usize,
    duration: Option<Duration>,
    mem_mb: usize,
    killfile: Option<PathBuf>,
    timings: Timings,
}

impl RunConfig {
    /// Validate raw values. `duration_secs == 0` means unbounded, `mem_mb == 0`
    /// disables the memory worker, and an empty killfile path disables the
    /// monitor.
    pub fn new(
        workers: i64,
        duration_secs: i64,
        mem_mb: i64,
        killfile: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        if workers < 0 {
            return Err(ConfigError::NegativeWorkers(workers));
        }
        if workers > MAX_WORKERS {
            return Err(ConfigError::TooManyWorkers(workers));
        }
        if duration_secs < 0 {
            return Err(ConfigError::NegativeDuration(duration_secs));
        }
        if mem_mb < 0 {
            return Err(ConfigError::NegativeMemory(mem_mb));
        }
        let mem = usize::try_from(mem_mb)
            .ok()
            .filter(|mb| mb.checked_mul(MIB).is_some())
            .ok_or(ConfigError::MemoryTooLarge(mem_mb))?;

        Ok(Self {
            workers: workers as usize,
            duration: (duration_secs > 0).then(|| Duration::from_secs(duration_secs as u64)),
            mem_mb: mem,
            killfile: killfile.filter(|path| !path.as_os_str().is_empty()),
            timings: Timings::default(),
        })
    }

    pub fn with_timings(self, timings: Timings) -> Self {
        Self { timings, ..self }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// `None` when the run is bounded only by external stops.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn mem_mb(&self) -> usize {
        self.mem_mb
    }

    pub fn killfile(&self) -> Option<&std::path::Path> {
        self.killfile.as_deref()
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "workers: {}, duration: ", self.workers)?;
        match self.duration {
            Some(d) => write!(f, "{}s", d.as_secs())?,
            None => write!(f, "unbounded")?,
        }
        write!(f, ", memory: {} MiB, killfile: ", self.mem_mb)?;
        match &self.killfile {
            Some(path) => write!(f, "'{}'", path.display()),
            None => write!(f, "none"),
        }
    }
}
