//! Run orchestration: launch workers, wait for a stop trigger, drain.
//!
//! A run moves through `Configuring -> Running -> Draining -> Terminated`.
//! Configuration is validated when the `RunConfig` is built, so a
//! `Supervisor` only ever holds a config that is safe to launch.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::RunConfig;
use crate::cpu_stress::{stress_cpu, LoadSettings};
use crate::killfile::watch_killfile;
use crate::memory_stress::{check_memory_usage, stress_memory, MemoryOutcome, MemoryReport, MemorySettings, MIB};
use crate::stop_signal::{LocalFlag, SharedFlag, StopSignal};
use crate::worker::{Drain, ProcessWorker, ThreadWorker, WorkerHandle};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to map shared stop flag: {0}")]
    SharedFlag(#[source] io::Error),
    #[error("failed to fork load worker {index}: {source}")]
    Fork {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to start {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configuring,
    Running,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    Killfile,
    Interrupted,
    /// The stop flag was raised by something other than the supervisor or
    /// the killfile monitor.
    External,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::DurationElapsed => "duration elapsed",
            StopReason::Killfile => "killfile observed",
            StopReason::Interrupted => "interrupted by operator",
            StopReason::External => "stop requested externally",
        };
        f.write_str(text)
    }
}

/// Summary of a finished run.
#[derive(Debug)]
pub struct RunReport {
    pub reason: StopReason,
    pub elapsed: Duration,
    pub load_workers: usize,
    /// Workers still alive at the end of their drain window.
    pub forced: Vec<String>,
    /// Workers that exited abnormally, with a description.
    pub failed: Vec<(String, String)>,
    /// `None` when no memory worker ran or it had to be detached.
    pub memory: Option<MemoryReport>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run stopped after {:.1}s ({}); {} load worker(s)",
            self.elapsed.as_secs_f64(),
            self.reason,
            self.load_workers
        )?;
        if self.forced.is_empty() {
            write!(f, ", all workers exited cleanly")?;
        } else {
            write!(f, ", forced termination: {}", self.forced.join(", "))?;
        }
        for (id, why) in &self.failed {
            write!(f, "; {id} {why}")?;
        }
        if let Some(memory) = &self.memory {
            write!(f, "; memory peak {} MiB", memory.peak_bytes / MIB)?;
            if let MemoryOutcome::Failed(failure) = &memory.outcome {
                write!(f, " ({failure})")?;
            }
        }
        Ok(())
    }
}

/// What woke the supervising loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Deadline,
    Flag,
    Interrupt,
}

/// Everything launched for one run.
#[derive(Default)]
struct Crew {
    load: Vec<ProcessWorker>,
    memory: Option<ThreadWorker<MemoryReport>>,
    monitor: Option<ThreadWorker<bool>>,
}

/// Drain results gathered from a `Crew`.
#[derive(Default)]
struct Drained {
    forced: Vec<String>,
    failed: Vec<(String, String)>,
    memory: Option<MemoryReport>,
    killfile_tripped: bool,
}

impl Drained {
    fn record<T>(&mut self, id: String, outcome: Drain<T>) -> Option<T> {
        match outcome {
            Drain::Finished(value) => return Some(value),
            Drain::Failed(why) => {
                tracing::warn!(worker = %id, %why, "worker exited abnormally");
                self.failed.push((id, why));
            }
            Drain::Forced => self.forced.push(id),
        }
        None
    }
}

impl Crew {
    /// Bounded wait on every unit. Deadlines are shared per worker class, so
    /// the whole drain takes at most the longest window plus one kill-and-reap.
    fn drain(self, cpu_window: Duration, memory_window: Duration) -> Drained {
        let start = Instant::now();
        let cpu_deadline = start + cpu_window;
        let memory_deadline = start + memory_window;
        let mut drained = Drained::default();

        for worker in self.load {
            let id = worker.id().to_string();
            drained.record(id, worker.drain_until(cpu_deadline));
        }
        if let Some(worker) = self.memory {
            let id = worker.id().to_string();
            drained.memory = drained.record(id, worker.drain_until(memory_deadline));
        }
        if let Some(worker) = self.monitor {
            let id = worker.id().to_string();
            drained.killfile_tripped = drained
                .record(id, worker.drain_until(memory_deadline))
                .unwrap_or(false);
        }
        drained
    }
}

pub struct Supervisor {
    config: RunConfig,
    interrupt: LocalFlag,
    phase: Phase,
}

impl Supervisor {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            interrupt: LocalFlag::default(),
            phase: Phase::Configuring,
        }
    }

    /// Use `interrupt` as the operator interrupt request (set by a Ctrl-C handler).
    pub fn with_interrupt(self, interrupt: LocalFlag) -> Self {
        Self { interrupt, ..self }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Execute one run to completion.
    ///
    /// Every stop trigger ends in `Ok`; errors are limited to setup failures,
    /// and even then any already-launched worker is stopped and drained first.
    pub fn run(&mut self) -> Result<RunReport, SupervisorError> {
        let started = Instant::now();
        let stop = Arc::new(SharedFlag::new().map_err(SupervisorError::SharedFlag)?);

        self.phase = Phase::Running;
        tracing::info!(config = %self.config, "starting run");
        check_memory_usage("before run");

        let crew = match self.launch(&stop) {
            Ok(crew) => crew,
            Err((crew, err)) => {
                tracing::error!(error = %err, "launch failed, stopping started workers");
                stop.set();
                self.phase = Phase::Draining;
                let timings = self.config.timings();
                crew.drain(timings.cpu_drain, timings.memory_drain);
                self.phase = Phase::Terminated;
                return Err(err);
            }
        };
        let load_workers = crew.load.len();

        let trigger = self.supervise(&*stop, started);

        self.phase = Phase::Draining;
        tracing::info!(?trigger, "draining workers");
        let timings = self.config.timings();
        let drained = crew.drain(timings.cpu_drain, timings.memory_drain);

        let reason = match trigger {
            Trigger::Deadline => StopReason::DurationElapsed,
            Trigger::Interrupt => StopReason::Interrupted,
            Trigger::Flag if drained.killfile_tripped => StopReason::Killfile,
            Trigger::Flag => StopReason::External,
        };

        self.phase = Phase::Terminated;
        check_memory_usage("after run");
        let report = RunReport {
            reason,
            elapsed: started.elapsed(),
            load_workers,
            forced: drained.forced,
            failed: drained.failed,
            memory: drained.memory,
        };
        tracing::info!(%report, "run terminated");
        Ok(report)
    }

    /// Fork the load workers, then start the memory worker and killfile
    /// monitor threads. On failure the partially built crew is handed back
    /// so the caller can drain it.
    fn launch(&self, stop: &Arc<SharedFlag>) -> Result<Crew, (Crew, SupervisorError)> {
        let mut crew = Crew::default();
        let timings = *self.config.timings();

        let workers = self.config.workers();
        let cpus = num_cpus::get();
        if workers > cpus {
            tracing::warn!(workers, cpus, "more load workers than logical CPUs");
        }

        for index in 1..=workers {
            let settings = LoadSettings::default().with_random_phase();
            let flag = Arc::clone(stop);
            match ProcessWorker::spawn(format!("cpu-{index}"), move || {
                stress_cpu(&*flag, &settings);
            }) {
                Ok(worker) => crew.load.push(worker),
                Err(source) => return Err((crew, SupervisorError::Fork { index, source })),
            }
        }
        tracing::info!(workers, "load workers started");

        let mem_mb = self.config.mem_mb();
        if mem_mb > 0 {
            let flag = Arc::clone(stop);
            let settings = MemorySettings {
                ramp_pause: timings.ramp_pause,
                hold_poll: timings.hold_poll,
                ..MemorySettings::default()
            };
            match ThreadWorker::spawn("memory", move || stress_memory(&*flag, mem_mb, &settings)) {
                Ok(worker) => crew.memory = Some(worker),
                Err(source) => return Err((crew, SupervisorError::Thread { name: "memory", source })),
            }
        }

        if let Some(path) = self.config.killfile() {
            let flag = Arc::clone(stop);
            let path = path.to_path_buf();
            tracing::info!(killfile = %path.display(), "watching for killfile");
            match ThreadWorker::spawn("killfile", move || {
                watch_killfile(&*flag, Some(path.as_path()), timings.killfile_poll)
            }) {
                Ok(worker) => crew.monitor = Some(worker),
                Err(source) => return Err((crew, SupervisorError::Thread { name: "killfile", source })),
            }
        }

        Ok(crew)
    }

    /// Tick until the duration elapses, the flag is raised, or the operator
    /// interrupts. Sleeps are clamped to the deadline so a bounded run never
    /// overshoots it by a full tick.
    fn supervise(&self, stop: &SharedFlag, started: Instant) -> Trigger {
        // A duration too large to represent as an instant never elapses.
        let deadline = self.config.duration().and_then(|d| started.checked_add(d));
        let tick = self.config.timings().supervisor_tick;

        loop {
            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    stop.set();
                    return Trigger::Deadline;
                }
            }
            if stop.is_set() {
                return Trigger::Flag;
            }
            if self.interrupt.is_set() {
                tracing::warn!("interrupted, stopping run");
                stop.set();
                return Trigger::Interrupt;
            }

            let nap = match deadline {
                Some(deadline) => tick.min(deadline.saturating_duration_since(now)),
                None => tick,
            };
            thread::sleep(nap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use std::path::PathBuf;

    fn fast_timings() -> Timings {
        Timings {
            supervisor_tick: Duration::from_millis(50),
            killfile_poll: Duration::from_millis(50),
            hold_poll: Duration::from_millis(50),
            ramp_pause: Duration::ZERO,
            cpu_drain: Duration::from_secs(5),
            memory_drain: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_duration_only_run_with_no_workers() {
        let config = RunConfig::new(0, 1, 0, None).unwrap();
        let mut supervisor = Supervisor::new(config);
        assert_eq!(supervisor.phase(), Phase::Configuring);

        let report = supervisor.run().unwrap();
        assert_eq!(supervisor.phase(), Phase::Terminated);
        assert_eq!(report.reason, StopReason::DurationElapsed);
        assert_eq!(report.load_workers, 0);
        assert!(report.memory.is_none());
        assert!(report.forced.is_empty());
        assert!(report.elapsed >= Duration::from_secs(1));
        assert!(report.elapsed < Duration::from_millis(1500));
    }

    #[test]
    fn test_killfile_stops_unbounded_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stop.flag");
        let config = RunConfig::new(3, 0, 0, Some(path.clone()))
            .unwrap()
            .with_timings(fast_timings());

        let creator_path = path.clone();
        let creator = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            std::fs::write(&creator_path, "stop").unwrap();
        });

        let report = Supervisor::new(config).run().unwrap();
        creator.join().unwrap();

        assert_eq!(report.reason, StopReason::Killfile);
        assert_eq!(report.load_workers, 3);
        assert!(report.forced.is_empty(), "forced: {:?}", report.forced);
        assert!(report.failed.is_empty(), "failed: {:?}", report.failed);
        assert!(report.elapsed >= Duration::from_millis(300));
        assert!(report.elapsed < Duration::from_secs(3));
        assert!(path.exists());
    }

    #[test]
    fn test_killfile_wins_over_long_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stop.flag");
        std::fs::write(&path, "").unwrap();
        let config = RunConfig::new(1, 3600, 0, Some(path))
            .unwrap()
            .with_timings(fast_timings());

        let report = Supervisor::new(config).run().unwrap();
        assert_eq!(report.reason, StopReason::Killfile);
        assert!(report.elapsed < Duration::from_secs(3));
    }

    #[test]
    fn test_interrupt_stops_run_gracefully() {
        let interrupt = LocalFlag::default();
        interrupt.set();
        let config = RunConfig::new(2, 0, 0, None)
            .unwrap()
            .with_timings(fast_timings());

        let report = Supervisor::new(config)
            .with_interrupt(interrupt)
            .run()
            .unwrap();
        assert_eq!(report.reason, StopReason::Interrupted);
        assert_eq!(report.load_workers, 2);
        assert!(report.forced.is_empty());
        assert!(report.to_string().contains("interrupted by operator"));
    }

    #[test]
    fn test_memory_worker_reports_held_allocation() {
        let config = RunConfig::new(0, 1, 25, None)
            .unwrap()
            .with_timings(fast_timings());

        let report = Supervisor::new(config).run().unwrap();
        let memory = report.memory.as_ref().expect("memory worker should report");
        assert!(matches!(memory.outcome, MemoryOutcome::Held));
        assert_eq!(memory.peak_bytes, 25 * MIB);
        assert_eq!(memory.chunks, 3);
        assert!(report.to_string().contains("memory peak 25 MiB"));
    }

    #[test]
    fn test_unrepresentable_duration_runs_until_interrupted() {
        let interrupt = LocalFlag::default();
        interrupt.set();
        let config = RunConfig::new(0, i64::MAX, 0, None)
            .unwrap()
            .with_timings(fast_timings());

        let report = Supervisor::new(config)
            .with_interrupt(interrupt)
            .run()
            .unwrap();
        assert_eq!(report.reason, StopReason::Interrupted);
        assert!(report.elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_missing_killfile_leaves_duration_in_charge() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("absent.flag");
        let config = RunConfig::new(0, 1, 0, Some(path))
            .unwrap()
            .with_timings(fast_timings());

        let report = Supervisor::new(config).run().unwrap();
        assert_eq!(report.reason, StopReason::DurationElapsed);
    }

    #[test]
    fn test_drain_kills_workers_that_ignore_stop() {
        let mut crew = Crew::default();
        crew.load.push(
            ProcessWorker::spawn("stubborn", || loop {
                thread::sleep(Duration::from_millis(20));
            })
            .unwrap(),
        );
        crew.memory = Some(
            ThreadWorker::spawn("memory", || {
                thread::sleep(Duration::from_secs(3));
                MemoryReport {
                    target_bytes: 0,
                    peak_bytes: 0,
                    chunks: 0,
                    outcome: MemoryOutcome::Aborted,
                }
            })
            .unwrap(),
        );

        let start = Instant::now();
        let drained = crew.drain(Duration::from_millis(300), Duration::from_millis(200));
        let took = start.elapsed();

        assert_eq!(drained.forced, vec!["stubborn".to_string(), "memory".to_string()]);
        assert!(drained.memory.is_none());
        assert!(took >= Duration::from_millis(300));
        assert!(took < Duration::from_secs(1));
    }

    #[test]
    fn test_report_display_lists_forced_workers() {
        let report = RunReport {
            reason: StopReason::DurationElapsed,
            elapsed: Duration::from_millis(1200),
            load_workers: 2,
            forced: vec!["cpu-2".to_string()],
            failed: Vec::new(),
            memory: None,
        };
        assert_eq!(
            report.to_string(),
            "run stopped after 1.2s (duration elapsed); 2 load worker(s), forced termination: cpu-2"
        );
    }
}
