use std::hint::black_box;
use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::stop_signal::StopSignal;

/// Busy-work iterations per cycle. The stop flag is checked once per cycle.
pub const DEFAULT_BATCH: usize = 20_000;

/// Shape of a single CPU load worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSettings {
    pub batch: usize,
    /// Sleep for `throttle_pause` after every this many cycles. 0 disables.
    pub throttle_every: u64,
    pub throttle_pause: Duration,
    /// Offset fed into the kernel so workers don't run in lockstep.
    pub phase: f64,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            batch: DEFAULT_BATCH,
            throttle_every: 10,
            throttle_pause: Duration::from_millis(10),
            phase: 0.0,
        }
    }
}

impl LoadSettings {
    pub fn with_random_phase(self) -> Self {
        Self {
            phase: rand::rng().random_range(0.0..1.0),
            ..self
        }
    }
}

/// Simulate high CPU load until `stop` is set. Returns the number of cycles run.
///
/// Safe to call in a forked child: no allocation, no locks, no I/O.
pub fn stress_cpu<S: StopSignal + ?Sized>(stop: &S, settings: &LoadSettings) -> u64 {
    let mut cycles = 0u64;
    while !stop.is_set() {
        black_box(burn(settings.batch, settings.phase));
        cycles += 1;

        if settings.throttle_every > 0 && cycles % settings.throttle_every == 0 {
            thread::sleep(settings.throttle_pause);
        }
    }
    cycles
}

fn burn(iterations: usize, phase: f64) -> f64 {
    (0..iterations).fold(0.0, |acc, i| {
        let x = i as f64 + phase;
        acc + x.sin() * x.sqrt().cos()
    })
}
