use std::collections::TryReserveError;
use std::thread;
use std::time::Duration;

use sysinfo::System;
use thiserror::Error;

use crate::stop_signal::StopSignal;

pub const MIB: usize = 1024 * 1024;

/// Ramp step size in MiB.
pub const CHUNK_MB: usize = 10;

/// The allocator refused a chunk. Fatal to the memory worker only.
#[derive(Debug, Clone, Error)]
#[error("could not allocate a {requested_mb} MiB chunk while holding {held_mb} MiB: {source}")]
pub struct AllocationFailure {
    pub requested_mb: usize,
    pub held_mb: usize,
    #[source]
    pub source: TryReserveError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySettings {
    pub chunk_mb: usize,
    /// Pause between full chunks during the ramp.
    pub ramp_pause: Duration,
    /// Stop-flag poll interval while holding.
    pub hold_poll: Duration,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            chunk_mb: CHUNK_MB,
            ramp_pause: Duration::from_millis(100),
            hold_poll: Duration::from_secs(1),
        }
    }
}

/// Chunk sizes in MiB for a ramp to `target_mb`: full chunks, then the remainder.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    full_chunks: usize,
    chunk_mb: usize,
    remainder_mb: usize,
}

impl ChunkPlan {
    pub fn new(target_mb: usize, chunk_mb: usize) -> Self {
        let chunk_mb = chunk_mb.max(1);
        Self {
            full_chunks: target_mb / chunk_mb,
            chunk_mb,
            remainder_mb: target_mb % chunk_mb,
        }
    }
}

impl Iterator for ChunkPlan {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.full_chunks > 0 {
            self.full_chunks -= 1;
            Some(self.chunk_mb)
        } else if self.remainder_mb > 0 {
            Some(std::mem::take(&mut self.remainder_mb))
        } else {
            None
        }
    }
}

/// Chunks held by the memory worker. Grows only; everything is released
/// together when the ledger is dropped.
struct AllocationLedger {
    chunks: Vec<Vec<u8>>,
    held: usize,
    limit: usize,
}

impl AllocationLedger {
    fn new(limit: usize) -> Self {
        Self {
            chunks: Vec::new(),
            held: 0,
            limit,
        }
    }

    /// Allocate and touch a chunk of `bytes`. Writing the chunk makes the
    /// pages resident instead of lazily mapped.
    fn allocate(&mut self, bytes: usize) -> Result<(), AllocationFailure> {
        debug_assert!(self.held + bytes <= self.limit);

        let held_mb = self.held / MIB;
        let fail = move |source: TryReserveError| AllocationFailure {
            requested_mb: bytes / MIB,
            held_mb,
            source,
        };
        self.chunks.try_reserve(1).map_err(fail)?;
        let mut chunk = Vec::new();
        chunk.try_reserve_exact(bytes).map_err(fail)?;
        chunk.resize(bytes, 0u8);

        self.chunks.push(chunk);
        self.held += bytes;
        Ok(())
    }

    fn held(&self) -> usize {
        self.held
    }

    /// Consume the ledger, freeing every chunk.
    fn release(self, outcome: MemoryOutcome) -> MemoryReport {
        MemoryReport {
            target_bytes: self.limit,
            peak_bytes: self.held,
            chunks: self.chunks.len(),
            outcome,
        }
    }
}

#[derive(Debug)]
pub enum MemoryOutcome {
    /// Reached the target and held it until stopped.
    Held,
    /// Stop was requested before the ramp finished.
    Aborted,
    Failed(AllocationFailure),
}

/// What the memory worker did. Carries no reference to the allocation.
#[derive(Debug)]
pub struct MemoryReport {
    pub target_bytes: usize,
    pub peak_bytes: usize,
    pub chunks: usize,
    pub outcome: MemoryOutcome,
}

/// Ramp an allocation up to `target_mb` MiB and hold it until `stop` is set.
pub fn stress_memory<S: StopSignal + ?Sized>(
    stop: &S,
    target_mb: usize,
    settings: &MemorySettings,
) -> MemoryReport {
    let mut ledger = AllocationLedger::new(target_mb * MIB);
    let mut plan = ChunkPlan::new(target_mb, settings.chunk_mb).peekable();
    tracing::info!(target_mb, chunk_mb = settings.chunk_mb, "allocating memory");

    while let Some(chunk_mb) = plan.next() {
        if stop.is_set() {
            tracing::info!(held_mb = ledger.held() / MIB, "stop requested during ramp");
            return ledger.release(MemoryOutcome::Aborted);
        }
        if let Err(failure) = ledger.allocate(chunk_mb * MIB) {
            tracing::warn!(error = %failure, "memory allocation failed");
            return ledger.release(MemoryOutcome::Failed(failure));
        }
        tracing::debug!(held_mb = ledger.held() / MIB, "chunk allocated");

        if plan.peek().is_some() {
            thread::sleep(settings.ramp_pause);
        }
    }

    tracing::info!(held_mb = ledger.held() / MIB, "memory allocated, holding until stopped");
    while !stop.is_set() {
        thread::sleep(settings.hold_poll);
    }
    ledger.release(MemoryOutcome::Held)
}

/// Log host memory totals, in MiB.
pub fn check_memory_usage(label: &str) {
    let mut sys = System::new();
    sys.refresh_memory();

    tracing::info!(
        total_mb = sys.total_memory() / MIB as u64,
        used_mb = sys.used_memory() / MIB as u64,
        "host memory {label}"
    );
}
