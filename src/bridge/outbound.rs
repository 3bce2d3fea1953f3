//! Demand-driven writes into the filter's stdin.
//!
//! Retry policy: one non-blocking attempt per demand. Whatever the pipe
//! does not take is rejected, counted and reported back to the caller;
//! nothing is queued and nothing spins. The sink endpoint drops rejected
//! bytes, trading completeness for never stalling the PipeWire data thread.

use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::chunk::{WriteOutcome, write_to};
use super::fault::FaultReporter;

/// Counters shared between the data thread and teardown.
#[derive(Debug, Default)]
pub struct OutboundStats {
    demands: AtomicU64,
    written: AtomicU64,
    rejected: AtomicU64,
    would_block: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutboundSnapshot {
    pub demands: u64,
    pub written: u64,
    pub rejected: u64,
    pub would_block: u64,
}

impl OutboundStats {
    pub fn snapshot(&self) -> OutboundSnapshot {
        OutboundSnapshot {
            demands: self.demands.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            would_block: self.would_block.load(Ordering::Relaxed),
        }
    }
}

/// Borrows audio from the caller for exactly one write.
pub struct OutboundWriter {
    pipe: Arc<File>,
    faults: Arc<FaultReporter>,
    stats: Arc<OutboundStats>,
}

impl OutboundWriter {
    pub fn new(pipe: Arc<File>, faults: Arc<FaultReporter>) -> Self {
        Self {
            pipe,
            faults,
            stats: Arc::new(OutboundStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<OutboundStats> {
        self.stats.clone()
    }

    /// Offer `bytes` to the filter. Never blocks.
    ///
    /// Returns the number of bytes *not* accepted. A hard error (for
    /// instance `EPIPE` once the filter died) is reported through the
    /// fault latch and every later call rejects its input outright.
    pub fn write(&self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return 0;
        }
        let offered = bytes.len();
        if self.faults.is_tripped() {
            self.stats.rejected.fetch_add(offered as u64, Ordering::Relaxed);
            return offered;
        }
        self.stats.demands.fetch_add(1, Ordering::Relaxed);

        let mut pipe: &File = &self.pipe;
        let accepted = match write_to(&mut pipe, bytes) {
            Ok(WriteOutcome::Written(n)) => n,
            Ok(WriteOutcome::WouldBlock) => {
                self.stats.would_block.fetch_add(1, Ordering::Relaxed);
                0
            }
            Err(e) => {
                self.faults.report(e);
                0
            }
        };

        let rejected = offered - accepted;
        self.stats.written.fetch_add(accepted as u64, Ordering::Relaxed);
        if rejected > 0 {
            self.stats.rejected.fetch_add(rejected as u64, Ordering::Relaxed);
        }
        rejected
    }
}
