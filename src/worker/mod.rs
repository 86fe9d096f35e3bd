//! Mining workers
//!
//! One worker per pool slot. Each owns a slice of the nonce space, grinds
//! the miner's current work through the cycle-search collaborator and checks
//! every returned cycle against the target.

pub mod cpu;
pub mod gpu;

use crate::crypto;
use crate::miner::Miner;
use crate::types::{Cycle, NonceRange, PROOF_SIZE};
use crate::work::Work;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn};

/// Nonces kept free at the top of each worker's slice
pub const NONCE_MARGIN: u32 = 8;

/// Back-off while there is no work or the slice is exhausted
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Execution strategy of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Searches on the CPU with this many helper tasks in the miner's pool
    Cpu { threads: usize },
    /// Searches on one GPU
    Gpu { device: usize },
}

/// One search slot of the miner
#[derive(Debug, Clone)]
pub struct Worker {
    id: usize,
    total: usize,
    kind: WorkerKind,
}

impl Worker {
    /// Worker `id` of `total`, which sets its nonce slice
    pub fn new(id: usize, total: usize, kind: WorkerKind) -> Self {
        Self { id, total, kind }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            WorkerKind::Cpu { .. } => "cpu",
            WorkerKind::Gpu { .. } => "gpu",
        }
    }

    pub fn nonce_range(&self) -> NonceRange {
        NonceRange::partition(self.id, self.total, NONCE_MARGIN)
    }

    /// Search loop; returns when the miner stops or the solver fails
    pub fn run(&self, miner: &Miner) -> Result<()> {
        let span = info_span!("worker", id = self.id, kind = self.label());
        let _enter = span.enter();

        let range = self.nonce_range();
        if let WorkerKind::Gpu { device } = self.kind {
            gpu::log_device(miner.solver(), device);
        }
        info!(start = range.start, limit = range.limit, "Worker started");

        let mut previous: Option<Arc<Work>> = None;
        let mut nonce = u64::from(range.start);

        while miner.running() {
            let Some(shared) = miner.next_work() else {
                std::thread::sleep(IDLE_SLEEP);
                continue;
            };

            let new_job = previous
                .as_ref()
                .map_or(true, |prev| !prev.same_job(&shared));
            if new_job {
                debug!(job_id = %shared.job_id, "Worker switching job");
                nonce = u64::from(range.start);
                previous = Some(Arc::clone(&shared));
            } else {
                nonce += 1;
            }

            if !range.can_search(nonce) {
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }

            let mut work = Work::clone(&shared);
            work.set_nonce(nonce as u32);

            let cycles = match self.kind {
                WorkerKind::Cpu { threads } => cpu::search(miner, &work, threads)?,
                WorkerKind::Gpu { device } => gpu::search(miner, &work, device)?,
            };
            miner.record_attempt();

            for cycle in &cycles {
                self.check_cycle(miner, &mut work, cycle)?;
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    /// Count a candidate cycle and submit it when its hash meets the target
    fn check_cycle(&self, miner: &Miner, work: &mut Work, cycle: &Cycle) -> Result<()> {
        if cycle.len() != PROOF_SIZE {
            warn!(edges = cycle.len(), "Skipping cycle of wrong length");
            return Ok(());
        }

        let hash = crypto::cycle_hash(cycle);
        miner.record_cycle();

        if work.target.is_met_by(&hash) {
            work.set_cycle(cycle)?;
            miner.record_share();
            info!(job_id = %work.job_id, nonce = work.nonce(), "Found share");
            miner.submit_work(work);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ranges_follow_index() {
        let first = Worker::new(0, 4, WorkerKind::Cpu { threads: 1 });
        let last = Worker::new(3, 4, WorkerKind::Gpu { device: 0 });

        assert_eq!(first.nonce_range().start, 0);
        assert_eq!(last.nonce_range().end, u32::MAX);
        assert_eq!(
            first.nonce_range().end + 1,
            Worker::new(1, 4, WorkerKind::Cpu { threads: 1 }).nonce_range().start
        );
    }

    #[test]
    fn test_labels() {
        assert_eq!(Worker::new(0, 1, WorkerKind::Cpu { threads: 2 }).label(), "cpu");
        assert_eq!(Worker::new(0, 1, WorkerKind::Gpu { device: 1 }).label(), "gpu");
    }
}
