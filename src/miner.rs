//! Miner: shared work, worker pool and interval statistics
//!
//! The miner owns one rayon pool sized for every worker plus the helper
//! tasks CPU solvers fan out into. Workers read the current [`Work`] from a
//! replace-only cell and report attempts, cycles and shares back here.

use crate::solver::CycleSearch;
use crate::types::{RunFlag, RunState};
use crate::work::{work_from_job, Job, Work};
use crate::worker::{Worker, WorkerKind};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Completed intervals kept in the stats ring
pub const STATS_HISTORY: usize = 50;

/// Callback receiving every work whose cycle met the target
pub type SubmitWorkFn = Arc<dyn Fn(&Work) + Send + Sync>;

/// Counters for one aggregation interval
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub attempts: u64,
    pub cycles: u64,
    pub shares: u64,
}

impl Stat {
    fn open(start: DateTime<Utc>) -> Self {
        Self {
            start,
            end: None,
            attempts: 0,
            cycles: 0,
            shares: 0,
        }
    }

    /// Length of the interval; open intervals are measured up to now
    pub fn seconds(&self) -> f64 {
        let end = self.end.unwrap_or_else(Utc::now);
        (end - self.start).num_milliseconds().max(0) as f64 / 1000.0
    }

    pub fn attempts_per_second(&self) -> f64 {
        self.rate(self.attempts)
    }

    pub fn cycles_per_second(&self) -> f64 {
        self.rate(self.cycles)
    }

    pub fn shares_per_second(&self) -> f64 {
        self.rate(self.shares)
    }

    fn rate(&self, count: u64) -> f64 {
        let seconds = self.seconds();
        if count == 0 || seconds <= 0.0 {
            0.0
        } else {
            count as f64 / seconds
        }
    }

    fn fold(&mut self, other: &Stat) {
        self.attempts += other.attempts;
        self.cycles += other.cycles;
        self.shares += other.shares;
    }

    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            start: self.start,
            end: self.end,
            seconds: self.seconds(),
            attempts_per_second: self.attempts_per_second(),
            cycles_per_second: self.cycles_per_second(),
            shares_per_second: self.shares_per_second(),
            attempts: self.attempts,
            cycles: self.cycles,
            shares: self.shares,
        }
    }
}

impl Default for Stat {
    fn default() -> Self {
        Self::open(Utc::now())
    }
}

/// Plain-data view of a [`Stat`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub seconds: f64,
    pub attempts_per_second: f64,
    pub cycles_per_second: f64,
    pub shares_per_second: f64,
    pub attempts: u64,
    pub cycles: u64,
    pub shares: u64,
}

/// Everything the stats lock guards, copied out at once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerStats {
    pub total: StatSnapshot,
    pub current: StatSnapshot,
    /// Completed intervals, oldest first
    pub history: Vec<StatSnapshot>,
}

#[derive(Debug, Default)]
struct Stats {
    history: VecDeque<Stat>,
    current: Stat,
    /// Counters of all completed intervals
    total: Stat,
    started: bool,
}

impl Stats {
    /// Total including the open interval
    fn live_total(&self) -> Stat {
        let mut total = self.total.clone();
        total.fold(&self.current);
        total
    }
}

/// Worker pool grinding on the latest pool job
pub struct Miner {
    workers: Vec<Worker>,
    pool: rayon::ThreadPool,
    solver: Arc<dyn CycleSearch>,
    submit: SubmitWorkFn,
    work: Mutex<Option<Arc<Work>>>,
    stats: Mutex<Stats>,
    state: RunFlag,
}

impl Miner {
    /// Create a miner with `workers` CPU workers of `threads_per_worker`
    /// search threads each, plus one worker per GPU device
    pub fn new(
        workers: usize,
        threads_per_worker: usize,
        gpu_devices: Vec<usize>,
        submit: SubmitWorkFn,
        solver: Arc<dyn CycleSearch>,
    ) -> Result<Self> {
        let total = workers + gpu_devices.len();
        if total == 0 {
            return Err(Error::config("miner needs at least one CPU or GPU worker"));
        }
        let threads_per_worker = threads_per_worker.max(1);

        // every worker task holds a slot while its solver fans out, so
        // reserve the helper slots up front
        let pool_size = workers * threads_per_worker + workers + gpu_devices.len();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_size)
            .thread_name(|i| format!("miner-{}", i))
            .build()
            .map_err(|e| Error::worker("pool", e.to_string()))?;

        let workers: Vec<Worker> = (0..workers)
            .map(|_| WorkerKind::Cpu {
                threads: threads_per_worker,
            })
            .chain(gpu_devices.into_iter().map(|device| WorkerKind::Gpu { device }))
            .enumerate()
            .map(|(id, kind)| Worker::new(id, total, kind))
            .collect();

        info!(
            workers = workers.len(),
            pool_size, threads_per_worker, "Miner created"
        );

        Ok(Self {
            workers,
            pool,
            solver,
            submit,
            work: Mutex::new(None),
            stats: Mutex::new(Stats::default()),
            state: RunFlag::new(),
        })
    }

    /// Publish a new job to the workers
    pub fn submit_job(&self, job: &Job) -> Result<()> {
        let work = Arc::new(work_from_job(job)?);

        let same_job = {
            let mut cell = self.work.lock();
            let same = cell.as_ref().map_or(false, |prev| prev.same_job(&work));
            *cell = Some(work);
            same
        };

        let now = Utc::now();
        let mut stats = self.stats.lock();
        if !stats.started {
            stats.started = true;
            stats.total = Stat::open(now);
            stats.current = Stat::open(now);
        } else if !same_job {
            let mut closed = std::mem::replace(&mut stats.current, Stat::open(now));
            closed.end = Some(now);
            stats.total.fold(&closed);
            stats.history.push_back(closed);
            while stats.history.len() > STATS_HISTORY {
                stats.history.pop_front();
            }
        }
        debug!(job_id = %job.id, same_job, "Job submitted to miner");
        Ok(())
    }

    /// Forget the current work; workers idle until the next job
    pub fn clear_job(&self) {
        self.work.lock().take();
    }

    /// Run all workers until [`Miner::stop`]; false if already running
    pub fn run(&self) -> bool {
        if !self.state.start() {
            return false;
        }
        info!(workers = self.workers.len(), "Miner started");

        self.pool.scope(|scope| {
            for worker in &self.workers {
                scope.spawn(move |_| {
                    match panic::catch_unwind(AssertUnwindSafe(|| worker.run(self))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(
                            worker = worker.id(),
                            kind = worker.label(),
                            error = %e,
                            "Worker stopped with error"
                        ),
                        Err(_) => error!(worker = worker.id(), kind = worker.label(), "Worker panicked"),
                    }
                });
            }
        });

        self.state.finish();
        info!("Miner stopped");
        true
    }

    pub fn stop(&self) {
        if self.state.request_stop() {
            debug!("Miner stop requested");
        }
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub fn running(&self) -> bool {
        self.state.is_running()
    }

    pub fn stopping(&self) -> bool {
        self.state.is_stopping()
    }

    pub fn total_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Current shared work
    pub fn next_work(&self) -> Option<Arc<Work>> {
        self.work.lock().clone()
    }

    /// Completed intervals, oldest first
    pub fn stats(&self) -> Vec<StatSnapshot> {
        self.stats.lock().history.iter().map(Stat::snapshot).collect()
    }

    /// Totals since the first job, including the open interval
    pub fn total_stats(&self) -> StatSnapshot {
        self.stats.lock().live_total().snapshot()
    }

    pub fn current_stat(&self) -> StatSnapshot {
        self.stats.lock().current.snapshot()
    }

    /// Total, current and history under one lock
    pub fn snapshot(&self) -> MinerStats {
        let stats = self.stats.lock();
        MinerStats {
            total: stats.live_total().snapshot(),
            current: stats.current.snapshot(),
            history: stats.history.iter().map(Stat::snapshot).collect(),
        }
    }

    /// Hand a solved work to the submit callback
    pub fn submit_work(&self, work: &Work) {
        (self.submit)(work);
    }

    pub(crate) fn solver(&self) -> &dyn CycleSearch {
        self.solver.as_ref()
    }

    pub(crate) fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    pub(crate) fn record_attempt(&self) {
        self.stats.lock().current.attempts += 1;
    }

    pub(crate) fn record_cycle(&self) {
        self.stats.lock().current.cycles += 1;
    }

    pub(crate) fn record_share(&self) {
        self.stats.lock().current.shares += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::SimulationSolver;
    use crate::work::tests::sample_job;

    fn miner(workers: usize, gpus: Vec<usize>) -> Miner {
        Miner::new(
            workers,
            2,
            gpus,
            Arc::new(|_: &Work| {}),
            Arc::new(SimulationSolver::new(0.0)),
        )
        .unwrap()
    }

    #[test]
    fn test_worker_layout() {
        let miner = miner(2, vec![0, 3]);
        assert_eq!(miner.total_workers(), 4);
        assert_eq!(miner.pool().current_num_threads(), 2 * 2 + 2 + 2);

        let kinds: Vec<_> = miner.workers().iter().map(|w| w.kind()).collect();
        assert_eq!(kinds[1], WorkerKind::Cpu { threads: 2 });
        assert_eq!(kinds[3], WorkerKind::Gpu { device: 3 });
    }

    #[test]
    fn test_no_workers_rejected() {
        let result = Miner::new(
            0,
            1,
            vec![],
            Arc::new(|_: &Work| {}),
            Arc::new(SimulationSolver::new(0.0)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_first_job_opens_intervals() {
        let miner = miner(1, vec![]);
        miner.submit_job(&sample_job()).unwrap();

        assert!(miner.next_work().is_some());
        assert!(miner.stats().is_empty());
        assert_eq!(miner.current_stat().attempts, 0);
    }

    #[test]
    fn test_same_job_does_not_rotate() {
        let miner = miner(1, vec![]);
        let job = sample_job();
        miner.submit_job(&job).unwrap();
        miner.record_attempt();
        miner.submit_job(&job).unwrap();

        assert!(miner.stats().is_empty());
        assert_eq!(miner.current_stat().attempts, 1);
    }

    #[test]
    fn test_new_job_rotates_and_folds() {
        let miner = miner(1, vec![]);
        let mut job = sample_job();
        miner.submit_job(&job).unwrap();
        miner.record_attempt();
        miner.record_cycle();
        miner.record_share();

        job.time = [0, 0, 0, 9];
        miner.submit_job(&job).unwrap();
        miner.record_attempt();

        let history = miner.stats();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].attempts, 1);
        assert_eq!(history[0].shares, 1);
        assert!(history[0].end.is_some());

        let total = miner.total_stats();
        assert_eq!(total.attempts, 2);
        assert_eq!(total.cycles, 1);
        assert_eq!(miner.current_stat().attempts, 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let miner = miner(1, vec![]);
        let mut job = sample_job();
        for i in 0..(STATS_HISTORY as u32 + 10) {
            job.time = i.to_le_bytes();
            miner.submit_job(&job).unwrap();
        }
        assert_eq!(miner.stats().len(), STATS_HISTORY);
    }

    #[test]
    fn test_clear_job() {
        let miner = miner(1, vec![]);
        miner.submit_job(&sample_job()).unwrap();
        miner.clear_job();
        assert!(miner.next_work().is_none());
    }

    #[test]
    fn test_bad_job_keeps_work() {
        let miner = miner(1, vec![]);
        miner.submit_job(&sample_job()).unwrap();

        let mut bad = sample_job();
        bad.diff = 0.0;
        assert!(miner.submit_job(&bad).is_err());
        assert_eq!(miner.next_work().unwrap().job_id, "job-1");
    }

    #[test]
    fn test_stop_before_run_is_ignored() {
        let miner = miner(1, vec![]);
        miner.stop();
        assert_eq!(miner.state(), RunState::NotRunning);
    }

    #[test]
    fn test_empty_stat_rates() {
        let stat = Stat::default();
        assert_eq!(stat.attempts_per_second(), 0.0);
        assert_eq!(stat.shares_per_second(), 0.0);
    }
}
