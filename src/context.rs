//! Application-facing mining context
//!
//! Ties the stratum client to a miner: owns the receive-loop thread, the
//! miner thread and the bridge thread that moves pool jobs into the miner.

use crate::miner::{Miner, MinerStats, SubmitWorkFn};
use crate::solver::{CycleSearch, DeviceInfo};
use crate::stratum::Client;
use crate::utils;
use crate::work::Work;
use crate::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How often the bridge thread polls the client for a new job
const BRIDGE_POLL: Duration = Duration::from_millis(50);

/// Stratum client, miner and the threads running them
pub struct Context {
    client: Arc<Client>,
    solver: Arc<dyn CycleSearch>,
    miner: Mutex<Option<Arc<Miner>>>,
    submit: Mutex<Option<SubmitWorkFn>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Context {
    pub fn new(solver: Arc<dyn CycleSearch>) -> Self {
        Self::with_client(Arc::new(Client::new()), solver)
    }

    /// Build around an existing client, e.g. one with a custom reconnect policy
    pub fn with_client(client: Arc<Client>, solver: Arc<dyn CycleSearch>) -> Self {
        Self {
            client,
            solver,
            miner: Mutex::new(None),
            submit: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn set_agent(&self, software: &str, version: &str) {
        self.client.set_agent(software, version);
    }

    /// Connect, subscribe and authorize; shares found afterwards go to this pool
    pub fn connect_stratum(&self, url: &str, user: &str, pass: &str) -> bool {
        let result = self
            .client
            .connect(url, user, pass)
            .and_then(|_| self.client.subscribe())
            .and_then(|_| self.client.authorize());

        match result {
            Ok(()) => {
                let client = Arc::clone(&self.client);
                let submit: SubmitWorkFn = Arc::new(move |work: &Work| client.submit_work(work));
                *self.submit.lock() = Some(submit);
                true
            }
            Err(e) => {
                error!(url = %url, error = %e, "Could not connect to pool");
                self.client.disconnect();
                false
            }
        }
    }

    /// Register a failover pool
    pub fn add_pool(&self, url: &str) -> Result<()> {
        self.client.add_pool(url)
    }

    pub fn disconnect_stratum(&self) {
        self.client.disconnect();
    }

    pub fn is_stratum_connected(&self) -> bool {
        self.client.connected()
    }

    /// Start the receive loop on its own thread
    ///
    /// If the loop is already running it is asked to stop and false is
    /// returned.
    pub fn run_stratum(&self) -> bool {
        if self.client.running() {
            self.client.stop();
            return false;
        }

        let client = Arc::clone(&self.client);
        self.spawn("stratum", move || {
            client.run();
            client.disconnect();
        })
    }

    pub fn stop_stratum(&self) {
        self.client.stop();
    }

    /// Create a miner and start it together with the job bridge
    ///
    /// If a miner is already running it is asked to stop and false is
    /// returned.
    pub fn run_miner(&self, workers: usize, threads_per_worker: usize, gpu_devices: Vec<usize>) -> bool {
        if let Some(miner) = self.miner.lock().as_ref() {
            if miner.running() {
                miner.stop();
                return false;
            }
        }

        let submit = self.submit.lock().clone().unwrap_or_else(|| {
            Arc::new(|work: &Work| {
                warn!(job_id = %work.job_id, "Share found without a pool connection")
            })
        });

        let miner = match Miner::new(
            workers,
            threads_per_worker,
            gpu_devices,
            submit,
            Arc::clone(&self.solver),
        ) {
            Ok(miner) => Arc::new(miner),
            Err(e) => {
                error!(error = %e, "Could not create miner");
                return false;
            }
        };
        *self.miner.lock() = Some(Arc::clone(&miner));

        let finished = Arc::new(AtomicBool::new(false));

        let runner = Arc::clone(&miner);
        let runner_done = Arc::clone(&finished);
        if !self.spawn("miner", move || {
            runner.run();
            runner_done.store(true, Ordering::Release);
        }) {
            return false;
        }

        let client = Arc::clone(&self.client);
        self.spawn("job-bridge", move || {
            bridge_jobs(&client, &miner, &finished);
        })
    }

    pub fn stop_miner(&self) {
        if let Some(miner) = self.miner.lock().as_ref() {
            miner.stop();
        }
    }

    pub fn is_stratum_running(&self) -> bool {
        self.client.running()
    }

    pub fn is_stratum_stopping(&self) -> bool {
        self.client.stopping()
    }

    pub fn is_miner_running(&self) -> bool {
        self.miner.lock().as_ref().map_or(false, |m| m.running())
    }

    pub fn is_miner_stopping(&self) -> bool {
        self.miner.lock().as_ref().map_or(false, |m| m.stopping())
    }

    /// Stats of the current miner, if one was started
    pub fn get_miner_stats(&self) -> Option<MinerStats> {
        self.miner.lock().as_ref().map(|m| m.snapshot())
    }

    /// Wait for every thread started so far
    pub fn join(&self) {
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "Thread panicked");
            } else {
                debug!(thread = %name, "Thread joined");
            }
        }
    }

    pub fn number_of_cores(&self) -> usize {
        utils::number_of_cores()
    }

    pub fn gpus_info(&self) -> Vec<DeviceInfo> {
        self.solver.devices()
    }

    fn spawn(&self, name: &str, body: impl FnOnce() + Send + 'static) -> bool {
        match std::thread::Builder::new().name(name.to_string()).spawn(body) {
            Ok(handle) => {
                self.threads.lock().push(handle);
                true
            }
            Err(e) => {
                error!(thread = %name, error = %e, "Could not spawn thread");
                false
            }
        }
    }
}

/// Feed pool jobs into the miner until the miner has finished
fn bridge_jobs(client: &Client, miner: &Miner, finished: &AtomicBool) {
    info!("Job bridge started");
    while !finished.load(Ordering::Acquire) {
        if miner.running() {
            if client.connected() {
                if let Some(job) = client.get_job() {
                    if let Err(e) = miner.submit_job(&job) {
                        warn!(job_id = %job.id, error = %e, "Dropping job");
                    }
                }
            } else if miner.next_work().is_some() {
                debug!("Pool disconnected, clearing work");
                miner.clear_job();
            }
        }
        std::thread::sleep(BRIDGE_POLL);
    }
    info!("Job bridge stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::SimulationSolver;

    #[test]
    fn test_connect_failure_returns_false() {
        let context = Context::new(Arc::new(SimulationSolver::new(0.0)));
        assert!(!context.connect_stratum("stratum+tcp://127.0.0.1:1", "u", "p"));
        assert!(!context.is_stratum_connected());
    }

    #[test]
    fn test_miner_lifecycle_without_pool() {
        let context = Context::new(Arc::new(SimulationSolver::new(0.0)));
        assert!(context.get_miner_stats().is_none());
        assert!(context.run_miner(1, 1, vec![]));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !context.is_miner_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(context.is_miner_running());

        context.stop_miner();
        context.join();
        assert!(!context.is_miner_running());
        assert!(context.get_miner_stats().is_some());
    }

    #[test]
    fn test_gpus_info_from_solver() {
        let context = Context::new(Arc::new(SimulationSolver::new(0.0).with_devices(3)));
        assert_eq!(context.gpus_info().len(), 3);
        assert!(context.number_of_cores() >= 1);
    }
}
