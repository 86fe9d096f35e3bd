//! GPU search entry point
//!
//! Device solvers take a 128-bit key derived from the header hash instead of
//! the hash itself.

use crate::crypto;
use crate::miner::Miner;
use crate::solver::CycleSearch;
use crate::types::{Cycle, PROOF_SIZE};
use crate::work::Work;
use crate::Result;
use tracing::{info, trace};

pub fn search(miner: &Miner, work: &Work, device: usize) -> Result<Vec<Cycle>> {
    let (key0, key1) = crypto::derive_device_keys(&work.header_hash_hex());
    trace!(nonce = work.nonce(), key0, key1, device, "GPU search");

    miner
        .solver()
        .find_cycles_on_device(key0, key1, work.edge_bits(), PROOF_SIZE, device)
}

/// Log what the solver knows about `device`
pub fn log_device(solver: &dyn CycleSearch, device: usize) {
    let title = solver
        .devices()
        .into_iter()
        .find(|d| d.id == device)
        .map(|d| d.title)
        .unwrap_or_else(|| "unknown device".to_string());

    match solver.free_memory(device) {
        Some(free) => info!(device, title = %title, free_mb = free >> 20, "Using GPU"),
        None => info!(device, title = %title, "Using GPU"),
    }
}
