//! CPU search entry point

use crate::miner::Miner;
use crate::types::{Cycle, PROOF_SIZE};
use crate::work::Work;
use crate::Result;
use tracing::trace;

/// Search the graph keyed by the work's header hash
///
/// The solver may spread over `threads` tasks of the miner's pool, whose
/// size already reserves those slots.
pub fn search(miner: &Miner, work: &Work, threads: usize) -> Result<Vec<Cycle>> {
    let header_hash = work.header_hash_hex();
    trace!(nonce = work.nonce(), hash = %header_hash, "CPU search");

    miner
        .solver()
        .find_cycles(&header_hash, work.edge_bits(), PROOF_SIZE, threads, miner.pool())
}
