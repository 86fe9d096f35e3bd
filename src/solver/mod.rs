//! Cycle-search collaborators
//!
//! The miner does not trim graphs itself. Workers hand a header hash (CPU) or
//! a derived key pair (GPU) to a [`CycleSearch`] implementation and get back
//! the candidate cycles it found.

pub mod external;
pub mod simulation;

pub use external::ExternalSolver;
pub use simulation::SimulationSolver;

use crate::types::Cycle;
use crate::Result;
use serde::{Deserialize, Serialize};

/// GPU description used for sizing and reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: usize,
    /// Bytes of device memory
    pub total_memory: u64,
    pub title: String,
    pub temperature: u32,
    pub gpu_util: u32,
    pub memory_util: u32,
    pub fan_speed: u32,
}

/// Finds cycles of a given length in the graph keyed by a header
pub trait CycleSearch: Send + Sync {
    /// CPU search over the graph of `header_hash_hex`, allowed to fan out
    /// over `threads` tasks of `pool`
    fn find_cycles(
        &self,
        header_hash_hex: &str,
        edge_bits: u8,
        proof_size: usize,
        threads: usize,
        pool: &rayon::ThreadPool,
    ) -> Result<Vec<Cycle>>;

    /// GPU search on `device` over the graph keyed by `key0`/`key1`
    fn find_cycles_on_device(
        &self,
        key0: u64,
        key1: u64,
        edge_bits: u8,
        proof_size: usize,
        device: usize,
    ) -> Result<Vec<Cycle>>;

    /// Devices this solver can use
    fn devices(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }

    /// Free memory on `device` in bytes, when known
    fn free_memory(&self, _device: usize) -> Option<u64> {
        None
    }
}

/// Solver implementations selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    /// Deterministic pseudo-solver for dry runs
    Simulation,
    /// Solver binary run as a subprocess
    External,
}

impl std::fmt::Display for SolverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolverKind::Simulation => write!(f, "simulation"),
            SolverKind::External => write!(f, "external"),
        }
    }
}
