//! Simulated cycle search for testing and dry runs
//!
//! Produces random cycles without building a graph. Results are a pure
//! function of the header hash (or device keys), so a given header always
//! yields the same answer.

use super::{CycleSearch, DeviceInfo};
use crate::types::Cycle;
use crate::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::info;

/// Spacing between the seeds of parallel draw tasks
const TASK_SEED_STEP: u64 = 0x9e37_79b9_7f4a_7c15;

/// Pseudo-solver that "finds" a cycle with a fixed probability per search
pub struct SimulationSolver {
    probability: f64,
    attempt_delay: Duration,
    devices: Vec<DeviceInfo>,
}

impl SimulationSolver {
    /// Create a solver that finds a cycle in `probability` of searches
    pub fn new(probability: f64) -> Self {
        info!("Creating simulation solver with cycle probability {:.3}", probability);
        Self {
            probability: if probability.is_nan() { 0.0 } else { probability.clamp(0.0, 1.0) },
            attempt_delay: Duration::ZERO,
            devices: Vec::new(),
        }
    }

    /// Sleep this long per search to mimic solver latency
    pub fn with_attempt_delay(mut self, delay: Duration) -> Self {
        self.attempt_delay = delay;
        self
    }

    /// Report `count` fake GPUs
    pub fn with_devices(mut self, count: usize) -> Self {
        self.devices = (0..count)
            .map(|id| DeviceInfo {
                id,
                total_memory: 8 << 30,
                title: format!("Simulated GPU {}", id),
                temperature: 60,
                gpu_util: 0,
                memory_util: 0,
                fan_speed: 40,
            })
            .collect();
        self
    }

    /// Decide whether the graph of `seed` holds a cycle; on a hit returns
    /// the generator to draw its edges from
    fn roll(&self, seed: u64, edge_bits: u8, proof_size: usize) -> Result<Option<(StdRng, u64)>> {
        if edge_bits == 0 || edge_bits > 32 {
            return Err(Error::solver(format!("unsupported edge bits {}", edge_bits)));
        }
        let edges = 1u64 << edge_bits;
        if (proof_size as u64) > edges {
            return Err(Error::solver(format!(
                "graph with {} edges cannot hold a {}-cycle",
                edges, proof_size
            )));
        }

        if !self.attempt_delay.is_zero() {
            std::thread::sleep(self.attempt_delay);
        }

        let mut rng = StdRng::seed_from_u64(seed);
        if !rng.random_bool(self.probability) {
            return Ok(None);
        }
        Ok(Some((rng, edges)))
    }
}

/// Draw candidate edges on up to `threads` tasks of `pool`
///
/// Each task gets its own generator seeded from `seed` and its index, so
/// the result does not depend on scheduling.
fn spread_draw(
    seed: u64,
    edges: u64,
    proof_size: usize,
    threads: usize,
    pool: &rayon::ThreadPool,
) -> Vec<u32> {
    let tasks = threads.clamp(1, proof_size.max(1));
    let mut parts: Vec<Vec<u32>> = vec![Vec::new(); tasks];

    pool.scope(|scope| {
        for (task, part) in parts.iter_mut().enumerate() {
            scope.spawn(move |_| {
                let quota = proof_size * (task + 1) / tasks - proof_size * task / tasks;
                let mut rng = StdRng::seed_from_u64(seed ^ (task as u64 + 1).wrapping_mul(TASK_SEED_STEP));
                *part = (0..quota).map(|_| rng.random_range(0..edges) as u32).collect();
            });
        }
    });

    parts.concat()
}

/// Fill `chosen` up to `proof_size` distinct edges and build the cycle
fn complete(mut chosen: BTreeSet<u32>, rng: &mut StdRng, edges: u64, proof_size: usize) -> Cycle {
    while chosen.len() < proof_size {
        chosen.insert(rng.random_range(0..edges) as u32);
    }
    Cycle::new(chosen.into_iter().collect())
}

impl CycleSearch for SimulationSolver {
    fn find_cycles(
        &self,
        header_hash_hex: &str,
        edge_bits: u8,
        proof_size: usize,
        threads: usize,
        pool: &rayon::ThreadPool,
    ) -> Result<Vec<Cycle>> {
        let hash = hex::decode(header_hash_hex)?;
        let mut seed = [0u8; 8];
        for (dst, src) in seed.iter_mut().zip(&hash) {
            *dst = *src;
        }

        let Some((mut rng, edges)) = self.roll(u64::from_le_bytes(seed), edge_bits, proof_size)? else {
            return Ok(Vec::new());
        };
        let task_seed = rng.random::<u64>();
        let drawn: BTreeSet<u32> = spread_draw(task_seed, edges, proof_size, threads, pool)
            .into_iter()
            .collect();
        Ok(vec![complete(drawn, &mut rng, edges, proof_size)])
    }

    fn find_cycles_on_device(
        &self,
        key0: u64,
        key1: u64,
        edge_bits: u8,
        proof_size: usize,
        device: usize,
    ) -> Result<Vec<Cycle>> {
        if !self.devices.is_empty() && device >= self.devices.len() {
            return Err(Error::solver(format!("no simulated device {}", device)));
        }
        let seed = key0 ^ key1.rotate_left(17);
        Ok(match self.roll(seed, edge_bits, proof_size)? {
            Some((mut rng, edges)) => vec![complete(BTreeSet::new(), &mut rng, edges, proof_size)],
            None => Vec::new(),
        })
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }

    fn free_memory(&self, device: usize) -> Option<u64> {
        self.devices.get(device).map(|d| d.total_memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap()
    }

    #[test]
    fn test_always_finds_distinct_edges() {
        let solver = SimulationSolver::new(1.0);
        let cycles = solver.find_cycles(&"ab".repeat(32), 12, 42, 1, &pool()).unwrap();

        assert_eq!(cycles.len(), 1);
        let edges = cycles[0].edges();
        assert_eq!(edges.len(), 42);
        assert!(edges.windows(2).all(|w| w[0] < w[1]));
        assert!(edges.iter().all(|e| *e < (1 << 12)));
    }

    #[test]
    fn test_never_finds_with_zero_probability() {
        let solver = SimulationSolver::new(0.0);
        assert!(solver.find_cycles("00ff", 20, 42, 1, &pool()).unwrap().is_empty());
    }

    #[test]
    fn test_same_header_same_answer() {
        let solver = SimulationSolver::new(0.5);
        let pool = pool();
        for i in 0..16u8 {
            let hash = hex::encode([i; 32]);
            assert_eq!(
                solver.find_cycles(&hash, 16, 42, 1, &pool).unwrap(),
                solver.find_cycles(&hash, 16, 42, 1, &pool).unwrap()
            );
        }
    }

    #[test]
    fn test_spread_over_pool_is_stable() {
        let solver = SimulationSolver::new(1.0);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        let hash = "cd".repeat(32);

        let first = solver.find_cycles(&hash, 10, 42, 4, &pool).unwrap();
        for _ in 0..3 {
            assert_eq!(solver.find_cycles(&hash, 10, 42, 4, &pool).unwrap(), first);
        }
        let edges = first[0].edges();
        assert_eq!(edges.len(), 42);
        assert!(edges.windows(2).all(|w| w[0] < w[1]));

        // more threads than edges to draw still yields a full cycle
        let wide = solver.find_cycles(&hash, 6, 42, 64, &pool).unwrap();
        assert_eq!(wide[0].edges().len(), 42);
    }

    #[test]
    fn test_rejects_impossible_graph() {
        let solver = SimulationSolver::new(1.0);
        assert!(solver.find_cycles("00", 4, 42, 1, &pool()).is_err());
        assert!(solver.find_cycles("zz", 20, 42, 1, &pool()).is_err());
    }

    #[test]
    fn test_fake_devices() {
        let solver = SimulationSolver::new(1.0).with_devices(2);
        assert_eq!(solver.devices().len(), 2);
        assert_eq!(solver.free_memory(1), Some(8 << 30));
        assert_eq!(solver.free_memory(2), None);
        assert!(solver.find_cycles_on_device(1, 2, 16, 42, 1).is_ok());
        assert!(solver.find_cycles_on_device(1, 2, 16, 42, 5).is_err());
    }
}
