//! Cycle search delegated to an external solver binary
//!
//! The configured command is run once per search with the search parameters
//! appended. It prints one cycle per line as comma-separated hex edge indices
//! and exits with status 0, printing nothing when no cycle was found.

use super::{CycleSearch, DeviceInfo};
use crate::types::Cycle;
use crate::{Error, Result};
use subprocess::{Exec, Redirection};
use tracing::{debug, info, warn};

/// Solver that shells out for every search
pub struct ExternalSolver {
    program: String,
    base_args: Vec<String>,
}

impl ExternalSolver {
    /// Create a solver from a command line such as `"cuckoo-solver --quiet"`
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::config("solver command is empty"))?;

        info!("Creating external solver with command: {}", command);
        Ok(Self {
            program,
            base_args: parts.collect(),
        })
    }

    fn run(&self, args: &[String]) -> Result<String> {
        let mut all_args = self.base_args.clone();
        all_args.extend_from_slice(args);
        debug!("Executing solver: {} {:?}", self.program, all_args);

        let capture = Exec::cmd(&self.program)
            .args(all_args.as_slice())
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe)
            .capture()
            .map_err(|e| Error::solver(format!("failed to run {}: {}", self.program, e)))?;

        if !capture.exit_status.success() {
            return Err(Error::solver(format!(
                "{} failed with {:?}: {}",
                self.program,
                capture.exit_status,
                capture.stderr_str().trim()
            )));
        }
        Ok(capture.stdout_str())
    }
}

/// Parse solver output, skipping lines that are not full cycles
pub fn parse_cycles(output: &str, proof_size: usize) -> Vec<Cycle> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match Cycle::from_hex_list(line) {
            Ok(cycle) if cycle.len() == proof_size => Some(cycle),
            Ok(cycle) => {
                warn!(
                    edges = cycle.len(),
                    expected = proof_size,
                    "Skipping solver cycle of wrong length"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, "Skipping unreadable solver output line");
                None
            }
        })
        .collect()
}

impl CycleSearch for ExternalSolver {
    fn find_cycles(
        &self,
        header_hash_hex: &str,
        edge_bits: u8,
        proof_size: usize,
        threads: usize,
        // the subprocess brings its own threads
        _pool: &rayon::ThreadPool,
    ) -> Result<Vec<Cycle>> {
        let output = self.run(&[
            "cpu".to_string(),
            header_hash_hex.to_string(),
            edge_bits.to_string(),
            proof_size.to_string(),
            threads.to_string(),
        ])?;
        Ok(parse_cycles(&output, proof_size))
    }

    fn find_cycles_on_device(
        &self,
        key0: u64,
        key1: u64,
        edge_bits: u8,
        proof_size: usize,
        device: usize,
    ) -> Result<Vec<Cycle>> {
        let output = self.run(&[
            "gpu".to_string(),
            format!("{:016x}", key0),
            format!("{:016x}", key1),
            edge_bits.to_string(),
            proof_size.to_string(),
            device.to_string(),
        ])?;
        Ok(parse_cycles(&output, proof_size))
    }

    /// Asks the solver with `devices`; it prints a JSON list of devices
    fn devices(&self) -> Vec<DeviceInfo> {
        match self
            .run(&["devices".to_string()])
            .and_then(|out| serde_json::from_str(&out).map_err(Error::from))
        {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Solver did not report devices");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_rejected() {
        assert!(ExternalSolver::new("   ").is_err());
    }

    #[test]
    fn test_command_split() {
        let solver = ExternalSolver::new("cuckoo-solver --quiet -v").unwrap();
        assert_eq!(solver.program, "cuckoo-solver");
        assert_eq!(solver.base_args, vec!["--quiet", "-v"]);
    }

    #[test]
    fn test_parse_cycles_skips_bad_lines() {
        let full: Vec<String> = (0..4).map(|i| format!("{:x}", i * 3)).collect();
        let output = format!("{}\n1,2\nnot hex\n\n{}\n", full.join(","), full.join(","));

        let cycles = parse_cycles(&output, 4);
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0].edges(), &[0, 3, 6, 9]);
    }

    #[cfg(unix)]
    #[test]
    fn test_runs_command_with_search_arguments() {
        let solver = ExternalSolver::new("echo 1,2,a").unwrap();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();

        // echo prints the search arguments on the same line, which is not a
        // readable cycle
        let cycles = solver.find_cycles("00", 20, 3, 1, &pool).unwrap();
        assert!(cycles.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_command_is_solver_error() {
        let solver = ExternalSolver::new("false").unwrap();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        assert!(matches!(
            solver.find_cycles("00", 20, 42, 1, &pool),
            Err(Error::Solver { .. })
        ));
        assert!(solver.devices().is_empty());
    }
}
