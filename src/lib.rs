//! Merit Miner
//!
//! A stratum pool client for cuckoo-cycle proof of work:
//! - Stratum protocol engine with reconnect backoff and pool failover
//! - CPU and GPU workers sharing one bounded thread pool
//! - Pluggable cycle search (external solver binary or simulation)
//! - Per-job mining statistics

pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod miner;
pub mod solver;
pub mod stratum;
pub mod types;
pub mod utils;
pub mod work;
pub mod worker;

pub use config::Config;
pub use context::Context;
pub use error::{Error, Result};
pub use miner::{Miner, MinerStats, StatSnapshot, SubmitWorkFn};
pub use solver::{CycleSearch, DeviceInfo};
pub use stratum::Client;
pub use types::*;
pub use work::{work_from_job, Job, Work};

/// Application information
pub const APP_NAME: &str = "merit-minerd";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
