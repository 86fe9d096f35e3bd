//! Configuration management for the merit miner
//!
//! Supports command line arguments, environment variables and configuration
//! files (YAML/JSON) with validation and defaults.

use crate::solver::SolverKind;
use crate::stratum::PoolAddress;
use crate::{Error, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default stratum pool
pub const DEFAULT_URL: &str = "stratum+tcp://pool.merit.me:3333";

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level: tracing::Level = (*self).into();
        write!(f, "{}", level.as_str().to_lowercase())
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    Plain,
    /// One JSON object per event
    Json,
}

/// Complete configuration for the miner
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "merit-minerd",
    version = env!("CARGO_PKG_VERSION"),
    about = "Merit cuckoo-cycle pool miner",
    long_about = "A stratum mining client for Merit that searches for cuckoo cycles on CPU and GPU workers"
)]
pub struct Config {
    /// Show info about the GPUs in this system and exit
    #[arg(long)]
    #[serde(default)]
    pub infogpu: bool,

    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(default)]
    pub print_config: bool,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    #[serde(default)]
    pub config_file: Option<PathBuf>,

    /// The stratum pool url
    #[arg(short = 'o', long, env = "MERIT_MINER_URL", default_value = DEFAULT_URL)]
    #[serde(default = "default_url")]
    pub url: String,

    /// Extra pools to fail over to (can be used multiple times)
    #[arg(long = "failover-url", value_name = "URL")]
    #[serde(default)]
    pub failover_url: Vec<String>,

    /// The address to send mining rewards to
    #[arg(short = 'a', long, env = "MERIT_MINER_ADDRESS")]
    #[serde(default)]
    pub address: Option<String>,

    /// Pool password
    #[arg(short = 'p', long, env = "MERIT_MINER_PASSWORD")]
    #[serde(default)]
    pub password: Option<String>,

    /// Index of a GPU device to mine on (can be used multiple times, see --infogpu)
    #[arg(long, value_name = "INDEX")]
    #[serde(default)]
    pub gpu: Vec<usize>,

    /// The number of CPU cores to use (default: all)
    #[arg(short = 'c', long)]
    #[serde(default)]
    pub cores: Option<usize>,

    /// Cycle-search implementation
    #[arg(long, value_enum, default_value = "simulation")]
    #[serde(default = "default_solver")]
    pub solver: SolverKind,

    /// Command line of the external solver
    #[arg(long, value_name = "COMMAND")]
    #[serde(default)]
    pub solver_cmd: Option<String>,

    /// Chance per search that the simulation solver reports a cycle
    #[arg(long, default_value = "0.05")]
    #[serde(default = "default_simulation_probability")]
    pub simulation_probability: f64,

    /// Number of fake GPUs the simulation solver reports
    #[arg(long, default_value = "0")]
    #[serde(default)]
    pub simulation_gpus: usize,

    /// Log level
    #[arg(short = 'l', long, value_enum, default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Log format
    #[arg(long, value_enum, default_value = "plain")]
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// How often to print mining statistics (e.g. "5s", "1m")
    #[arg(long, default_value = "5s")]
    #[serde(default = "default_stats_interval")]
    pub stats_interval: String,

    /// Agent string sent to the pool as "software/version"
    #[arg(long)]
    #[serde(default)]
    pub agent: Option<String>,
}

impl Config {
    /// Parse the command line, merge the config file if given, and validate
    pub async fn load() -> Result<Self> {
        let mut config = Self::parse();

        if let Some(config_file) = config.config_file.clone() {
            let file_config = Self::load_from_file(&config_file).await?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            // Default to YAML
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Fill values left at their defaults on the command line from the file
    pub fn merge_with_file(mut self, file: Self) -> Self {
        if self.url == DEFAULT_URL {
            self.url = file.url;
        }
        if self.failover_url.is_empty() {
            self.failover_url = file.failover_url;
        }
        if self.address.is_none() {
            self.address = file.address;
        }
        if self.password.is_none() {
            self.password = file.password;
        }
        if self.gpu.is_empty() {
            self.gpu = file.gpu;
        }
        if self.cores.is_none() {
            self.cores = file.cores;
        }
        if self.solver == default_solver() {
            self.solver = file.solver;
        }
        if self.solver_cmd.is_none() {
            self.solver_cmd = file.solver_cmd;
        }
        if self.simulation_probability == default_simulation_probability() {
            self.simulation_probability = file.simulation_probability;
        }
        if self.simulation_gpus == 0 {
            self.simulation_gpus = file.simulation_gpus;
        }
        if self.log_level == default_log_level() {
            self.log_level = file.log_level;
        }
        if self.log_format == default_log_format() {
            self.log_format = file.log_format;
        }
        if self.log_file.is_none() {
            self.log_file = file.log_file;
        }
        if self.stats_interval == default_stats_interval() {
            self.stats_interval = file.stats_interval;
        }
        if self.agent.is_none() {
            self.agent = file.agent;
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        PoolAddress::parse(&self.url)
            .map_err(|e| Error::config(format!("Invalid pool url: {}", e)))?;
        for url in &self.failover_url {
            PoolAddress::parse(url)
                .map_err(|e| Error::config(format!("Invalid failover url: {}", e)))?;
        }

        if self.stats_interval()?.is_zero() {
            return Err(Error::config("Stats interval must be greater than 0"));
        }

        if self.solver == SolverKind::External && self.solver_cmd.is_none() {
            return Err(Error::config("--solver external needs --solver-cmd"));
        }

        if !(0.0..=1.0).contains(&self.simulation_probability) {
            return Err(Error::config("Simulation probability must be between 0 and 1"));
        }

        if let Some(agent) = &self.agent {
            if self.agent_parts().is_none() {
                return Err(Error::config(format!(
                    "Agent {:?} must look like software/version",
                    agent
                )));
            }
        }

        Ok(())
    }

    /// Checks needed only when mining, not for --infogpu or --print-config
    pub fn validate_for_mining(&self) -> Result<()> {
        match self.address.as_deref() {
            Some(address) if !address.trim().is_empty() => Ok(()),
            _ => Err(Error::config(
                "forgot to set your reward address, use --address",
            )),
        }
    }

    /// Parsed statistics interval
    pub fn stats_interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.stats_interval)
            .map_err(|e| Error::config(format!("Invalid stats interval: {}", e)))
    }

    /// Agent split into software and version
    pub fn agent_parts(&self) -> Option<(&str, &str)> {
        self.agent
            .as_deref()
            .and_then(|agent| agent.split_once('/'))
            .filter(|(software, version)| !software.is_empty() && !version.is_empty())
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or_default()
    }
}

/// Split `cores` into `(workers, threads_per_worker)`: odd counts get one
/// thread per worker, even counts pair threads up
pub fn determine_utilization(cores: usize) -> (usize, usize) {
    if cores % 2 == 1 {
        (cores, 1)
    } else {
        (cores / 2, 2)
    }
}

// Default value functions for serde
fn default_url() -> String { DEFAULT_URL.to_string() }
fn default_solver() -> SolverKind { SolverKind::Simulation }
fn default_simulation_probability() -> f64 { 0.05 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_log_format() -> LogFormat { LogFormat::Plain }
fn default_stats_interval() -> String { "5s".to_string() }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["merit-minerd"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = parse(&[]);

        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.solver, SolverKind::Simulation);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_format, LogFormat::Plain);
        assert_eq!(config.stats_interval().unwrap(), Duration::from_secs(5));
        assert!(config.gpu.is_empty());
        assert!(config.validate().is_ok());
        assert!(config.validate_for_mining().is_err());
    }

    #[test]
    fn test_repeatable_flags() {
        let config = parse(&[
            "--gpu", "0", "--gpu", "2",
            "--failover-url", "stratum+tcp://b.example:1",
            "--failover-url", "tcp://c.example:2",
            "--address", "MWallet",
        ]);
        assert_eq!(config.gpu, vec![0, 2]);
        assert_eq!(config.failover_url.len(), 2);
        assert!(config.validate().is_ok());
        assert!(config.validate_for_mining().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        assert!(parse(&["--url", "http://pool:1"]).validate().is_err());
        assert!(parse(&["--url", "stratum+tcp://pool"]).validate().is_err());
        assert!(parse(&["--stats-interval", "0s"]).validate().is_err());
        assert!(parse(&["--stats-interval", "soon"]).validate().is_err());
        assert!(parse(&["--solver", "external"]).validate().is_err());
        assert!(parse(&["--agent", "noversion"]).validate().is_err());
        assert!(parse(&["--solver", "external", "--solver-cmd", "solver"])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_agent_parts() {
        let config = parse(&["--agent", "my-miner/1.2"]);
        assert_eq!(config.agent_parts(), Some(("my-miner", "1.2")));
    }

    #[tokio::test]
    async fn test_config_from_yaml() {
        let yaml_content = r#"
url: "stratum+tcp://eu.pool.example:4444"
address: "MExampleAddress"
gpu: [1]
cores: 3
log_level: debug
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let file = Config::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(file.address.as_deref(), Some("MExampleAddress"));
        assert_eq!(file.cores, Some(3));
        assert_eq!(file.solver, SolverKind::Simulation);

        let merged = parse(&["--cores", "8"]).merge_with_file(file);
        assert_eq!(merged.url, "stratum+tcp://eu.pool.example:4444");
        assert_eq!(merged.cores, Some(8));
        assert_eq!(merged.gpu, vec![1]);
        assert_eq!(merged.log_level, LogLevel::Debug);
    }

    #[tokio::test]
    async fn test_config_from_json() {
        let mut temp_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(temp_file, r#"{{"solver": "external", "solver_cmd": "solver --fast"}}"#).unwrap();

        let config = Config::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(config.solver, SolverKind::External);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_determine_utilization() {
        assert_eq!(determine_utilization(0), (0, 2));
        assert_eq!(determine_utilization(1), (1, 1));
        assert_eq!(determine_utilization(7), (7, 1));
        assert_eq!(determine_utilization(8), (4, 2));
    }
}
