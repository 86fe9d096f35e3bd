//! Merit Miner - Main Application
//!
//! Connects to a stratum pool, runs the miner and prints mining statistics
//! until interrupted.

use merit_miner::{
    config::{determine_utilization, Config},
    solver::{CycleSearch, ExternalSolver, SimulationSolver, SolverKind},
    utils::{format_bytes, format_duration, format_rate, init_logging, number_of_cores},
    Context, DeviceInfo, Error, Result, APP_NAME, APP_VERSION,
};

use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().await?;

    // Held until exit so the file writer flushes
    let _log_guard = init_logging(config.log_level, config.log_format, config.log_file.as_deref())?;

    if config.print_config {
        print_configuration(&config)?;
        return Ok(());
    }

    let solver = create_solver(&config)?;

    if config.infogpu {
        print_gpus(&solver.devices());
        return Ok(());
    }

    config.validate_for_mining()?;
    check_gpu_indices(&config.gpu, &solver.devices())?;

    info!(version = APP_VERSION, solver = %config.solver, "Starting {}", APP_NAME);

    let context = Arc::new(Context::new(solver));
    match config.agent_parts() {
        Some((software, version)) => context.set_agent(software, version),
        None => context.set_agent(APP_NAME, APP_VERSION),
    }

    for url in &config.failover_url {
        context.add_pool(url)?;
    }

    let address = config.address.as_deref().unwrap_or_default();
    if !context.connect_stratum(&config.url, address, config.password()) {
        error!(url = %config.url, "Failed to connect to the pool");
        std::process::exit(1);
    }

    let cores = config.cores.unwrap_or_else(number_of_cores);
    let (workers, threads_per_worker) = determine_utilization(cores);
    info!(
        cores,
        workers,
        threads_per_worker,
        gpus = ?config.gpu,
        "Mining"
    );

    if !context.run_stratum() {
        return Err(Error::invalid_state("Stratum receive loop already running"));
    }
    if !context.run_miner(workers, threads_per_worker, config.gpu.clone()) {
        context.stop_stratum();
        return Err(Error::invalid_state("Miner could not be started"));
    }

    print_stats_until_interrupted(&context, &config).await?;

    info!("Shutting down");
    context.stop_miner();
    context.stop_stratum();

    let joiner = Arc::clone(&context);
    if let Err(e) = tokio::task::spawn_blocking(move || joiner.join()).await {
        warn!(error = %e, "Join task failed");
    }

    info!("Stopped");
    Ok(())
}

fn create_solver(config: &Config) -> Result<Arc<dyn CycleSearch>> {
    Ok(match config.solver {
        SolverKind::Simulation => Arc::new(
            SimulationSolver::new(config.simulation_probability)
                .with_devices(config.simulation_gpus),
        ),
        SolverKind::External => {
            let command = config
                .solver_cmd
                .as_deref()
                .ok_or_else(|| Error::config("--solver external needs --solver-cmd"))?;
            Arc::new(ExternalSolver::new(command)?)
        }
    })
}

fn check_gpu_indices(requested: &[usize], devices: &[DeviceInfo]) -> Result<()> {
    for index in requested {
        if !devices.iter().any(|d| d.id == *index) {
            return Err(Error::config(format!(
                "GPU {} does not exist, run with --infogpu to list devices",
                index
            )));
        }
    }
    Ok(())
}

/// Print totals each interval in which the graph count advanced
async fn print_stats_until_interrupted(context: &Context, config: &Config) -> Result<()> {
    let mut ticker = interval(config.stats_interval()?);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_graphs = 0;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                return Ok(());
            }
            _ = ticker.tick() => {
                let Some(stats) = context.get_miner_stats() else { continue };
                let total = stats.total;
                if total.attempts <= last_graphs {
                    continue;
                }
                last_graphs = total.attempts;

                info!(
                    "graphs: {} cycles: {} shares: {} | {} graphs {} cycles {} shares | up {}",
                    total.attempts,
                    total.cycles,
                    total.shares,
                    format_rate(total.attempts_per_second),
                    format_rate(total.cycles_per_second),
                    format_rate(total.shares_per_second),
                    format_duration(total.seconds as u64),
                );
            }
        }
    }
}

fn print_gpus(devices: &[DeviceInfo]) {
    if devices.is_empty() {
        println!("No GPU devices found");
        return;
    }
    for device in devices {
        println!("GPU {}: {}", device.id, device.title);
        println!("  memory:      {}", format_bytes(device.total_memory));
        println!("  temperature: {}", device.temperature);
        println!("  gpu util:    {}%", device.gpu_util);
        println!("  memory util: {}%", device.memory_util);
        println!("  fan speed:   {}%", device.fan_speed);
    }
}

/// Print current configuration
fn print_configuration(config: &Config) -> Result<()> {
    let config_yaml = serde_yaml::to_string(config)?;
    println!("{}", config_yaml);
    Ok(())
}
