//! CMC control unit binary: load the machine configuration, build the
//! servo controller, and run the cycle loop.
//!
//! Without the `rt` cargo feature the loop paces itself with plain
//! sleeps (simulation); with it, the RT setup sequence (mlockall,
//! stack prefault, CPU pinning, SCHED_FIFO) runs first.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use cmc_common::config::MachineConfig;
use cmc_control_unit::cycle::{self, ServoController};
use cmc_motion::kinematics::TrivialKins;

#[derive(Parser, Debug)]
#[command(name = "cmc_control_unit", about = "CMC motion-control servo cycle")]
struct Args {
    /// Machine configuration (TOML).
    #[arg(short, long)]
    config: PathBuf,

    /// Stop after this many cycles (0 = run forever).
    #[arg(long, default_value_t = 0)]
    cycles: u64,

    /// CPU core to pin the servo thread to.
    #[arg(long, default_value_t = 1)]
    cpu: usize,

    /// SCHED_FIFO priority.
    #[arg(long, default_value_t = 80)]
    priority: i32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let config = match MachineConfig::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            return ExitCode::FAILURE;
        }
    };
    info!(
        joints = config.num_joints(),
        cycle_time_s = config.traj.cycle_time,
        "configuration loaded"
    );

    let mut controller = match ServoController::new(config, Box::new(TrivialKins)) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "controller init failed");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = cycle::rt_setup(args.cpu, args.priority) {
        error!(error = %e, "RT setup failed");
        return ExitCode::FAILURE;
    }

    cycle::run_sim_loop(&mut controller, args.cycles);

    info!(
        cycles = controller.stats.cycle_count,
        avg_ns = controller.stats.avg_cycle_ns(),
        max_ns = controller.stats.max_cycle_ns,
        overruns = controller.stats.overruns,
        "servo loop finished"
    );
    ExitCode::SUCCESS
}
