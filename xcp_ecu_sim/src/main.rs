//-----------------------------------------------------------------------------
// xcp_ecu_sim - simulated ECU demo server
// Serves the demo memory layout over XCP on TCP and updates the measurement values cyclically
//
// Run:
// cargo r -p xcp_ecu_sim -- --a2l xcp_ecu_sim.a2l
// cargo r -- --a2l xcp_ecu_sim.a2l --list-mea ".*" --signals ".*"

use std::{error::Error, time::Duration};

use xcp_ecu_sim::*;

//-----------------------------------------------------------------------------
// Command line arguments

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    // -l --log-level
    /// Log level (Off=0, Error=1, Warn=2, Info=3, Debug=4, Trace=5)
    #[arg(short, long, default_value_t = 3)]
    log_level: u8,

    // -b --bind
    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    // -p --port
    /// XCP server port number
    #[arg(short, long, default_value_t = 5555)]
    port: u16,

    // -a --a2l
    /// Write the A2L description of the demo ECU to this file
    #[arg(short, long, default_value = "")]
    a2l: String,

    // -c --cycle-ms
    /// Update cycle of the measurement values in ms
    #[arg(short, long, default_value_t = 10)]
    cycle_ms: u64,
}

//----------------------------------------------------------------------------------------------
// Logging

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

trait ToLogLevelFilter {
    fn to_log_level_filter(self) -> log::LevelFilter;
}

impl ToLogLevelFilter for u8 {
    fn to_log_level_filter(self) -> log::LevelFilter {
        match self {
            0 => log::LevelFilter::Off,
            1 => log::LevelFilter::Error,
            2 => log::LevelFilter::Warn,
            3 => log::LevelFilter::Info,
            4 => log::LevelFilter::Debug,
            5 => log::LevelFilter::Trace,
            _ => log::LevelFilter::Warn,
        }
    }
}

//------------------------------------------------------------------------
// Main function

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::Builder::new()
        .target(env_logger::Target::Stdout)
        .filter_level(args.log_level.to_log_level_filter())
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    if !args.a2l.is_empty() {
        std::fs::write(&args.a2l, DEMO_A2L)?;
        info!("A2L file {} written", args.a2l);
    }

    let sim = EcuSim::start_demo(&format!("{}:{}", args.bind, args.port)).await?;
    info!("Simulated ECU running on {}, press Ctrl-C to stop", sim.local_addr());

    // Counter and a slowly oscillating engine speed
    let mut cycle = tokio::time::interval(Duration::from_millis(args.cycle_ms.max(1)));
    let mut counter: u16 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = cycle.tick() => {
                counter = counter.wrapping_add(1);
                let rpm = 2000.0 + 1200.0 * (counter as f64 * 0.01).sin();
                sim.memory().write_u16(DEMO_COUNTER_ADDR, counter);
                sim.memory().write_u16(DEMO_ENGINE_SPEED_ADDR, (rpm * 4.0) as u16);
            }
        }
    }

    sim.shutdown().await;
    Ok(())
}
