//-----------------------------------------------------------------------------
// xcp_monitor - XCP measurement and calibration monitor
// Connects to an ECU, decodes its A2L description, lists parameters and reads values periodically
//
// Run:
// cargo r -- -h
// cargo r -- --a2l demo.a2l --host 127.0.0.1 --port 5555 --list-mea ".*"
// cargo r -- --catalog catalog.json --ecu 1 --interval-ms 100 --time-ms 5000

use std::{error::Error, sync::Arc, time::Duration};

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use xcp_monitor::{
    acquisition::{Acquisition, AcquisitionConfig},
    catalog::{Catalog, EcuDescriptor, FileDescriptionSource, MemoryCatalog, SignalId},
    xcp::{SessionConfig, TcpConnector},
    A2lDescription, Category, ParameterDefinition,
};

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

    // -c --catalog
    /// ECU and signal catalog (json)
    #[arg(short, long)]
    catalog: Option<String>,

    // -e --ecu
    /// ECU id in the catalog
    #[arg(short, long)]
    ecu: Option<u32>,

    // -a --a2l
    /// A2L file of the ECU, used when no catalog is given
    #[arg(short, long, default_value = "")]
    a2l: String,

    // --host
    /// XCP server address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    // -p --port
    /// XCP server port number
    #[arg(short, long, default_value_t = 5555)]
    port: u16,

    // --list-mea
    /// Lists all matching measurement variables found in the A2L file
    #[clap(long, default_value = "")]
    list_mea: String,

    // --list-cal
    /// Lists all matching calibration variables found in the A2L file and reads their current value
    #[clap(long, default_value = "")]
    list_cal: String,

    // -s --signals
    /// Parameter names to monitor, may be list of names separated by space or a single regular expression (e.g. ".*")
    #[arg(short, long, value_delimiter = ' ', num_args = 1..)]
    signals: Vec<String>,

    // -i --interval-ms
    /// Read interval in ms
    #[arg(short, long, default_value_t = 100)]
    interval_ms: u64,

    // -t --time-ms
    /// Monitoring duration in ms
    #[arg(short, long, default_value_t = 5000)]
    time_ms: u64,

    // --read-timeout-ms
    /// Timeout of a single XCP command in ms, 0 = no timeout
    #[arg(long, default_value_t = 0)]
    read_timeout_ms: u64,
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
// Helpers

// A single argument is a regular expression, otherwise a list of names
fn select_definitions<'a>(description: &'a A2lDescription, names: &[String]) -> Result<Vec<&'a ParameterDefinition>, Box<dyn Error>> {
    if names.len() == 1 {
        Ok(description.find_matching(&names[0])?)
    } else {
        Ok(names.iter().filter_map(|name| description.find(name)).collect())
    }
}

fn print_definitions<'a>(title: &str, definitions: impl Iterator<Item = &'a ParameterDefinition>) {
    println!();
    println!("{}:", title);
    for d in definitions {
        println!(
            " {} 0x{:08X} {} {} {}",
            d.name,
            d.address,
            d.data_type,
            d.unit.as_deref().unwrap_or("-"),
            d.conversion.as_ref().map(|c| c.formula()).unwrap_or("")
        );
    }
    println!();
}

//------------------------------------------------------------------------
// Monitor

async fn monitor(acquisition: &Acquisition, ecu: EcuDescriptor, args: &Args) -> Result<(), Box<dyn Error>> {
    info!("Connect to ECU {}", ecu.name);
    acquisition.connect(ecu.clone()).await?;
    let description = acquisition.description().ok_or("no description loaded")?;

    // Print matching measurement objects
    if !args.list_mea.is_empty() {
        let list = description.find_matching(&args.list_mea)?;
        print_definitions("Measurement variables", list.into_iter().filter(|d| d.category == Category::Measurement));
    }

    // Print matching calibration objects with their current value
    if !args.list_cal.is_empty() {
        println!();
        println!("Calibration variables:");
        for d in description.find_matching(&args.list_cal)?.into_iter().filter(|d| d.is_calibration()) {
            let id = acquisition.register_definition(&d.name)?;
            match acquisition.read_once(id).await {
                Ok(v) => println!(" {} 0x{:08X} = {} {}", d.name, d.address, v, d.unit.as_deref().unwrap_or("")),
                Err(e) => println!(" {} 0x{:08X} = {}", d.name, d.address, e),
            }
        }
        println!();
    }

    // Signals to monitor, from the command line or all catalog signals of the ECU
    let mut ids: Vec<SignalId> = Vec::new();
    if !args.signals.is_empty() {
        for d in select_definitions(&description, &args.signals)? {
            ids.push(acquisition.register_definition(&d.name)?);
        }
    } else if args.list_mea.is_empty() && args.list_cal.is_empty() {
        ids = acquisition.available_signals(ecu.id).iter().map(|s| s.id).collect();
    }

    if !ids.is_empty() {
        info!("Monitor {} signals:", ids.len());
        for id in &ids {
            if let Some(s) = acquisition.signal(*id) {
                info!("  {}: {}", id, s.display_name());
            }
        }

        let mut readings = acquisition.subscribe();
        let done = CancellationToken::new();
        let printer_done = done.clone();
        let printer = tokio::spawn(async move {
            let mut count: u64 = 0;
            loop {
                tokio::select! {
                    _ = printer_done.cancelled() => break,
                    res = readings.recv() => match res {
                        Ok(r) => {
                            count += 1;
                            println!("{} {} = {}", r.timestamp.format("%H:%M:%S%.3f"), r.key.name, r.value);
                        }
                        Err(RecvError::Lagged(n)) => warn!("{} readings lost", n),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            count
        });

        let start_time = tokio::time::Instant::now();
        acquisition.start_periodic(&ids, Duration::from_millis(args.interval_ms)).await;
        tokio::time::sleep(Duration::from_millis(args.time_ms)).await;
        acquisition.stop_periodic().await;
        let elapsed_time = start_time.elapsed().as_micros();

        done.cancel();
        let count = printer.await.unwrap_or(0);
        info!(
            "Monitoring done, {} readings, {:.0} readings/s",
            count,
            count as f64 * 1_000_000.0 / elapsed_time as f64
        );
    }

    acquisition.disconnect().await;
    Ok(())
}

//------------------------------------------------------------------------
// Main function

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let log_level = args.log_level.to_log_level_filter();
    env_logger::Builder::new()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    // Catalog from file, or a single ECU from the command line
    let (catalog, ecu) = match &args.catalog {
        Some(path) => {
            let catalog = MemoryCatalog::load(path)?;
            let id = args.ecu.or_else(|| catalog.ecus().first().map(|e| e.id)).ok_or("catalog contains no ECU")?;
            let ecu = catalog.get_ecu(id).ok_or(format!("ECU {} not found in catalog", id))?;
            (catalog, ecu)
        }
        None => {
            if args.a2l.is_empty() {
                return Err("either --catalog or --a2l is required".into());
            }
            (MemoryCatalog::new(), EcuDescriptor::new(0, "ecu", &args.host, args.port, &args.a2l))
        }
    };

    let config = AcquisitionConfig {
        session: SessionConfig {
            read_timeout: if args.read_timeout_ms > 0 { Some(Duration::from_millis(args.read_timeout_ms)) } else { None },
            ..SessionConfig::default()
        },
        ..AcquisitionConfig::default()
    };
    let acquisition = Acquisition::new(Arc::new(catalog), Arc::new(FileDescriptionSource::new()), Arc::new(TcpConnector), config);

    monitor(&acquisition, ecu, &args).await?;

    Ok(())
}
