use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use jensen_protocol::{CancellationToken, DeviceFacade, OperationStatus, ProgressEvent};
use log::Level;
use pbr::{ProgressBar, Units};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Opts {
    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// Force a USB reset when opening the device
    #[clap(long)]
    force_reset: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached HiDock devices without connecting
    Discover,
    /// Print device info, storage info, and capabilities
    Info,
    /// List recordings on the device
    List,
    /// Download one recording by name
    Download {
        name: String,
        length: u64,
        #[clap(short, long)]
        out: PathBuf,
    },
    /// Delete one recording by name
    Delete { name: String },
    /// Format the device's storage
    Format,
    /// Set the device clock to the host's current time
    SyncTime,
    /// Print connection health and stats
    Health,
}

fn init_logging(verbose: bool) {
    if verbose {
        env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                use std::io::Write;
                let level = record.level();
                if level == Level::Info {
                    writeln!(buf, "{}", record.args())
                } else {
                    writeln!(buf, "{}: {}", record.level(), record.args())
                }
            })
            .init();
    }
}

async fn connect(opts: &Opts) -> Result<DeviceFacade> {
    let descriptors = DeviceFacade::discover();
    let descriptor = descriptors
        .into_iter()
        .next()
        .context("no HiDock device found")?;
    log::info!("connecting to {}", descriptor.id());

    let facade = DeviceFacade::new();
    facade
        .connect(descriptor, opts.force_reset)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(facade)
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(opts.verbose);

    match &opts.command {
        Command::Discover => {
            for descriptor in DeviceFacade::discover() {
                println!("{}  serial={:?}", descriptor.id(), descriptor.serial_number);
            }
            return Ok(());
        }
        _ => {}
    }

    let facade = connect(&opts).await?;

    match opts.command {
        Command::Discover => unreachable!(),
        Command::Info => {
            let info = facade.get_device_info().await.map_err(|e| anyhow::anyhow!(e))?;
            let storage = facade.get_storage_info().await.map_err(|e| anyhow::anyhow!(e))?;
            let caps = facade.get_capabilities().await;
            println!("serial:       {}", info.serial_number);
            println!("firmware:     {:#x}", info.version_code);
            println!(
                "storage:      {} MB used / {} MB total",
                storage.used_mb, storage.capacity_mb
            );
            println!("capabilities: {:?}", caps);
        }
        Command::List => {
            let recordings = facade.get_recordings().await.map_err(|e| anyhow::anyhow!(e))?;
            for rec in recordings {
                println!(
                    "{}\t{} bytes\t{:.1}s\t{}",
                    rec.name,
                    rec.length,
                    rec.duration_secs,
                    rec.created_at
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                );
            }
        }
        Command::Download { name, length, out } => {
            let mut pb = ProgressBar::new(length);
            pb.set_units(Units::Bytes);
            let cancel = CancellationToken::new();

            facade
                .download(name, length, &out, None, Some(cancel), move |event: ProgressEvent| {
                    if let Some(bytes) = event.bytes_processed {
                        pb.set(bytes);
                    }
                    if matches!(event.status, OperationStatus::Completed | OperationStatus::Failed) {
                        pb.finish();
                    }
                })
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("saved to {}", out.display());
        }
        Command::Delete { name } => {
            let result = facade.delete(name).await.map_err(|e| anyhow::anyhow!(e))?;
            println!("{:?}", result);
        }
        Command::Format => {
            let result = facade
                .format_storage(1, |event: ProgressEvent| {
                    log::debug!("format status: {:?}", event.status);
                })
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("{:?}", result);
        }
        Command::SyncTime => {
            let now = chrono::Local::now().naive_local();
            facade
                .sync_time(Some(now))
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("device clock set to {}", now);
        }
        Command::Health => {
            let health = facade.get_health().await;
            println!("status:      {:?}", health.status);
            println!("error rate:  {:.2}%", health.error_rate * 100.0);
            println!("commands:    {}", health.stats.commands_sent);
            println!(
                "failures:    {}",
                health.stats.commands_sent - health.stats.responses_received
            );
        }
    }

    facade.disconnect().await;
    Ok(())
}
