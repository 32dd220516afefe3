//! sweep_daq - robotic-arm sweep acquisition
//!
//! Loads the configuration, starts the scan orchestrator and reads operator commands
//! from stdin, one per line. Type `help` for the command list.
//!
//! ```bash
//! cargo run --features full -- --config config/sweep.toml
//! RUST_LOG=sweep_daq=debug cargo run
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sweep_daq::app_actor::ScanOrchestrator;
use sweep_daq::config::Settings;
use sweep_daq::console::{parse_line, ConsoleInput, HELP};
use sweep_daq::messages::{Notification, ScanCommand};

#[derive(Parser, Debug)]
#[command(name = "sweep_daq", version, about = "Robotic-arm sweep acquisition")]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Robot controller address, overrides the configuration
    #[arg(long)]
    robot: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings =
        Settings::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(address) = cli.robot {
        settings.robot.address = address;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sweep_daq={}", settings.application.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "{} starting, robot at {}",
        settings.application.name, settings.robot.address
    );

    let console_settings = settings.clone();
    let mut handle = ScanOrchestrator::spawn(settings);
    let commands = handle.sender();
    let status = handle.subscribe();

    // Blocking stdin reads stay off the runtime
    std::thread::spawn(move || {
        println!("{}", HELP);
        for line in std::io::stdin().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("Console read failed: {}", e);
                    break;
                }
            };
            match parse_line(&line, &console_settings) {
                Ok(ConsoleInput::Command(command)) => {
                    let closing = command == ScanCommand::Close;
                    if commands.blocking_send(command).is_err() || closing {
                        return;
                    }
                }
                Ok(ConsoleInput::Status) => {
                    let current = *status.borrow();
                    println!(
                        "state: {}  progress: {:.0}%",
                        current.state,
                        current.progress * 100.0
                    );
                }
                Ok(ConsoleInput::Help) => println!("{}", HELP),
                Ok(ConsoleInput::Empty) => {}
                Err(e) => warn!("{}", e),
            }
        }
        let _ = commands.blocking_send(ScanCommand::Close);
    });

    while let Some(notification) = handle.next_notification().await {
        match &notification {
            Notification::ScanComplete(path) => {
                println!("Scan complete, data saved to {}", path.display())
            }
            Notification::ConnectionError(reason) => println!("Connection failed: {}", reason),
            Notification::FileOpenError(path) => {
                println!("Cannot open output file {}", path.display())
            }
            Notification::GroundLevelSaved { field, level } => {
                println!("Field {} ground level {}", field, level)
            }
            Notification::Rejected { command, reason } => {
                println!("'{}' rejected: {}", command, reason)
            }
            other => println!("{:?}", other),
        }
    }

    handle.join().await.context("orchestrator stopped with an error")?;
    info!("Shutdown complete");
    Ok(())
}
