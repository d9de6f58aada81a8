// src/main.rs - printer-link command line
use clap::{Parser, Subcommand};
use krusty_link::communication::PortOpener;
use krusty_link::simulator::SimulatedPorts;
use krusty_link::{
    CommandSource, Config, ConnectionHandle, Dialect, PrinterHost, ProgressSnapshot, load_config,
};
use krusty_link::print_job::ObserverError;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const DEFAULT_CONFIG: &str = "printer.toml";
const SIMULATED_PORT: &str = "/dev/ttyUSB0";
const SIMULATED_BAUD: u32 = 115200;

#[derive(Parser)]
#[command(name = "printer-link", version, about = "Talk to 3D printers over serial G-code")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: String,
    /// Run against simulated firmware (marlin, prusa, klipper, unknown)
    #[arg(long)]
    simulate: Option<String>,
    /// Print machine-readable JSON instead of text
    #[arg(long)]
    json: bool,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Clone)]
struct Target {
    #[arg(long)]
    port: Option<String>,
    #[arg(long)]
    baud: Option<u32>,
}

#[derive(Subcommand)]
enum Command {
    /// Scan serial ports for printers
    Detect {
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Send one command and print the reply
    Send {
        #[command(flatten)]
        target: Target,
        #[arg(required = true)]
        command: Vec<String>,
    },
    /// Stream a G-code file
    Stream {
        #[command(flatten)]
        target: Target,
        file: PathBuf,
    },
    /// Show connection status and temperatures
    Status {
        #[command(flatten)]
        target: Target,
    },
    /// Run the firmware's bed leveling routine
    Level {
        #[command(flatten)]
        target: Target,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let missing_default =
        cli.config == DEFAULT_CONFIG && !std::path::Path::new(DEFAULT_CONFIG).exists();
    let mut config = if missing_default {
        tracing::info!("No {} found, using defaults", DEFAULT_CONFIG);
        Config::default()
    } else {
        match load_config(&cli.config) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to load config from '{}': {}", cli.config, e);
                return Err(Box::new(e));
            }
        }
    };

    let opener: Arc<dyn PortOpener> = match &cli.simulate {
        Some(name) => {
            let dialect = Dialect::from_name(name)
                .ok_or_else(|| format!("unknown dialect '{}'", name))?;
            tracing::info!("Simulating {} firmware on {}", dialect, SIMULATED_PORT);
            config.connection.settle_ms = 0;
            Arc::new(SimulatedPorts::single(SIMULATED_PORT, dialect, SIMULATED_BAUD))
        }
        None => Arc::new(krusty_link::communication::SerialPortOpener),
    };
    let host = PrinterHost::new(opener, config);

    match cli.command {
        Command::Detect { timeout } => {
            let found = host.detect_printers(Duration::from_secs(timeout)).await;
            if cli.json {
                print_json(&found)?;
            } else if found.is_empty() {
                println!("No printers found");
            } else {
                for c in &found {
                    println!("{}  {} baud  {} ({})", c.port, c.baud, c.display_name, c.dialect);
                }
            }
        }
        Command::Send { target, command } => {
            let conn = connect(&host, &target).await?;
            let text = command.join(" ");
            let result = conn.send_command(&text).await;
            host.disconnect(&conn).await;
            let reply = result?;
            for line in &reply.info_lines {
                println!("{}", line);
            }
            println!("{:?}", reply.ack);
        }
        Command::Stream { target, file } => {
            let source = CommandSource::from_file(&file).await?;
            let conn = connect(&host, &target).await?;
            let json = cli.json;
            let observer = move |s: &ProgressSnapshot| -> Result<(), ObserverError> {
                print_progress(s, json)
            };
            let job = host.stream(&conn, source, Some(Arc::new(observer)))?;

            let snapshot = tokio::select! {
                snapshot = job.wait() => snapshot,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("Interrupted, stopping printer");
                    host.emergency_stop(&job).await;
                    job.wait().await
                }
            };
            host.disconnect(&conn).await;
            if let Some(failure) = &snapshot.failure {
                return Err(format!(
                    "job failed at line {} '{}': {}",
                    failure.line_number, failure.line, failure.reason
                )
                .into());
            }
        }
        Command::Status { target } => {
            let conn = connect(&host, &target).await?;
            // Fresh reading rather than whatever the handshake left behind
            if let Err(e) = conn.send_command("M105").await {
                tracing::warn!("Temperature query failed: {}", e);
            }
            let status = host.get_connection_status(&conn);
            host.disconnect(&conn).await;
            if cli.json {
                print_json(&status)?;
            } else {
                println!(
                    "{} @ {} baud: {:?} ({})",
                    status.port,
                    status.baud,
                    status.state,
                    status.display_name.as_deref().unwrap_or("unidentified")
                );
                if let Some(t) = status.last_temperatures {
                    println!(
                        "Hotend {:.1}/{:.1}  Bed {:.1}/{:.1}",
                        t.hotend, t.hotend_target, t.bed, t.bed_target
                    );
                }
            }
        }
        Command::Level { target } => {
            let conn = connect(&host, &target).await?;
            let result = conn.run_leveling().await;
            host.disconnect(&conn).await;
            for line in result?.info_lines {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

async fn connect(host: &PrinterHost, target: &Target) -> Result<ConnectionHandle, BoxError> {
    let config = host.config();
    let port = target.port.clone().or_else(|| config.connection.port.clone());
    let baud = target.baud.or(config.connection.baud);
    let conn = match (port, baud) {
        (Some(port), Some(baud)) => host.connect(&port, baud).await?,
        _ => host.connect_auto(Duration::from_secs(10)).await?,
    };
    Ok(conn)
}

fn print_progress(s: &ProgressSnapshot, json: bool) -> Result<(), ObserverError> {
    if json {
        println!("{}", serde_json::to_string(s)?);
    } else {
        println!(
            "[{}] {:>5.1}% {}/{} layer {} elapsed {}s eta {}s",
            s.state,
            s.percent,
            s.lines_sent,
            s.lines_total,
            s.current_layer.map_or("-".to_string(), |l| l.to_string()),
            s.elapsed.as_secs(),
            s.estimated_remaining.as_secs()
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), BoxError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
