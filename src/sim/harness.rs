// src/sim/harness.rs - Run a synthetic print against simulated firmware
//! Generates a layered job, streams it to an in-process simulated printer and prints
//! progress as it goes. Faults can be scripted from the command line to watch the host
//! recover (or fail) the way it would on real hardware.

use clap::Parser;
use futures_util::StreamExt;
use krusty_link::config::Config;
use krusty_link::simulator::{FaultPlan, SimulatedDevice, SimulatedPorts};
use krusty_link::{CommandSource, Dialect, JobState, PrinterHost};
use std::sync::Arc;
use std::time::Duration;

const PORT: &str = "/dev/ttyACM0";

#[derive(Parser)]
#[command(name = "sim_harness", about = "Stream a generated job to simulated firmware")]
struct Args {
    #[arg(long, default_value = "marlin")]
    dialect: String,
    #[arg(long, default_value_t = 250000)]
    baud: u32,
    #[arg(long, default_value_t = 5)]
    layers: u32,
    #[arg(long, default_value_t = 20)]
    moves_per_layer: u32,
    /// Reply with an error to the n-th motion command
    #[arg(long)]
    error_at: Option<usize>,
    /// Swallow the n-th motion command once
    #[arg(long)]
    drop_at: Option<usize>,
    /// Emit busy notices before acknowledging the n-th motion command
    #[arg(long)]
    busy_at: Option<usize>,
    /// Unplug the device at the n-th motion command
    #[arg(long)]
    disconnect_at: Option<usize>,
    /// Plug the device back in this many ms after a disconnect
    #[arg(long)]
    replug_ms: Option<u64>,
    /// Pause for this many ms halfway through the job
    #[arg(long)]
    pause_ms: Option<u64>,
    /// Per-reply latency in ms
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,
    #[arg(long)]
    noise_seed: Option<u64>,
    #[arg(long)]
    json: bool,
}

fn generate_job(layers: u32, moves: u32) -> String {
    let mut gcode = String::from(";LAYER_COUNT:");
    gcode.push_str(&format!("{}\nG28\nG90\nM104 S200\nM140 S60\n", layers));
    for layer in 0..layers {
        gcode.push_str(&format!(";LAYER:{}\nG1 Z{:.2} F600\n", layer, 0.2 * (layer + 1) as f64));
        for i in 0..moves {
            let x = 10.0 + (i % 10) as f64 * 5.0;
            let y = 10.0 + (i / 10) as f64 * 5.0;
            gcode.push_str(&format!("G1 X{:.1} Y{:.1} E0.05 F1500 ; perimeter\n", x, y));
        }
    }
    gcode.push_str("M104 S0\nM140 S0\nM107\n");
    gcode
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    let args = Args::parse();

    let dialect =
        Dialect::from_name(&args.dialect).ok_or_else(|| format!("unknown dialect '{}'", args.dialect))?;

    let mut faults = FaultPlan::new().with_response_delay(Duration::from_millis(args.latency_ms));
    if let Some(n) = args.error_at {
        faults = faults.error_at(n, "simulated thermal runaway");
    }
    if let Some(n) = args.drop_at {
        faults = faults.drop_at(n, 1);
    }
    if let Some(n) = args.busy_at {
        faults = faults.busy_at(n, 3);
    }
    if let Some(n) = args.disconnect_at {
        faults = faults.disconnect_at(n);
    }

    let mut device = SimulatedDevice::new(PORT, dialect, args.baud).with_faults(faults);
    if let Some(ms) = args.replug_ms {
        device = device.with_auto_replug(Duration::from_millis(ms));
    }
    if let Some(seed) = args.noise_seed {
        device = device.with_noise(seed);
    }
    let ports = SimulatedPorts::new();
    ports.attach(device);

    let mut config = Config::default();
    config.connection.settle_ms = 0;
    config.connection.command_timeout_ms = 1000;
    config.monitor.poll_interval_ms = 500;
    config.monitor.poll_timeout_ms = 500;
    let host = PrinterHost::new(Arc::new(ports.clone()), config);

    let found = host.detect_printers(Duration::from_secs(5)).await;
    let candidate = found.first().ok_or("simulated printer was not detected")?;
    println!(
        "Detected {} on {} at {} baud",
        candidate.display_name, candidate.port, candidate.baud
    );

    let conn = host.connect(&candidate.port, candidate.baud).await?;
    let source = CommandSource::from_str(&generate_job(args.layers, args.moves_per_layer))
        .with_name("harness job");
    let job = host.stream(&conn, source, None)?;

    if let Some(ms) = args.pause_ms {
        let job = job.clone();
        let total = job.progress().lines_total;
        tokio::spawn(async move {
            while job.progress().lines_sent < total / 2 {
                if job.state().is_terminal() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            if job.pause() {
                println!("Paused at line {}", job.progress().lines_sent);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                job.resume();
                println!("Resumed");
            }
        });
    }

    let mut updates = Box::pin(job.progress_stream());
    let mut last_percent = -1.0;
    while let Some(snapshot) = updates.next().await {
        if args.json {
            println!("{}", serde_json::to_string(&snapshot)?);
        } else if snapshot.percent - last_percent >= 5.0 || snapshot.state.is_terminal() {
            last_percent = snapshot.percent;
            println!(
                "{:>9} {:>5.1}% layer {:?}/{:?}",
                snapshot.state.to_string(),
                snapshot.percent,
                snapshot.current_layer,
                snapshot.layer_count
            );
        }
    }

    let finished = job.wait().await;
    if let Some(failure) = &finished.failure {
        println!(
            "Job failed at line {} ({}): {}",
            failure.line_number, failure.line, failure.reason
        );
    }
    let status = host.get_connection_status(&conn);
    println!("Link: {:?}, reconnects {}, stats {:?}", status.state, status.reconnects, status.stats);
    if let Some(fw) = ports.snapshot(PORT) {
        println!(
            "Firmware executed {} command(s); hotend target {:.0}, bed target {:.0}",
            fw.executed.len(),
            fw.hotend.target,
            fw.bed.target
        );
    }
    host.disconnect(&conn).await;

    if finished.state != JobState::Completed {
        std::process::exit(1);
    }
    Ok(())
}
