use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Instant;
use log::{info, warn, error, debug, trace};

use flock_common::{BackendChoice, SimulationConfig, Snapshot};
use flock_engine::{ExecutionCapabilities, FlockSimulation};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Auto,
    Sequential,
    Batch,
}

impl From<BackendArg> for BackendChoice {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => BackendChoice::Auto,
            BackendArg::Sequential => BackendChoice::Sequential,
            BackendArg::Batch => BackendChoice::Batch,
        }
    }
}

/// Headless boid flocking run.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the execution path from the config file
    #[arg(short, long, value_enum)]
    backend: Option<BackendArg>,

    /// Override the number of ticks to run
    #[arg(short, long)]
    steps: Option<u32>,
}

fn main() -> Result<()> {
    // Initialize the logger
    env_logger::init();
    let args = Args::parse();

    info!("Starting flock engine...");

    // --- Load Configuration ---
    let mut config = SimulationConfig::load(&args.config)?;
    if let Some(backend) = args.backend {
        config.execution.backend = backend.into();
    }
    if let Some(steps) = args.steps {
        config.timing.total_steps = steps;
    }

    // --- Resolve capabilities once; they select the path for the whole run ---
    let caps = ExecutionCapabilities::detect();
    info!("Rayon workers: {} (parallel batch available: {}).", caps.worker_threads, caps.parallel_batch);

    let mut sim = FlockSimulation::new(config, caps)?;
    debug!("Flock parameters: {:#?}", sim.params());

    let total_steps = sim.config().timing.total_steps;
    let mut record_interval = sim.config().timing.record_interval_steps;
    if record_interval == 0 {
        warn!("record_interval_steps is 0. Recording every tick.");
        record_interval = 1;
    }

    info!("Starting simulation loop for {} ticks...", total_steps);
    let start_time = Instant::now();
    let mut previous_print_time = start_time;

    sim.record_snapshot()?;

    for step in 0..total_steps {
        let step_start_time = Instant::now();
        let report = sim.step().with_context(|| format!("Simulation tick {} failed", step + 1))?;
        let step_duration = step_start_time.elapsed();

        if let Some(e) = &report.readback_error {
            error!("Tick {}: batch discarded ({}); boids keep stale influences.", step + 1, e);
        }

        let current_time = Instant::now();
        let should_print_status = current_time.duration_since(previous_print_time).as_secs_f64() >= 5.0;
        let is_record_step = (step + 1) % record_interval == 0;
        let is_last_step = step + 1 == total_steps;

        if should_print_status || is_record_step || is_last_step {
            info!(
                "Tick [{}/{}] | Boids: {} | Applied: {} | Failed: {} | Tick Time: {:6.2} ms | Elapsed: {:.2} s",
                step + 1,
                total_steps,
                sim.current_boid_count(),
                sim.batches_applied(),
                sim.batches_failed(),
                step_duration.as_secs_f64() * 1000.0,
                start_time.elapsed().as_secs_f64()
            );
            previous_print_time = current_time;

            if is_record_step || is_last_step {
                sim.record_snapshot()?;
            }
        } else {
            trace!(
                "Tick [{}/{}] completed in {:.2} ms (applied: {}, dispatched: {})",
                step + 1,
                total_steps,
                step_duration.as_secs_f64() * 1000.0,
                report.applied,
                report.dispatched
            );
        }
    }

    // A batch may still be in flight after the last tick.
    if let Some(Err(e)) = sim.drain() {
        error!("Final batch discarded: {}", e);
    }

    let total_duration = start_time.elapsed();
    info!("Simulation finished in {:.3} seconds.", total_duration.as_secs_f64());

    // --- Save Recorded Data ---
    let output = sim.config().output.clone();
    if output.save_stats {
        let format = output.format.as_deref().unwrap_or("json");
        save_snapshots(sim.get_recorded_snapshots(), &output.base_filename, format)?;
    } else {
        info!("Skipping saving snapshots as per config (save_stats is false).");
    }

    if output.save_positions {
        let filename = format!("{}_final_positions.csv", output.base_filename);
        let mut writer = csv::Writer::from_path(&filename)
            .with_context(|| format!("Failed to create CSV file '{}'", filename))?;
        writer.write_record(["x", "y", "z", "heading_x", "heading_y", "heading_z"])?;
        let state = sim.state();
        for (p, h) in state.positions.iter().zip(&state.headings) {
            writer.write_record(&[
                format!("{:.4}", p.x),
                format!("{:.4}", p.y),
                format!("{:.4}", p.z),
                format!("{:.4}", h.x),
                format!("{:.4}", h.y),
                format!("{:.4}", h.z),
            ])?;
        }
        writer.flush()?;
        info!("Final positions saved to {}", filename);
    } else {
        info!("Skipping saving final positions as per config.");
    }

    info!("Simulation Complete.");
    Ok(())
}

/// Writes all recorded snapshots in the requested format, falling back to JSON.
fn save_snapshots(snapshots: &[Snapshot], base_filename: &str, format: &str) -> Result<()> {
    let format = match format {
        "json" | "bincode" | "messagepack" => format,
        other => {
            error!("Unknown output format: {}. Using JSON instead.", other);
            "json"
        }
    };
    let extension = match format {
        "bincode" => "bin",
        "messagepack" => "msgpack",
        _ => "json",
    };
    let filename = format!("{}_snapshots.{}", base_filename, extension);
    let mut writer = BufWriter::new(
        File::create(&filename).with_context(|| format!("Failed to create snapshot file '{}'", filename))?,
    );

    match format {
        "bincode" => bincode::serialize_into(&mut writer, snapshots)
            .with_context(|| format!("Failed to write bincode snapshots to '{}'", filename))?,
        "messagepack" => rmp_serde::encode::write(&mut writer, snapshots)
            .with_context(|| format!("Failed to write MessagePack snapshots to '{}'", filename))?,
        _ => serde_json::to_writer(&mut writer, snapshots)
            .with_context(|| format!("Failed to write JSON snapshots to '{}'", filename))?,
    }
    info!("{} snapshots saved to {} ({} format)", snapshots.len(), filename, format);
    Ok(())
}
