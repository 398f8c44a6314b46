// blescan — duty-cycled BLE scanning from the command line
//
// Runs the scan engine against a simulated radio and manages the CLI's
// persistent configuration.

mod config;
mod simulator;

use anyhow::{Context, Result};
use blescan_core::{
    CycleTiming, DeliveryPolicy, MatchKind, ScanEngine, ScanSettings, ScanSink, Sighting, ThreadWakeFacility,
};
use clap::{Parser, Subcommand};
use colored::*;
use parking_lot::Mutex;
use serde::Serialize;
use simulator::{make_devices, SimulatedRadio};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Parser)]
#[command(name = "blescan")]
#[command(about = "Duty-cycled BLE advertisement scanning", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against a simulated radio
    Simulate {
        /// Number of simulated advertisers
        #[arg(short, long)]
        devices: Option<usize>,
        /// Duty cycles to run before exiting
        #[arg(short, long)]
        cycles: Option<u32>,
        /// Power mode: low-power, balanced or low-latency
        #[arg(short, long)]
        mode: Option<String>,
        /// Custom active window in milliseconds (0 pauses the radio)
        #[arg(long, requires = "idle_ms")]
        active_ms: Option<u64>,
        /// Custom idle period in milliseconds
        #[arg(long, requires = "active_ms")]
        idle_ms: Option<u64>,
        /// Absolute staleness cutoff in milliseconds
        #[arg(long)]
        lost_ms: Option<u64>,
        /// Cycle after which half of the devices stop advertising
        #[arg(long)]
        vanish_after: Option<u32>,
        /// Simulate a radio with hardware filter offload
        #[arg(long)]
        native: bool,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show all settings
    Show,
    /// Restore defaults
    Reset,
    Set { key: String, value: String },
    Get { key: String },
    /// Print the config file location
    Path,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            devices,
            cycles,
            mode,
            active_ms,
            idle_ms,
            lost_ms,
            vanish_after,
            native,
            json,
        } => cmd_simulate(SimulateArgs {
            devices,
            cycles,
            mode,
            timing: active_ms.zip(idle_ms).map(|(a, i)| CycleTiming::new(a, i)),
            lost_ms,
            vanish_after,
            native,
            json,
        }),
        Commands::Config { action } => cmd_config(action),
    }
}

// ============================================================================
// SIMULATE
// ============================================================================

struct SimulateArgs {
    devices: Option<usize>,
    cycles: Option<u32>,
    mode: Option<String>,
    timing: Option<CycleTiming>,
    lost_ms: Option<u64>,
    vanish_after: Option<u32>,
    native: bool,
    json: bool,
}

#[derive(Serialize)]
struct EventLine<'a> {
    event: &'a str,
    address: &'a str,
    rssi: i32,
    name: Option<&'a str>,
    observed_at_ms: u64,
}

/// Demo consumer printing every callback
struct EventPrinter {
    json: bool,
    cycles: Mutex<mpsc::Sender<()>>,
}

impl ScanSink for EventPrinter {
    fn on_match(&self, kind: MatchKind, sighting: &Sighting) {
        let name = sighting.record.device_name.as_deref();
        if self.json {
            let line = EventLine {
                event: match kind {
                    MatchKind::FirstMatch => "first_match",
                    MatchKind::AllMatches => "all_matches",
                    MatchKind::MatchLost => "match_lost",
                },
                address: &sighting.address,
                rssi: sighting.rssi,
                name,
                observed_at_ms: sighting.observed_at_nanos / 1_000_000,
            };
            if let Ok(text) = serde_json::to_string(&line) {
                println!("{}", text);
            }
            return;
        }

        let label = match kind {
            MatchKind::FirstMatch => "FOUND".green().bold(),
            MatchKind::AllMatches => "SEEN ".normal(),
            MatchKind::MatchLost => "LOST ".red().bold(),
        };
        println!(
            "  {} {} {:>4} dBm  {}",
            label,
            sighting.address.bright_cyan(),
            sighting.rssi,
            name.unwrap_or("-").dimmed()
        );
    }

    fn on_cycle_complete(&self) {
        let _ = self.cycles.lock().send(());
    }

    fn on_scan_failed(&self, reason: &blescan_core::RadioError) {
        eprintln!("{} Scan failed: {}", "✗".red(), reason);
    }
}

fn cmd_simulate(args: SimulateArgs) -> Result<()> {
    let config = config::Config::load()?;
    let mut engine_config = config.engine.clone();
    if let Some(timing) = args.timing {
        engine_config.custom_timing = Some(timing);
    }
    if let Some(lost_ms) = args.lost_ms {
        engine_config.lost_override_ms = Some(lost_ms);
    }

    let devices = args.devices.unwrap_or(config.simulation.devices);
    let cycles = args.cycles.unwrap_or(config.simulation.cycles);
    let vanish_after = args.vanish_after.or(config.simulation.vanish_after);
    let mode = match &args.mode {
        Some(mode) => config::parse_mode(mode)?,
        None => config.simulation.mode,
    };

    let radio = Arc::new(SimulatedRadio::new(
        make_devices(devices),
        Duration::from_millis(config.simulation.advertise_interval_ms.max(1)),
        args.native,
    ));
    let wake = Arc::new(ThreadWakeFacility::spawn().context("Failed to start wake thread")?);
    let engine = ScanEngine::new(engine_config, radio.clone(), wake).context("Failed to create scan engine")?;
    let _pump = engine.spawn_sighting_pump()?;

    let (tx, rx) = mpsc::channel();
    let printer = Arc::new(EventPrinter {
        json: args.json,
        cycles: Mutex::new(tx),
    });
    let settings = ScanSettings::new(mode, DeliveryPolicy::ALL_MATCHES);
    let client = engine
        .register_client(Vec::new(), settings, printer)
        .context("Failed to start scanning")?;

    let status = engine.status();
    if !args.json {
        println!("{}", "Simulating BLE scan".bold());
        println!("  {:<12} {:?}", "backend".bright_cyan(), status.backend);
        println!("  {:<12} {}", "mode".bright_cyan(), mode);
        if let Some(timing) = status.timing {
            println!(
                "  {:<12} {}ms active / {}ms idle ({}%)",
                "timing".bright_cyan(),
                timing.active_ms,
                timing.idle_ms,
                timing.duty_cycle_percent()
            );
        }
        println!("  {:<12} {}ms", "lost after".bright_cyan(), status.lost_threshold_ms);
        println!("  {:<12} {}", "devices".bright_cyan(), devices);
        println!();
    }

    let cycle_budget = status
        .timing
        .map(|t| Duration::from_millis(t.cycle_ms()))
        .unwrap_or_default()
        + Duration::from_secs(5);
    let started = Instant::now();
    for cycle in 1..=cycles {
        rx.recv_timeout(cycle_budget)
            .with_context(|| format!("Cycle {} did not complete", cycle))?;
        if !args.json {
            println!(
                "{} cycle {}/{} ({} cached)",
                "·".dimmed(),
                cycle,
                cycles,
                engine.status().cached_sightings
            );
        }
        if vanish_after == Some(cycle) {
            radio.vanish_transient();
            if !args.json {
                println!("{} transient devices stopped advertising", "!".yellow());
            }
        }
    }

    engine.unregister_client(client)?;
    let recent = engine.get_matching_recent(&[]);

    if args.json {
        println!("{}", serde_json::to_string(&engine.status())?);
    } else {
        println!();
        println!("{}", "Summary".bold());
        println!("  {:<12} {}", "cycles".bright_cyan(), cycles);
        println!("  {:<12} {:.1}s", "elapsed".bright_cyan(), started.elapsed().as_secs_f64());
        println!("  {:<12} {}", "cached".bright_cyan(), recent.len());
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        for sighting in recent {
            println!(
                "    {} {:>4} dBm  {}ms ago",
                sighting.address,
                sighting.rssi,
                sighting.age_nanos(now) / 1_000_000
            );
        }
    }

    Ok(())
}

// ============================================================================
// CONFIG
// ============================================================================

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = config::Config::load()?;
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<26} {}", key.bright_cyan(), value);
            }
            println!();
            println!("{}", "Mode timing".bold());
            for mode in blescan_core::PowerMode::ALL {
                let timing = config.engine.timing_for(mode);
                println!(
                    "  {:<26} {}ms / {}ms",
                    mode.to_string().bright_cyan(),
                    timing.active_ms,
                    timing.idle_ms
                );
            }
            if let Some(custom) = config.engine.custom_timing {
                println!(
                    "  {:<26} {}ms / {}ms",
                    "custom".bright_cyan(),
                    custom.active_ms,
                    custom.idle_ms
                );
            }
        }

        ConfigAction::Reset => {
            config::Config::default().save()?;
            println!("{} Configuration reset to defaults", "✓".green());
        }

        ConfigAction::Set { key, value } => {
            let mut config = config::Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            let config = config::Config::load()?;
            match config.get(&key) {
                Some(value) => println!("{} = {}", key.bright_cyan(), value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
