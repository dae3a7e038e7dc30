use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use field_runtime::{probe_registers, run_controller, spawn_signal_listener, SupervisorStats};
use pump_core::config::RegisterKind;
use pump_core::decoder::decode_f32;
use pump_core::{load_config, WordOrder};

#[derive(Parser)]
#[command(name = "pumpctl", version, about = "Field pump controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop until SIGINT/SIGTERM
    Run {
        #[arg(short, long, default_value = "configs/float_switches.toml")]
        config: String,
    },
    /// Read raw registers once and show every word-order interpretation
    Probe {
        #[arg(short, long)]
        config: String,
        /// First register; defaults to the configured sensor address
        #[arg(long)]
        address: Option<u16>,
        #[arg(long, default_value_t = 2)]
        count: u16,
        /// Use input registers (FC04) instead of holding registers
        #[arg(long)]
        input: bool,
    },
    /// Load and validate a config, then print the effective values
    Check {
        #[arg(short, long)]
        config: String,
    },
}

fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("cannot start tokio runtime")?;
    match cli.command {
        Command::Run { config } => runtime.block_on(run(&config)),
        Command::Probe {
            config,
            address,
            count,
            input,
        } => runtime.block_on(probe(&config, address, count, input)),
        Command::Check { config } => check(&config),
    }
}

async fn run(path: &str) -> Result<()> {
    let config = load_config(path).with_context(|| format!("loading {path}"))?;
    info!(
        "starting: sensor={:?} unit {} actuator={:?}",
        config.sensor.kind, config.sensor.unit_id, config.actuator.kind
    );
    let (shutdown, _listener) = spawn_signal_listener();
    let stats = run_controller(config, shutdown).await?;
    display_stats(&stats);
    Ok(())
}

async fn probe(path: &str, address: Option<u16>, count: u16, input: bool) -> Result<()> {
    let config = load_config(path).with_context(|| format!("loading {path}"))?;
    let address = address.unwrap_or(config.sensor.address);
    let kind = if input {
        RegisterKind::Input
    } else {
        RegisterKind::Holding
    };
    let words = probe_registers(&config, address, count.max(2), kind)
        .await
        .with_context(|| format!("reading {kind:?} registers at {address} from unit {}", config.sensor.unit_id))?;

    println!("unit {} {:?} registers from {address}:", config.sensor.unit_id, kind);
    for (i, word) in words.iter().enumerate() {
        println!("  [{}] {:#06x} ({})", address as usize + i, word, word);
    }
    for pair_start in (0..words.len().saturating_sub(1)).step_by(2) {
        let pair = [words[pair_start], words[pair_start + 1]];
        println!("float at {}:", address as usize + pair_start);
        for order in WordOrder::ALL {
            let marker = if config.sensor.word_order == Some(order) { " (configured)" } else { "" };
            println!("  {:<4} {:>16.6}{marker}", order.notation(), decode_f32(pair, order));
        }
    }
    Ok(())
}

fn check(path: &str) -> Result<()> {
    let config = load_config(path).with_context(|| format!("loading {path}"))?;
    println!("{path}: OK");
    println!("{config:#?}");
    Ok(())
}

fn display_stats(stats: &SupervisorStats) {
    println!("\n=== Controller Summary ===");
    println!("Cycles: {}", stats.cycles);
    println!("Poll failures: {}", stats.poll_failures);
    println!("Output writes: {} ({} failed)", stats.output_writes, stats.write_failures);
    println!("Bus resets: {}", stats.bus_resets);
    println!("Manual override alerts: {}", stats.manual_override_alerts);
}
