//! Replays a scenario against the real supervisor on a paused clock.
//!
//! ```text
//! simulator scenarios/restart_delay.toml [transitions.csv]
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{self, Instant};

use field_runtime::sim::{OutputWrite, RecordingActuator, SimFeedback, SimStep, SimulatedSensor};
use field_runtime::{Supervisor, SupervisorStats};
use pump_core::{load_config, AppConfig, TransitionRecord, WordOrder};

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FeedbackMode {
    #[default]
    None,
    Follow,
    StuckOn,
}

impl From<FeedbackMode> for SimFeedback {
    fn from(mode: FeedbackMode) -> Self {
        match mode {
            FeedbackMode::None => SimFeedback::None,
            FeedbackMode::Follow => SimFeedback::Follow,
            FeedbackMode::StuckOn => SimFeedback::Fixed(true),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Scenario {
    /// Controller config, relative to the scenario file.
    config: PathBuf,
    duration_secs: u64,
    #[serde(default)]
    feedback: FeedbackMode,
    /// Diagnostic button presses, seconds from start.
    #[serde(default)]
    diagnostic_presses: Vec<f64>,
    steps: Vec<SimStep>,
}

struct Outcome {
    stats: SupervisorStats,
    transitions: Vec<TransitionRecord>,
    writes: Vec<OutputWrite>,
}

fn load_scenario(path: &Path) -> Result<(Scenario, AppConfig)> {
    let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let scenario: Scenario =
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    if scenario.steps.is_empty() {
        bail!("{}: scenario has no steps", path.display());
    }
    let config_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&scenario.config);
    let config_path = config_path.to_string_lossy();
    let config = load_config(&config_path).with_context(|| format!("loading {config_path}"))?;
    Ok((scenario, config))
}

async fn simulate(scenario: &Scenario, config: &AppConfig, csv_path: &str) -> Result<Outcome> {
    let word_order = config.sensor.word_order.unwrap_or(WordOrder::HighLow);
    let sensor = SimulatedSensor::new(scenario.steps.clone(), word_order);
    let actuator = RecordingActuator::new(scenario.feedback.into());
    let writes = actuator.writes();

    let (press_tx, press_rx) = watch::channel(0u64);
    let supervisor = Supervisor::new(config, Box::new(sensor), Box::new(actuator))
        .with_diagnostic_input(press_rx);
    let transitions = supervisor.transition_log();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let start = Instant::now();
    let handle = tokio::spawn(supervisor.run(shutdown_rx));

    let mut presses = scenario.diagnostic_presses.clone();
    presses.sort_by(f64::total_cmp);
    for at in presses.into_iter().filter(|at| *at >= 0.0) {
        time::sleep_until(start + Duration::from_secs_f64(at)).await;
        info!("diagnostic button pressed at {at}s");
        press_tx.send_modify(|count| *count += 1);
    }

    time::sleep_until(start + Duration::from_secs(scenario.duration_secs)).await;
    shutdown_tx.send(true).context("supervisor stopped early")?;
    let stats = handle.await.context("supervisor task panicked")?;

    transitions.save_to_csv(csv_path)?;
    let writes = writes
        .lock()
        .map(|w| w.clone())
        .unwrap_or_default();
    Ok(Outcome {
        stats,
        transitions: transitions.get_results(),
        writes,
    })
}

fn display_outcome(outcome: &Outcome, duration_secs: u64) {
    println!("\n=== Simulation Summary ({duration_secs}s simulated) ===");
    let stats = &outcome.stats;
    println!("Cycles: {}", stats.cycles);
    println!("Poll failures: {}", stats.poll_failures);
    println!("Bus resets: {}", stats.bus_resets);
    println!("Manual override alerts: {}", stats.manual_override_alerts);

    let on_secs = on_time(&outcome.writes, Duration::from_secs(duration_secs));
    println!(
        "Pump on-time: {:.0}s ({:.1}%)",
        on_secs.as_secs_f64(),
        on_secs.as_secs_f64() / duration_secs.max(1) as f64 * 100.0
    );

    println!("\nTransitions:");
    for record in &outcome.transitions {
        println!(
            "  {:>9.1}s  {:<13} -> {:<13} {:<22} {}",
            record.at_secs,
            record.from.to_string(),
            record.to.to_string(),
            record.reason.as_str(),
            record.reading.as_deref().unwrap_or("-")
        );
    }

    println!("\nOutput writes:");
    for write in &outcome.writes {
        println!("  {:>9.1}s  {}", write.at.as_secs_f64(), if write.on { "ON" } else { "OFF" });
    }
}

/// Total time the output was commanded on before `end`.
fn on_time(writes: &[OutputWrite], end: Duration) -> Duration {
    let mut total = Duration::ZERO;
    let mut on_since = None;
    for write in writes {
        match (write.on, on_since) {
            (true, None) => on_since = Some(write.at),
            (false, Some(since)) => {
                total += write.at.saturating_sub(since);
                on_since = None;
            }
            _ => {}
        }
    }
    if let Some(since) = on_since {
        total += end.saturating_sub(since);
    }
    total
}

fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let args: Vec<String> = env::args().collect();
    let Some(scenario_path) = args.get(1) else {
        let program = args.first().map(String::as_str).unwrap_or("simulator");
        bail!("usage: {program} <scenario.toml> [transitions.csv]");
    };
    let csv_path = args.get(2).map(String::as_str).unwrap_or("transitions.csv");

    let (scenario, config) = load_scenario(Path::new(scenario_path))?;
    info!(
        "scenario {scenario_path}: {} steps over {}s",
        scenario.steps.len(),
        scenario.duration_secs
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .context("cannot build paused runtime")?;
    let outcome = runtime.block_on(simulate(&scenario, &config, csv_path))?;

    display_outcome(&outcome, scenario.duration_secs);
    println!("\nTransitions saved to {csv_path}");
    Ok(())
}
