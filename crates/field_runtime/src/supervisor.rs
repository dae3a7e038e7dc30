//! The control loop: one strictly sequential cycle at a time.
//!
//! Each cycle reads the diagnostic press count, polls the sensor once,
//! updates comm health, evaluates the state machine, drives the output, then
//! checks feedback and bus-reset requests. The wait before the next cycle
//! depends on what the cycle saw.

use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::time;

use pump_core::control::CycleInputs;
use pump_core::{
    AcquisitionError, Acquisition, ActuatorDriver, ActuatorMode, ActuatorPort, AppConfig,
    CommHealth, ControlStateMachine, Decision, DiagnosticWindow, PollOutcome, SensorPort,
    SensorReading, SensorValue, TransitionLog,
};

const TRANSITION_LOG_CAPACITY: usize = 1024;
const SHUTDOWN_WRITE_ATTEMPTS: u32 = 3;

/// Current time on the tokio clock, so a paused runtime drives the core too.
fn clock_now() -> Instant {
    time::Instant::now().into_std()
}

#[derive(Debug, Clone, Copy)]
struct Cadence {
    poll: Duration,
    degraded_poll: Duration,
    diagnostic_poll: Duration,
    backoff: Duration,
    backoff_max: Duration,
}

/// Running totals, returned when the loop ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub cycles: u64,
    pub poll_failures: u64,
    pub output_writes: u64,
    pub write_failures: u64,
    pub manual_override_alerts: u64,
    pub bus_resets: u64,
}

/// What one cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub poll_error: Option<AcquisitionError>,
    pub decision: Decision,
    /// A write reached the actuator this cycle.
    pub wrote: bool,
    pub manual_override: bool,
    pub diagnostic: bool,
    /// Backoff to wait after a bus reset, instead of the poll interval.
    pub bus_reset_backoff: Option<Duration>,
}

pub struct Supervisor {
    sensor: Box<dyn SensorPort>,
    actuator: ActuatorDriver,
    acquisition: Acquisition,
    health: CommHealth,
    control: ControlStateMachine,
    diagnostic: DiagnosticWindow,
    diagnostic_presses: Option<watch::Receiver<u64>>,
    seen_presses: u64,
    cadence: Cadence,
    transitions: TransitionLog,
    stats: SupervisorStats,
}

impl Supervisor {
    pub fn new(
        config: &AppConfig,
        sensor: Box<dyn SensorPort>,
        actuator: Box<dyn ActuatorPort>,
    ) -> Self {
        let now = clock_now();
        let control = &config.control;
        Self {
            sensor,
            actuator: ActuatorDriver::new(actuator),
            acquisition: Acquisition::new(config.sensor.clone(), control.staleness_timeout()),
            health: CommHealth::new(control.max_consecutive_failures),
            control: ControlStateMachine::new(control, now),
            diagnostic: DiagnosticWindow::new(config.diagnostic.window()),
            diagnostic_presses: None,
            seen_presses: 0,
            cadence: Cadence {
                poll: control.poll_interval(),
                degraded_poll: control.degraded_poll_interval(),
                diagnostic_poll: config.diagnostic.poll_interval(),
                backoff: control.reconnect_backoff(),
                backoff_max: control.reconnect_backoff_max(),
            },
            transitions: TransitionLog::new(TRANSITION_LOG_CAPACITY, now),
            stats: SupervisorStats::default(),
        }
    }

    /// Attach the press counter published by the diagnostic watcher.
    pub fn with_diagnostic_input(mut self, presses: watch::Receiver<u64>) -> Self {
        self.seen_presses = *presses.borrow();
        self.diagnostic_presses = Some(presses);
        self
    }

    /// Shared handle on the transition journal.
    pub fn transition_log(&self) -> TransitionLog {
        self.transitions.clone()
    }

    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    pub fn mode(&self) -> ActuatorMode {
        self.control.state().mode
    }

    /// Log the starting point. The software model starts `Off`; the first
    /// cycle writes whatever it decides, so a contactor left on is corrected.
    pub async fn startup(&mut self) {
        let feedback = self.actuator.feedback().await;
        if feedback == Some(true) {
            warn!("actuator feedback reports ON at startup; model starts OFF and the first cycle will command it");
        }
        info!(
            "supervisor started: mode={} poll={}s degraded_poll={}s",
            self.control.state().mode,
            self.cadence.poll.as_secs(),
            self.cadence.degraded_poll.as_secs()
        );
    }

    /// Run one full cycle.
    pub async fn cycle(&mut self) -> CycleReport {
        let now = clock_now();
        self.stats.cycles += 1;

        let diagnostic = self.check_diagnostic(now);

        let (reading, poll_error) = match self.acquisition.poll(self.sensor.as_mut(), now).await {
            Ok(reading) => {
                self.health.record(PollOutcome::Success, now);
                (Some(reading), None)
            }
            Err(err) => {
                self.stats.poll_failures += 1;
                warn!("poll failed: {err}");
                self.health.record(PollOutcome::Failure, now);
                (self.acquisition.after_failed_poll(), Some(err))
            }
        };

        let decision = self.control.decide(
            CycleInputs {
                reading: reading.as_ref(),
                health: self.health.snapshot(),
                diagnostic,
            },
            now,
        );
        for transition in &decision.transitions {
            self.transitions
                .record(transition, reading.as_ref().map(describe_reading));
        }

        let wrote = match self.actuator.apply(decision.output).await {
            Ok(wrote) => {
                if wrote {
                    self.stats.output_writes += 1;
                }
                wrote
            }
            Err(err) => {
                self.stats.write_failures += 1;
                error!("cannot drive output to {}: {err}", on_off(decision.output));
                false
            }
        };

        let manual_override = self.check_feedback(decision.output).await;

        let bus_reset_backoff = if self.health.should_reset_bus() {
            Some(self.reset_bus().await)
        } else {
            None
        };

        CycleReport {
            poll_error,
            decision,
            wrote,
            manual_override,
            diagnostic,
            bus_reset_backoff,
        }
    }

    /// Wait before the next cycle, given what the last one saw.
    pub fn next_interval(&self, report: &CycleReport) -> Duration {
        if let Some(backoff) = report.bus_reset_backoff {
            return backoff;
        }
        let base = if report.poll_error.is_some() || self.health.degraded() {
            self.cadence.degraded_poll
        } else {
            self.cadence.poll
        };
        if report.diagnostic {
            base.min(self.cadence.diagnostic_poll)
        } else {
            base
        }
    }

    /// Cycle until `shutdown` turns true (or its sender goes away), then
    /// write the final Off.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SupervisorStats {
        self.startup().await;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.cycle().await;
            let wait = self.next_interval(&report);
            tokio::select! {
                _ = time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("shutdown channel closed");
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
        self.stats
    }

    /// One unconditional Off, retried only if the write itself fails.
    pub async fn shutdown(&mut self) {
        let now = clock_now();
        if let Some(transition) = self.control.shutdown(now) {
            self.transitions.record(&transition, None);
        }
        for attempt in 1..=SHUTDOWN_WRITE_ATTEMPTS {
            match self.actuator.force(false).await {
                Ok(()) => {
                    self.stats.output_writes += 1;
                    info!("final OFF written (SHUTDOWN)");
                    return;
                }
                Err(err) => {
                    self.stats.write_failures += 1;
                    error!("final OFF attempt {attempt}/{SHUTDOWN_WRITE_ATTEMPTS} failed: {err}");
                }
            }
        }
    }

    fn check_diagnostic(&mut self, now: Instant) -> bool {
        if let Some(presses) = &self.diagnostic_presses {
            let count = *presses.borrow();
            if count != self.seen_presses {
                self.seen_presses = count;
                self.diagnostic.trigger(now);
            }
        }
        self.diagnostic.expire(now)
    }

    async fn check_feedback(&mut self, commanded: bool) -> bool {
        let feedback = self.actuator.feedback().await;
        if feedback == Some(true) && !commanded {
            self.stats.manual_override_alerts += 1;
            warn!("MANUAL_OVERRIDE: actuator reports ON while commanded OFF");
            return true;
        }
        false
    }

    async fn reset_bus(&mut self) -> Duration {
        let resets = self.health.resets_since_success();
        let backoff = self
            .cadence
            .backoff
            .saturating_mul(2u32.saturating_pow(resets.min(16)))
            .min(self.cadence.backoff_max);
        warn!(
            "resetting field bus (reset #{} since last success), reconnecting in {}s",
            resets + 1,
            backoff.as_secs()
        );
        self.sensor.reset().await;
        self.health.bus_reset_done();
        self.stats.bus_resets += 1;
        backoff
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

fn describe_reading(reading: &SensorReading) -> String {
    match reading.value {
        SensorValue::Discrete(pair) => format!(
            "low={} high={} ({:?})",
            u8::from(pair.low_switch),
            u8::from(pair.high_switch),
            reading.quality
        ),
        SensorValue::Analog(analog) => format!(
            "{:.2} ({:.1}%, {:?})",
            analog.value, analog.level_percent, reading.quality
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{RecordingActuator, SimCondition, SimFeedback, SimStep, SimulatedSensor};
    use pump_core::WordOrder;

    const CONFIG: &str = r#"
        [bus]
        transport = "rtu"
        device = "/dev/null"

        [sensor]
        kind = "float_switches"
        unit_id = 32

        [actuator]
        kind = "coil"
        unit_id = 31

        [control]
        min_off_time_secs = 180
        max_consecutive_failures = 3
        staleness_timeout_secs = 60
        poll_interval_secs = 12
        degraded_poll_interval_secs = 1
        reconnect_backoff_secs = 8
        reconnect_backoff_max_secs = 20

        [diagnostic]
        window_secs = 60
        poll_interval_secs = 2
    "#;

    fn supervisor(steps: Vec<SimStep>) -> Supervisor {
        let config = AppConfig::from_toml(CONFIG).unwrap();
        Supervisor::new(
            &config,
            Box::new(SimulatedSensor::new(steps, WordOrder::HighLow)),
            Box::new(RecordingActuator::new(SimFeedback::None)),
        )
    }

    fn empty() -> SimCondition {
        SimCondition::Switches { low: false, high: false }
    }

    #[tokio::test(start_paused = true)]
    async fn cadence_follows_health() {
        let mut sup = supervisor(vec![SimStep::new(0.0, empty()), SimStep::new(5.0, SimCondition::Offline)]);
        let report = sup.cycle().await;
        assert_eq!(sup.next_interval(&report), Duration::from_secs(12));

        time::advance(Duration::from_secs(12)).await;
        let report = sup.cycle().await;
        assert!(report.poll_error.is_some());
        assert_eq!(sup.next_interval(&report), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_caps() {
        let mut sup = supervisor(vec![SimStep::new(0.0, SimCondition::Offline)]);
        let mut backoffs = Vec::new();
        for _ in 0..9 {
            let report = sup.cycle().await;
            if let Some(backoff) = report.bus_reset_backoff {
                backoffs.push(backoff.as_secs());
            }
            time::advance(sup.next_interval(&report)).await;
        }
        assert_eq!(backoffs, vec![8, 16, 20]);
        assert_eq!(sup.stats().bus_resets, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn diagnostic_press_shortens_cadence_until_expiry() {
        let (tx, rx) = watch::channel(0u64);
        let mut sup = supervisor(vec![SimStep::new(0.0, empty())]).with_diagnostic_input(rx);

        let report = sup.cycle().await;
        assert!(!report.diagnostic);

        tx.send_replace(1);
        time::advance(Duration::from_secs(12)).await;
        let report = sup.cycle().await;
        assert!(report.diagnostic);
        assert_eq!(sup.next_interval(&report), Duration::from_secs(2));

        time::advance(Duration::from_secs(61)).await;
        let report = sup.cycle().await;
        assert!(!report.diagnostic);
        assert_eq!(sup.next_interval(&report), Duration::from_secs(12));
    }

    #[test]
    fn describes_readings() {
        let reading = SensorReading {
            value: SensorValue::Discrete(pump_core::DiscretePair {
                low_switch: true,
                high_switch: false,
            }),
            timestamp: Instant::now(),
            quality: pump_core::Quality::Fresh,
        };
        assert_eq!(describe_reading(&reading), "low=1 high=0 (Fresh)");
    }
}
