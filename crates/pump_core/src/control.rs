//! Actuator control state machine.
//!
//! ```text
//!            TANK_EMPTY                 TANK_FULL
//!   Off ─────────────────▶ Running ─────────────────▶ RestartDelay
//!    ▲                        │                            │
//!    │                        │ SENSOR_INCONSISTENT        │ RESTART_DELAY_ELAPSED
//!    │                        ▼                            │
//!    └──── SENSOR_RECOVERED ─ Fault                        └──────────▶ Off
//!
//!   any ── COMM_FAILURE ──▶ RestartDelay   (priority over every other rule)
//! ```
//!
//! The restart deadline is armed whenever the output goes from ON to OFF and
//! whenever a comm failure forces the fail-safe; no start is issued before it
//! passes. `Off` therefore always means "free to start".

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{ControlConfig, ThresholdDirection};
use crate::health::CommHealthState;
use crate::{Quality, SensorReading, SensorValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActuatorMode {
    Off,
    Running,
    RestartDelay,
    Fault,
}

impl ActuatorMode {
    /// Output level this mode commands.
    pub fn output(self) -> bool {
        self == ActuatorMode::Running
    }
}

impl fmt::Display for ActuatorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActuatorMode::Off => "OFF",
            ActuatorMode::Running => "RUNNING",
            ActuatorMode::RestartDelay => "RESTART_DELAY",
            ActuatorMode::Fault => "FAULT",
        };
        f.write_str(name)
    }
}

/// Stable reason code attached to every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Startup,
    TankFull,
    TankEmpty,
    SensorInconsistent,
    CommFailure,
    RestartDelayElapsed,
    SensorRecovered,
    Shutdown,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Startup => "STARTUP",
            ReasonCode::TankFull => "TANK_FULL",
            ReasonCode::TankEmpty => "TANK_EMPTY",
            ReasonCode::SensorInconsistent => "SENSOR_INCONSISTENT",
            ReasonCode::CommFailure => "COMM_FAILURE",
            ReasonCode::RestartDelayElapsed => "RESTART_DELAY_ELAPSED",
            ReasonCode::SensorRecovered => "SENSOR_RECOVERED",
            ReasonCode::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorState {
    pub mode: ActuatorMode,
    pub last_transition: Instant,
    pub last_reason: ReasonCode,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub at: Instant,
    pub from: ActuatorMode,
    pub to: ActuatorMode,
    pub reason: ReasonCode,
}

/// Per-cycle inputs, read once at the top of the cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleInputs<'a> {
    /// `None` when no reading (fresh or cached) is available.
    pub reading: Option<&'a SensorReading>,
    pub health: CommHealthState,
    pub diagnostic: bool,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Output level to hold at the actuator.
    pub output: bool,
    pub mode: ActuatorMode,
    /// Transitions taken this cycle, oldest first. Usually zero or one.
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Empty,
    Intermediate,
    Full,
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    direction: ThresholdDirection,
    start: f64,
    stop: f64,
}

pub struct ControlStateMachine {
    state: ActuatorState,
    min_off_time: Duration,
    thresholds: Option<Thresholds>,
    fault_exit_honors_restart_delay: bool,
    restart_not_before: Option<Instant>,
}

impl ControlStateMachine {
    pub fn new(config: &ControlConfig, now: Instant) -> Self {
        let thresholds = match (config.start_threshold, config.stop_threshold) {
            (Some(start), Some(stop)) => Some(Thresholds {
                direction: config.direction,
                start,
                stop,
            }),
            _ => None,
        };
        Self {
            state: ActuatorState {
                mode: ActuatorMode::Off,
                last_transition: now,
                last_reason: ReasonCode::Startup,
            },
            min_off_time: config.min_off_time(),
            thresholds,
            fault_exit_honors_restart_delay: config.fault_exit_honors_restart_delay,
            restart_not_before: None,
        }
    }

    pub fn state(&self) -> ActuatorState {
        self.state
    }

    /// Time left before a start may be issued.
    pub fn restart_remaining(&self, now: Instant) -> Duration {
        self.restart_not_before
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Evaluate one cycle. Re-evaluates from scratch every call; the
    /// returned output is idempotent across cycles with the same inputs.
    pub fn decide(&mut self, inputs: CycleInputs<'_>, now: Instant) -> Decision {
        let mut transitions = Vec::new();

        if inputs.health.degraded {
            self.fail_safe(now, &mut transitions);
        } else {
            self.evaluate(inputs.reading, now, &mut transitions);
        }

        let decision = Decision {
            output: self.state.mode.output(),
            mode: self.state.mode,
            transitions,
        };
        if inputs.diagnostic {
            info!(
                "[diag] mode={} output={} reading={:?} failures={} restart_in={}s",
                decision.mode,
                if decision.output { "ON" } else { "OFF" },
                inputs.reading.map(|r| (r.value, r.quality)),
                inputs.health.consecutive_failures,
                self.restart_remaining(now).as_secs()
            );
        } else {
            debug!("mode={} output={}", decision.mode, decision.output);
        }
        decision
    }

    /// Force the output off on shutdown.
    pub fn shutdown(&mut self, now: Instant) -> Option<Transition> {
        if self.state.mode == ActuatorMode::Off {
            return None;
        }
        let mut transitions = Vec::with_capacity(1);
        self.enter(ActuatorMode::Off, ReasonCode::Shutdown, now, &mut transitions);
        transitions.pop()
    }

    fn fail_safe(&mut self, now: Instant, transitions: &mut Vec<Transition>) {
        let already = self.state.mode == ActuatorMode::RestartDelay
            && self.state.last_reason == ReasonCode::CommFailure;
        if !already {
            self.arm_restart_delay(now);
            self.enter(ActuatorMode::RestartDelay, ReasonCode::CommFailure, now, transitions);
        }
    }

    fn evaluate(
        &mut self,
        reading: Option<&SensorReading>,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        if let Some(reading) = reading.filter(|r| r.quality == Quality::Invalid) {
            if self.state.mode != ActuatorMode::Fault {
                warn!("rejecting impossible reading {:?}", reading.value);
                self.enter(ActuatorMode::Fault, ReasonCode::SensorInconsistent, now, transitions);
            }
            return;
        }

        // Stale or missing readings never authorize a start, nor a fault exit.
        let level = reading
            .filter(|r| r.quality == Quality::Fresh)
            .map(|r| self.level(&r.value));

        if self.state.mode == ActuatorMode::Fault {
            if level.is_none() {
                return;
            }
            if self.fault_exit_honors_restart_delay {
                self.arm_restart_delay(now);
            }
            let next = if self.restart_remaining(now).is_zero() {
                ActuatorMode::Off
            } else {
                ActuatorMode::RestartDelay
            };
            self.enter(next, ReasonCode::SensorRecovered, now, transitions);
        }

        if self.state.mode == ActuatorMode::RestartDelay && self.restart_remaining(now).is_zero() {
            self.enter(ActuatorMode::Off, ReasonCode::RestartDelayElapsed, now, transitions);
        }

        match (level, self.state.mode) {
            (Some(Level::Full), ActuatorMode::Running) => {
                self.enter(ActuatorMode::RestartDelay, ReasonCode::TankFull, now, transitions);
            }
            (Some(Level::Empty), ActuatorMode::Off) if self.restart_remaining(now).is_zero() => {
                self.enter(ActuatorMode::Running, ReasonCode::TankEmpty, now, transitions);
            }
            (Some(Level::Empty), ActuatorMode::RestartDelay) => {
                debug!(
                    "start held by restart delay, {}s left",
                    self.restart_remaining(now).as_secs()
                );
            }
            _ => {}
        }
    }

    fn level(&self, value: &SensorValue) -> Level {
        match value {
            SensorValue::Discrete(pair) => match (pair.low_switch, pair.high_switch) {
                (false, false) => Level::Empty,
                (true, false) => Level::Intermediate,
                // (false, true) only arrives here when configured to mean full.
                (_, true) => Level::Full,
            },
            SensorValue::Analog(analog) => {
                let Some(t) = self.thresholds else {
                    return Level::Intermediate;
                };
                let v = analog.value;
                let (empty, full) = match t.direction {
                    ThresholdDirection::Fill => (v <= t.start, v >= t.stop),
                    ThresholdDirection::Drain => (v >= t.start, v <= t.stop),
                };
                if empty {
                    Level::Empty
                } else if full {
                    Level::Full
                } else {
                    Level::Intermediate
                }
            }
        }
    }

    fn arm_restart_delay(&mut self, now: Instant) {
        let deadline = now + self.min_off_time;
        self.restart_not_before = Some(match self.restart_not_before {
            Some(current) if current > deadline => current,
            _ => deadline,
        });
    }

    fn enter(
        &mut self,
        to: ActuatorMode,
        reason: ReasonCode,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) {
        let from = self.state.mode;
        if from == ActuatorMode::Running && to != ActuatorMode::Running {
            self.arm_restart_delay(now);
        }
        self.state = ActuatorState {
            mode: to,
            last_transition: now,
            last_reason: reason,
        };
        info!("actuator {from} -> {to} ({reason})");
        transitions.push(Transition {
            at: now,
            from,
            to,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ThresholdDirection};
    use crate::{AnalogFloat, DiscretePair};

    const MIN_OFF: u64 = 180;

    struct Rig {
        sm: ControlStateMachine,
        t0: Instant,
    }

    impl Rig {
        fn switches() -> Self {
            let config = AppConfig::from_toml(crate::config::tests::SWITCHES).unwrap();
            Self::with(&config.control)
        }

        fn pressure(direction: ThresholdDirection, start: f64, stop: f64) -> Self {
            let config = AppConfig::from_toml(crate::config::tests::PRESSURE).unwrap();
            let mut control = config.control;
            control.direction = direction;
            control.start_threshold = Some(start);
            control.stop_threshold = Some(stop);
            Self::with(&control)
        }

        fn with(control: &ControlConfig) -> Self {
            let t0 = Instant::now();
            Self {
                sm: ControlStateMachine::new(control, t0),
                t0,
            }
        }

        fn at(&self, secs: u64) -> Instant {
            self.t0 + Duration::from_secs(secs)
        }

        fn step(&mut self, secs: u64, reading: Option<SensorReading>, degraded: bool) -> Decision {
            let now = self.at(secs);
            let health = CommHealthState {
                consecutive_failures: if degraded { 10 } else { 0 },
                last_success: None,
                degraded,
            };
            self.sm.decide(
                CycleInputs {
                    reading: reading.as_ref(),
                    health,
                    diagnostic: false,
                },
                now,
            )
        }

        fn switches_at(&mut self, secs: u64, low: bool, high: bool) -> Decision {
            let quality = if !low && high { Quality::Invalid } else { Quality::Fresh };
            let reading = switch_reading(self.at(secs), low, high, quality);
            self.step(secs, Some(reading), false)
        }
    }

    fn switch_reading(at: Instant, low: bool, high: bool, quality: Quality) -> SensorReading {
        SensorReading {
            value: SensorValue::Discrete(DiscretePair {
                low_switch: low,
                high_switch: high,
            }),
            timestamp: at,
            quality,
        }
    }

    fn analog(at: Instant, value: f64) -> SensorReading {
        SensorReading {
            value: SensorValue::Analog(AnalogFloat {
                value,
                level_percent: value,
            }),
            timestamp: at,
            quality: Quality::Fresh,
        }
    }

    #[test]
    fn starts_on_empty_and_stops_on_full() {
        let mut rig = Rig::switches();
        let d = rig.switches_at(0, false, false);
        assert!(d.output);
        assert_eq!(d.transitions[0].reason, ReasonCode::TankEmpty);

        let d = rig.switches_at(12, true, true);
        assert!(!d.output);
        assert_eq!(d.mode, ActuatorMode::RestartDelay);
        assert_eq!(rig.sm.state().last_reason, ReasonCode::TankFull);
    }

    #[test]
    fn intermediate_band_holds_state() {
        let mut rig = Rig::switches();
        rig.switches_at(0, false, false);
        let d = rig.switches_at(12, true, false);
        assert!(d.output);
        assert!(d.transitions.is_empty());

        let mut idle = Rig::switches();
        let d = idle.switches_at(0, true, false);
        assert!(!d.output);
        assert!(d.transitions.is_empty());
    }

    #[test]
    fn full_while_off_does_not_arm_delay() {
        let mut rig = Rig::switches();
        let d = rig.switches_at(0, true, true);
        assert_eq!(d.mode, ActuatorMode::Off);
        assert!(d.transitions.is_empty());
        assert_eq!(rig.switches_at(12, false, false).mode, ActuatorMode::Running);
    }

    #[test]
    fn restart_delay_enforced() {
        let mut rig = Rig::switches();
        rig.switches_at(0, false, false);
        rig.switches_at(100, true, true);

        let stopped = rig.at(100);
        assert_eq!(rig.sm.restart_remaining(rig.at(110)), Duration::from_secs(170));
        assert_eq!(rig.sm.state().last_transition, stopped);

        let d = rig.switches_at(110, false, false);
        assert!(!d.output, "empty 10s after stop must not start");
        let d = rig.switches_at(100 + MIN_OFF - 1, false, false);
        assert!(!d.output);

        let d = rig.switches_at(100 + MIN_OFF + 1, false, false);
        assert!(d.output);
        let reasons: Vec<_> = d.transitions.iter().map(|t| t.reason).collect();
        assert_eq!(reasons, vec![ReasonCode::RestartDelayElapsed, ReasonCode::TankEmpty]);
    }

    #[test]
    fn delay_elapses_without_reading() {
        let mut rig = Rig::switches();
        rig.switches_at(0, false, false);
        rig.switches_at(10, true, true);
        let d = rig.step(10 + MIN_OFF, None, false);
        assert_eq!(d.mode, ActuatorMode::Off);
        assert_eq!(d.transitions[0].reason, ReasonCode::RestartDelayElapsed);
    }

    #[test]
    fn inconsistent_reading_faults_from_any_state() {
        for prior in [(false, false), (true, true), (true, false)] {
            let mut rig = Rig::switches();
            rig.switches_at(0, prior.0, prior.1);
            let d = rig.switches_at(12, false, true);
            assert_eq!(d.mode, ActuatorMode::Fault, "from {prior:?}");
            assert!(!d.output);
            assert_eq!(rig.sm.state().last_reason, ReasonCode::SensorInconsistent);
        }
    }

    #[test]
    fn fault_blocks_restart_until_consistent() {
        let mut rig = Rig::switches();
        let d = rig.switches_at(0, false, true);
        assert_eq!(d.mode, ActuatorMode::Fault);

        // Repeated fault is not a new transition.
        assert!(rig.switches_at(12, false, true).transitions.is_empty());
        // No reading keeps the fault.
        assert_eq!(rig.step(24, None, false).mode, ActuatorMode::Fault);

        // Consistent reading: fault cleared, then honored restart delay.
        let d = rig.switches_at(36, false, false);
        assert_eq!(d.mode, ActuatorMode::RestartDelay);
        assert_eq!(d.transitions[0].reason, ReasonCode::SensorRecovered);
        assert!(rig.switches_at(36 + MIN_OFF, false, false).output);
    }

    #[test]
    fn fault_exit_without_delay_when_disabled() {
        let config = AppConfig::from_toml(crate::config::tests::SWITCHES).unwrap();
        let mut control = config.control;
        control.fault_exit_honors_restart_delay = false;
        let mut rig = Rig::with(&control);

        rig.switches_at(0, false, true);
        let d = rig.switches_at(12, false, false);
        assert!(d.output);
        let reasons: Vec<_> = d.transitions.iter().map(|t| t.reason).collect();
        assert_eq!(reasons, vec![ReasonCode::SensorRecovered, ReasonCode::TankEmpty]);
    }

    #[test]
    fn fault_after_running_keeps_anti_short_cycle() {
        let config = AppConfig::from_toml(crate::config::tests::SWITCHES).unwrap();
        let mut control = config.control;
        control.fault_exit_honors_restart_delay = false;
        let mut rig = Rig::with(&control);

        rig.switches_at(0, false, false);
        rig.switches_at(12, false, true);
        let d = rig.switches_at(24, false, false);
        assert_eq!(d.mode, ActuatorMode::RestartDelay);
        assert!(!d.output);
        assert!(rig.switches_at(12 + MIN_OFF, false, false).output);
    }

    #[test]
    fn stale_reading_never_starts() {
        let mut rig = Rig::switches();
        let stale = switch_reading(rig.at(0), false, false, Quality::Stale);
        let d = rig.step(90, Some(stale), false);
        assert!(!d.output);
        assert_eq!(d.mode, ActuatorMode::Off);
    }

    #[test]
    fn stale_reading_does_not_force_stop() {
        let mut rig = Rig::switches();
        rig.switches_at(0, false, false);
        let stale = switch_reading(rig.at(0), true, true, Quality::Stale);
        assert!(rig.step(90, Some(stale), false).output);
    }

    #[test]
    fn comm_failure_overrides_everything() {
        let mut rig = Rig::switches();
        rig.switches_at(0, false, false);
        let empty = switch_reading(rig.at(12), false, false, Quality::Fresh);

        let d = rig.step(12, Some(empty), true);
        assert!(!d.output);
        assert_eq!(d.mode, ActuatorMode::RestartDelay);
        assert_eq!(d.transitions[0].reason, ReasonCode::CommFailure);

        // Still degraded long after the delay: stays off, no repeated transition.
        let d = rig.step(12 + MIN_OFF + 60, Some(empty), true);
        assert!(!d.output);
        assert!(d.transitions.is_empty());

        // Health back and delay elapsed: normal rules resume.
        let empty = switch_reading(rig.at(12 + MIN_OFF + 72), false, false, Quality::Fresh);
        assert!(rig.step(12 + MIN_OFF + 72, Some(empty), false).output);
    }

    #[test]
    fn comm_failure_from_off_arms_delay() {
        let mut rig = Rig::switches();
        rig.step(0, None, true);
        let d = rig.switches_at(30, false, false);
        assert!(!d.output);
        assert_eq!(rig.sm.restart_remaining(rig.at(30)), Duration::from_secs(MIN_OFF - 30));
    }

    #[test]
    fn constant_reading_decides_once() {
        let mut rig = Rig::switches();
        let mut transitions = 0;
        for cycle in 0..50 {
            let d = rig.switches_at(cycle * 12, false, false);
            assert!(d.output);
            transitions += d.transitions.len();
        }
        assert_eq!(transitions, 1);
    }

    #[test]
    fn analog_fill_hysteresis() {
        let mut rig = Rig::pressure(ThresholdDirection::Fill, 5.0, 25.0);
        assert!(!rig.step(0, Some(analog(rig.at(0), 10.0)), false).output);
        assert!(rig.step(12, Some(analog(rig.at(12), 5.0)), false).output);
        assert!(rig.step(24, Some(analog(rig.at(24), 15.0)), false).output);
        let d = rig.step(36, Some(analog(rig.at(36), 25.0)), false);
        assert!(!d.output);
        assert_eq!(d.transitions[0].reason, ReasonCode::TankFull);
        assert!(!rig.step(48, Some(analog(rig.at(48), 15.0)), false).output);
    }

    #[test]
    fn analog_drain_direction() {
        let mut rig = Rig::pressure(ThresholdDirection::Drain, 25.0, 5.0);
        assert!(rig.step(0, Some(analog(rig.at(0), 26.0)), false).output);
        assert!(rig.step(12, Some(analog(rig.at(12), 10.0)), false).output);
        assert!(!rig.step(24, Some(analog(rig.at(24), 4.0)), false).output);
    }

    #[test]
    fn shutdown_forces_off_once() {
        let mut rig = Rig::switches();
        rig.switches_at(0, false, false);
        let t = rig.sm.shutdown(rig.at(5)).unwrap();
        assert_eq!((t.from, t.to, t.reason), (ActuatorMode::Running, ActuatorMode::Off, ReasonCode::Shutdown));
        assert!(rig.sm.shutdown(rig.at(6)).is_none());
    }
}
