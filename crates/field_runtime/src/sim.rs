//! Simulated field devices driven by the tokio clock.
//!
//! Pair with a paused runtime (`tokio::time::pause`) to replay hours of
//! operation in milliseconds.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;

use pump_core::decoder::encode_f32;
use pump_core::{ActuatorError, ActuatorPort, PortError, SensorPort, WordOrder};

/// Field condition from a point in time onward.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimCondition {
    Switches { low: bool, high: bool },
    Analog { value: f64 },
    /// Every request times out.
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SimStep {
    pub at_secs: f64,
    #[serde(flatten)]
    pub condition: SimCondition,
}

impl SimStep {
    pub fn new(at_secs: f64, condition: SimCondition) -> Self {
        Self { at_secs, condition }
    }
}

/// Counters shared with whoever built the sensor.
#[derive(Debug, Default)]
pub struct SimCounters {
    polls: AtomicU32,
    resets: AtomicU32,
}

impl SimCounters {
    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }
}

/// Sensor whose answers follow a timeline of [`SimStep`]s.
///
/// Before the first step the sensor is offline. Analog values are encoded
/// with the given word order, so the real decoder path is exercised.
pub struct SimulatedSensor {
    steps: Vec<SimStep>,
    start: Instant,
    word_order: WordOrder,
    counters: Arc<SimCounters>,
}

impl SimulatedSensor {
    pub fn new(mut steps: Vec<SimStep>, word_order: WordOrder) -> Self {
        steps.sort_by(|a, b| a.at_secs.total_cmp(&b.at_secs));
        Self {
            steps,
            start: Instant::now(),
            word_order,
            counters: Arc::new(SimCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<SimCounters> {
        self.counters.clone()
    }

    pub fn condition(&self) -> SimCondition {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.steps
            .iter()
            .take_while(|step| step.at_secs <= elapsed)
            .last()
            .map(|step| step.condition)
            .unwrap_or(SimCondition::Offline)
    }

    fn registers(&self) -> Result<Vec<u16>, PortError> {
        self.counters.polls.fetch_add(1, Ordering::SeqCst);
        match self.condition() {
            SimCondition::Analog { value } => Ok(encode_f32(value as f32, self.word_order).to_vec()),
            SimCondition::Switches { .. } => Err(PortError::Protocol("exception IllegalDataAddress".into())),
            SimCondition::Offline => Err(offline()),
        }
    }
}

fn offline() -> PortError {
    PortError::Timeout { timeout_ms: 2000 }
}

#[async_trait]
impl SensorPort for SimulatedSensor {
    async fn read_discrete(&mut self, _unit: u8, _address: u16, count: u16) -> Result<Vec<bool>, PortError> {
        self.counters.polls.fetch_add(1, Ordering::SeqCst);
        match self.condition() {
            SimCondition::Switches { low, high } => {
                let mut bits = vec![false; count as usize];
                if let Some(bit) = bits.get_mut(0) {
                    *bit = low;
                }
                if let Some(bit) = bits.get_mut(1) {
                    *bit = high;
                }
                Ok(bits)
            }
            SimCondition::Analog { .. } => Err(PortError::Protocol("exception IllegalDataAddress".into())),
            SimCondition::Offline => Err(offline()),
        }
    }

    async fn read_holding(&mut self, _unit: u8, _address: u16, _count: u16) -> Result<Vec<u16>, PortError> {
        self.registers()
    }

    async fn read_input(&mut self, _unit: u8, _address: u16, _count: u16) -> Result<Vec<u16>, PortError> {
        self.registers()
    }

    async fn write_coil(&mut self, _unit: u8, _address: u16, _value: bool) -> Result<(), PortError> {
        Ok(())
    }

    async fn reset(&mut self) {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// How a [`RecordingActuator`] answers feedback reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFeedback {
    None,
    /// Mirrors the last written level.
    Follow,
    /// Stuck at a level, e.g. a contactor forced on by hand.
    Fixed(bool),
}

/// One accepted output write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputWrite {
    pub at: Duration,
    pub on: bool,
}

/// Actuator that records every write with its time offset.
pub struct RecordingActuator {
    start: Instant,
    writes: Arc<Mutex<Vec<OutputWrite>>>,
    feedback: SimFeedback,
    level: Option<bool>,
}

impl RecordingActuator {
    pub fn new(feedback: SimFeedback) -> Self {
        Self {
            start: Instant::now(),
            writes: Arc::new(Mutex::new(Vec::new())),
            feedback,
            level: None,
        }
    }

    /// Shared view of the write history.
    pub fn writes(&self) -> Arc<Mutex<Vec<OutputWrite>>> {
        self.writes.clone()
    }
}

#[async_trait]
impl ActuatorPort for RecordingActuator {
    async fn set_output(&mut self, on: bool) -> Result<(), ActuatorError> {
        let write = OutputWrite {
            at: self.start.elapsed(),
            on,
        };
        self.writes
            .lock()
            .map_err(|_| ActuatorError::Command("write log poisoned".into()))?
            .push(write);
        self.level = Some(on);
        Ok(())
    }

    async fn get_input(&mut self) -> Option<bool> {
        match self.feedback {
            SimFeedback::None => None,
            SimFeedback::Follow => self.level,
            SimFeedback::Fixed(level) => Some(level),
        }
    }
}
