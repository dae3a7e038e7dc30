//! Control core for a field pump: register decoding, acquisition, comm-health
//! supervision and the actuator state machine.
//!
//! Nothing in this crate performs I/O directly; the field bus and the output
//! relay are reached through the traits in [`ports`].

use std::time::Instant;

use serde::{Deserialize, Serialize};

pub mod acquisition;
pub mod config;
pub mod control;
pub mod decoder;
pub mod diagnostics;
pub mod error;
pub mod health;
pub mod metrics;
pub mod ports;

pub use acquisition::Acquisition;
pub use config::{load_config, AppConfig, ControlConfig};
pub use control::{ActuatorMode, ActuatorState, ControlStateMachine, Decision, ReasonCode};
pub use decoder::WordOrder;
pub use diagnostics::DiagnosticWindow;
pub use error::{AcquisitionError, ActuatorError, ConfigError, PortError};
pub use health::{CommHealth, CommHealthState, PollOutcome};
pub use metrics::{TransitionLog, TransitionRecord};
pub use ports::{ActuatorDriver, ActuatorPort, SensorPort};

/// State of the two float switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscretePair {
    pub low_switch: bool,
    pub high_switch: bool,
}

/// Analog reading in engineering units (e.g. PSI) with its derived level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalogFloat {
    pub value: f64,
    pub level_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SensorValue {
    Discrete(DiscretePair),
    Analog(AnalogFloat),
}

impl SensorValue {
    pub fn analog(&self) -> Option<f64> {
        match self {
            SensorValue::Analog(a) => Some(a.value),
            SensorValue::Discrete(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Fresh,
    /// No successful poll within the staleness timeout.
    Stale,
    /// Structurally valid but physically impossible.
    Invalid,
}

/// One validated sample, produced by [`Acquisition`] and consumed the same cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub value: SensorValue,
    pub timestamp: Instant,
    pub quality: Quality,
}
