//! Error types shared by the control core and its collaborators.

use thiserror::Error;

/// Failure reported by a [`SensorPort`](crate::ports::SensorPort) transaction.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PortError {
    /// Port unavailable, connection refused, I/O error.
    #[error("transport error: {0}")]
    Transport(String),

    /// No response within the configured response timeout.
    #[error("no response within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Malformed response or a Modbus exception from the device.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failure of one acquisition poll.
///
/// Both kinds count as a `Failure` outcome for comm-health purposes.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("protocol: {0}")]
    Protocol(String),

    /// The device answered with fewer values than requested.
    #[error("short response: expected {expected} values, got {got}")]
    ShortResponse { expected: usize, got: usize },
}

impl AcquisitionError {
    pub fn is_transport(&self) -> bool {
        matches!(self, AcquisitionError::Transport(_))
    }
}

impl From<PortError> for AcquisitionError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Transport(msg) => AcquisitionError::Transport(msg),
            PortError::Timeout { .. } => AcquisitionError::Transport(err.to_string()),
            PortError::Protocol(msg) => AcquisitionError::Protocol(msg),
        }
    }
}

/// Failure to drive the physical output.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActuatorError {
    #[error("actuator port: {0}")]
    Port(#[from] PortError),

    #[error("output command failed: {0}")]
    Command(String),
}

/// Invalid configuration. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {what}")]
    Invalid { what: String },
}

impl ConfigError {
    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        ConfigError::Invalid { what: what.into() }
    }
}
