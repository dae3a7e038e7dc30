//! Boundaries to the field bus and the output relay.

use async_trait::async_trait;
use log::{debug, error};

use crate::error::{ActuatorError, PortError};

/// Synchronous request/response over the field bus.
///
/// Every call must return within the transport's response timeout; a call
/// that does not is reported as [`PortError::Timeout`].
#[async_trait]
pub trait SensorPort: Send {
    /// Read `count` discrete inputs (FC02).
    async fn read_discrete(&mut self, unit: u8, address: u16, count: u16)
        -> Result<Vec<bool>, PortError>;

    /// Read `count` holding registers (FC03).
    async fn read_holding(&mut self, unit: u8, address: u16, count: u16)
        -> Result<Vec<u16>, PortError>;

    /// Read `count` input registers (FC04).
    async fn read_input(&mut self, unit: u8, address: u16, count: u16)
        -> Result<Vec<u16>, PortError>;

    /// Write a single coil (FC05).
    async fn write_coil(&mut self, unit: u8, address: u16, value: bool) -> Result<(), PortError>;

    /// Tear down the connection. The next request reconnects.
    async fn reset(&mut self);
}

/// Digital output driving the pump, with optional read-back.
#[async_trait]
pub trait ActuatorPort: Send {
    async fn set_output(&mut self, on: bool) -> Result<(), ActuatorError>;

    /// Actual contactor state, `None` when no feedback is wired.
    async fn get_input(&mut self) -> Option<bool>;
}

/// Idempotent writer in front of an [`ActuatorPort`].
///
/// Repeating the last successfully written level is a no-op. A failed write
/// clears the cache so the next cycle retries.
pub struct ActuatorDriver {
    port: Box<dyn ActuatorPort>,
    last_written: Option<bool>,
    writes: u64,
}

impl ActuatorDriver {
    pub fn new(port: Box<dyn ActuatorPort>) -> Self {
        Self {
            port,
            last_written: None,
            writes: 0,
        }
    }

    /// Returns `Ok(true)` when a write was actually issued.
    pub async fn apply(&mut self, on: bool) -> Result<bool, ActuatorError> {
        if self.last_written == Some(on) {
            return Ok(false);
        }
        self.write(on).await.map(|_| true)
    }

    /// Unconditional write, used for the final shutdown command.
    pub async fn force(&mut self, on: bool) -> Result<(), ActuatorError> {
        self.write(on).await
    }

    async fn write(&mut self, on: bool) -> Result<(), ActuatorError> {
        match self.port.set_output(on).await {
            Ok(()) => {
                self.writes += 1;
                self.last_written = Some(on);
                debug!("output written: {}", if on { "ON" } else { "OFF" });
                Ok(())
            }
            Err(err) => {
                self.last_written = None;
                error!("output write failed: {err}");
                Err(err)
            }
        }
    }

    pub async fn feedback(&mut self) -> Option<bool> {
        self.port.get_input().await
    }

    pub fn last_written(&self) -> Option<bool> {
        self.last_written
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Relay {
        log: Arc<Mutex<Vec<bool>>>,
        fail_next: bool,
    }

    #[async_trait]
    impl ActuatorPort for Relay {
        async fn set_output(&mut self, on: bool) -> Result<(), ActuatorError> {
            if std::mem::take(&mut self.fail_next) {
                return Err(ActuatorError::Command("relay busy".into()));
            }
            self.log.lock().unwrap().push(on);
            Ok(())
        }

        async fn get_input(&mut self) -> Option<bool> {
            None
        }
    }

    #[tokio::test]
    async fn suppresses_repeated_commands() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut driver = ActuatorDriver::new(Box::new(Relay {
            log: log.clone(),
            fail_next: false,
        }));

        assert!(driver.apply(false).await.unwrap());
        assert!(!driver.apply(false).await.unwrap());
        assert!(driver.apply(true).await.unwrap());
        assert!(!driver.apply(true).await.unwrap());

        assert_eq!(*log.lock().unwrap(), vec![false, true]);
        assert_eq!(driver.writes(), 2);
    }

    #[tokio::test]
    async fn failed_write_is_retried() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut driver = ActuatorDriver::new(Box::new(Relay {
            log: log.clone(),
            fail_next: true,
        }));

        assert!(driver.apply(true).await.is_err());
        assert_eq!(driver.last_written(), None);
        assert!(driver.apply(true).await.unwrap());
        assert_eq!(*log.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn force_writes_even_when_cached() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut driver = ActuatorDriver::new(Box::new(Relay {
            log: log.clone(),
            fail_next: false,
        }));
        driver.apply(false).await.unwrap();
        driver.force(false).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![false, false]);
    }
}
