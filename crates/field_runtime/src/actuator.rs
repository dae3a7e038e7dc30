//! Output relay adapters: a Modbus coil on the field bus, or a router GPIO
//! driven through `ubus`.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time;

use pump_core::config::ActuatorConfig;
use pump_core::{ActuatorError, ActuatorPort, PortError, SensorPort};

/// Pump contactor wired to a Modbus coil, with optional read-back on a
/// discrete input of the same unit.
pub struct CoilActuator<P> {
    port: P,
    unit: u8,
    coil: u16,
    feedback: Option<u16>,
}

impl<P: SensorPort> CoilActuator<P> {
    pub fn new(port: P, config: &ActuatorConfig) -> Self {
        Self {
            port,
            unit: config.unit_id,
            coil: config.coil_address,
            feedback: config.feedback_address,
        }
    }
}

#[async_trait]
impl<P: SensorPort> ActuatorPort for CoilActuator<P> {
    async fn set_output(&mut self, on: bool) -> Result<(), ActuatorError> {
        self.port.write_coil(self.unit, self.coil, on).await?;
        Ok(())
    }

    async fn get_input(&mut self) -> Option<bool> {
        let address = self.feedback?;
        match self.port.read_discrete(self.unit, address, 1).await {
            Ok(bits) => bits.first().copied(),
            Err(err) => {
                debug!("feedback read failed: {err}");
                None
            }
        }
    }
}

const UBUS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct GpioStatus {
    value: String,
}

/// Parse the reply of `ubus call ioman.gpio.<pin> status`.
pub fn parse_gpio_status(reply: &str) -> Option<bool> {
    let status: GpioStatus = serde_json::from_str(reply).ok()?;
    match status.value.trim() {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}

/// Thin wrapper over the `ubus` CLI for the router's I/O manager.
#[derive(Debug, Clone)]
pub struct UbusGpio {
    program: String,
}

impl Default for UbusGpio {
    fn default() -> Self {
        Self::new("ubus")
    }
}

impl UbusGpio {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn call(&self, pin: &str, method: &str, args: Option<String>) -> Result<String, PortError> {
        let mut command = Command::new(&self.program);
        command.arg("call").arg(format!("ioman.gpio.{pin}")).arg(method);
        if let Some(args) = args {
            command.arg(args);
        }
        let output = time::timeout(UBUS_TIMEOUT, command.output())
            .await
            .map_err(|_| PortError::Timeout {
                timeout_ms: UBUS_TIMEOUT.as_millis() as u64,
            })?
            .map_err(|e| PortError::Transport(format!("{}: {e}", self.program)))?;
        if !output.status.success() {
            return Err(PortError::Protocol(format!(
                "ioman.gpio.{pin} {method}: {} {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn write(&self, pin: &str, on: bool) -> Result<(), PortError> {
        let args = serde_json::json!({ "value": if on { "1" } else { "0" } }).to_string();
        self.call(pin, "update", Some(args)).await.map(|_| ())
    }

    pub async fn read(&self, pin: &str) -> Result<Option<bool>, PortError> {
        let reply = self.call(pin, "status", None).await?;
        Ok(parse_gpio_status(&reply))
    }
}

/// Pump contactor on a router digital output.
pub struct UbusGpioActuator {
    gpio: UbusGpio,
    output_pin: String,
    feedback_pin: Option<String>,
}

impl UbusGpioActuator {
    pub fn new(gpio: UbusGpio, output_pin: String, feedback_pin: Option<String>) -> Self {
        Self {
            gpio,
            output_pin,
            feedback_pin,
        }
    }
}

#[async_trait]
impl ActuatorPort for UbusGpioActuator {
    async fn set_output(&mut self, on: bool) -> Result<(), ActuatorError> {
        self.gpio
            .write(&self.output_pin, on)
            .await
            .map_err(|e| ActuatorError::Command(e.to_string()))
    }

    async fn get_input(&mut self) -> Option<bool> {
        let pin = self.feedback_pin.as_deref()?;
        match self.gpio.read(pin).await {
            Ok(Some(level)) => Some(level),
            Ok(None) => {
                warn!("unexpected status reply from ioman.gpio.{pin}");
                None
            }
            Err(err) => {
                debug!("feedback read failed: {err}");
                None
            }
        }
    }
}
