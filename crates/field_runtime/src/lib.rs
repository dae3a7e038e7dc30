//! Tokio runtime for the pump controller: Modbus and GPIO adapters, the
//! supervisor loop, signal handling and simulated devices.

pub mod actuator;
pub mod sensor;
pub mod signals;
pub mod sim;
pub mod supervisor;

use std::time::Duration;

use log::info;
use tokio::sync::watch;

use pump_core::config::{ActuatorKind, RegisterKind};
use pump_core::{ActuatorPort, AppConfig, ConfigError, PortError, SensorPort};

pub use actuator::{CoilActuator, UbusGpio, UbusGpioActuator};
pub use sensor::{ModbusBus, SharedBus};
pub use signals::{spawn_diagnostic_watcher, spawn_signal_listener, DigitalInput, UbusGpioInput};
pub use supervisor::{CycleReport, Supervisor, SupervisorStats};

/// Build the sensor and actuator ports for a deployment.
///
/// A coil actuator shares the sensor's bus connection.
pub fn build_ports(
    config: &AppConfig,
) -> Result<(Box<dyn SensorPort>, Box<dyn ActuatorPort>), ConfigError> {
    let bus = SharedBus::new(ModbusBus::new(config.bus.clone()));
    let actuator: Box<dyn ActuatorPort> = match config.actuator.kind {
        ActuatorKind::Coil => Box::new(CoilActuator::new(bus.clone(), &config.actuator)),
        ActuatorKind::UbusGpio => {
            let pin = config
                .actuator
                .output_pin
                .clone()
                .ok_or_else(|| ConfigError::Invalid {
                    what: "actuator.output_pin is required for ubus_gpio".into(),
                })?;
            Box::new(UbusGpioActuator::new(
                UbusGpio::default(),
                pin,
                config.actuator.feedback_pin.clone(),
            ))
        }
    };
    Ok((Box::new(bus), actuator))
}

/// Run the controller against real hardware until `shutdown` fires.
pub async fn run_controller(
    config: AppConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<SupervisorStats, ConfigError> {
    let (sensor, actuator) = build_ports(&config)?;
    let mut supervisor = Supervisor::new(&config, sensor, actuator);
    if let Some(pin) = config.diagnostic.input_pin.clone() {
        info!("diagnostic button on ioman.gpio.{pin}");
        let input = UbusGpioInput::new(UbusGpio::default(), pin);
        let presses = spawn_diagnostic_watcher(
            input,
            Duration::from_millis(config.diagnostic.input_sample_ms),
        );
        supervisor = supervisor.with_diagnostic_input(presses);
    }
    Ok(supervisor.run(shutdown).await)
}

/// Read raw registers once, for commissioning.
pub async fn probe_registers(
    config: &AppConfig,
    address: u16,
    count: u16,
    register_kind: RegisterKind,
) -> Result<Vec<u16>, PortError> {
    let mut bus = ModbusBus::new(config.bus.clone());
    let unit = config.sensor.unit_id;
    let words = match register_kind {
        RegisterKind::Holding => bus.read_holding(unit, address, count).await,
        RegisterKind::Input => bus.read_input(unit, address, count).await,
    };
    bus.disconnect();
    words
}
