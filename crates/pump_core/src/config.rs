use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decoder::WordOrder;
use crate::error::ConfigError;

/// Complete deployment configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub bus: BusConfig,
    pub sensor: SensorConfig,
    pub actuator: ActuatorConfig,
    pub control: ControlConfig,
    #[serde(default)]
    pub diagnostic: DiagnosticConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Rtu,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub transport: Transport,
    /// Serial device path, RTU only.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_parity")]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// `host:port`, TCP only.
    #[serde(default)]
    pub tcp_address: Option<String>,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_parity() -> Parity {
    Parity::None
}

fn default_stop_bits() -> u8 {
    1
}

fn default_response_timeout_ms() -> u64 {
    2000
}

impl BusConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Two float switches read as discrete inputs.
    FloatSwitches,
    /// Pressure transducer publishing a two-register float.
    Pressure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Holding,
    Input,
}

/// What `(low = false, high = true)` means for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistentSwitchPolicy {
    /// Physically impossible, stop and fault.
    Fault,
    /// Wired so that the high switch alone means full.
    TreatAsFull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub kind: SensorKind,
    pub unit_id: u8,
    /// First discrete input (switches) or first register (pressure).
    #[serde(default)]
    pub address: u16,
    #[serde(default = "default_register_kind")]
    pub register_kind: RegisterKind,
    /// Required for pressure sensors; never guessed.
    #[serde(default)]
    pub word_order: Option<WordOrder>,
    #[serde(default = "default_switch_policy")]
    pub inconsistent_switches: InconsistentSwitchPolicy,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    /// Engineering value that corresponds to 100 % level.
    #[serde(default = "default_full_scale")]
    pub full_scale: f64,
    /// Physical envelope; values outside are inconsistent, not clamped.
    #[serde(default = "default_min_valid")]
    pub min_valid: f64,
    /// Sensor rating. Required for pressure sensors; there is no default.
    #[serde(default)]
    pub max_valid: Option<f64>,
}

fn default_register_kind() -> RegisterKind {
    RegisterKind::Holding
}

fn default_switch_policy() -> InconsistentSwitchPolicy {
    InconsistentSwitchPolicy::Fault
}

fn default_scale() -> f64 {
    1.0
}

fn default_full_scale() -> f64 {
    100.0
}

fn default_min_valid() -> f64 {
    0.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorKind {
    /// Coil on a remote unit sharing the sensor bus.
    Coil,
    /// Local relay driven through `ubus` GPIO calls.
    UbusGpio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorConfig {
    pub kind: ActuatorKind,
    #[serde(default)]
    pub unit_id: u8,
    #[serde(default)]
    pub coil_address: u16,
    /// Discrete input on `unit_id` reporting the motor contactor.
    #[serde(default)]
    pub feedback_address: Option<u16>,
    /// ubus GPIO name of the relay output, e.g. `dio0`.
    #[serde(default)]
    pub output_pin: Option<String>,
    #[serde(default)]
    pub feedback_pin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdDirection {
    /// Pump fills the tank: start on low value, stop on high value.
    Fill,
    /// Pump drains the tank: start on high value, stop on low value.
    Drain,
}

/// Control thresholds and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_direction")]
    pub direction: ThresholdDirection,
    /// Analog start threshold in engineering units.
    #[serde(default)]
    pub start_threshold: Option<f64>,
    /// Analog stop threshold in engineering units.
    #[serde(default)]
    pub stop_threshold: Option<f64>,
    pub min_off_time_secs: u64,
    pub max_consecutive_failures: u32,
    pub staleness_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub degraded_poll_interval_secs: u64,
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub reconnect_backoff_max_secs: u64,
    #[serde(default = "default_true")]
    pub fault_exit_honors_restart_delay: bool,
}

fn default_direction() -> ThresholdDirection {
    ThresholdDirection::Fill
}

fn default_backoff_max() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl ControlConfig {
    pub fn min_off_time(&self) -> Duration {
        Duration::from_secs(self.min_off_time_secs)
    }

    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_secs(self.staleness_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn degraded_poll_interval(&self) -> Duration {
        Duration::from_secs(self.degraded_poll_interval_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_max_secs)
    }
}

/// Diagnostic (operator test) mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_diag_poll_secs")]
    pub poll_interval_secs: u64,
    /// ubus GPIO name of the diagnostic button.
    #[serde(default)]
    pub input_pin: Option<String>,
    #[serde(default = "default_sample_ms")]
    pub input_sample_ms: u64,
}

fn default_window_secs() -> u64 {
    600
}

fn default_diag_poll_secs() -> u64 {
    2
}

fn default_sample_ms() -> u64 {
    250
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            poll_interval_secs: default_diag_poll_secs(),
            input_pin: None,
            input_sample_ms: default_sample_ms(),
        }
    }
}

impl DiagnosticConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Read, apply environment overrides and validate.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    let mut config = AppConfig::from_toml(&content)?;
    config.apply_env_overrides(|var| std::env::var(var).ok())?;
    config.validate()?;
    Ok(config)
}

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Override deployment-specific values from the process environment.
    ///
    /// `lookup` is injected so tests do not touch the real environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(device) = lookup("PUMP_SERIAL_DEVICE") {
            self.bus.device = Some(device);
        }
        if let Some(value) = lookup("PUMP_BAUD_RATE") {
            self.bus.baud_rate = value.parse().map_err(|_| ConfigError::Env {
                var: "PUMP_BAUD_RATE",
                value,
            })?;
        }
        if let Some(address) = lookup("PUMP_TCP_ADDRESS") {
            self.bus.tcp_address = Some(address);
        }
        if let Some(value) = lookup("PUMP_SENSOR_UNIT") {
            self.sensor.unit_id = value.parse().map_err(|_| ConfigError::Env {
                var: "PUMP_SENSOR_UNIT",
                value,
            })?;
        }
        if let Some(value) = lookup("PUMP_WORD_ORDER") {
            let order = value.parse().map_err(|_| ConfigError::Env {
                var: "PUMP_WORD_ORDER",
                value,
            })?;
            self.sensor.word_order = Some(order);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_bus()?;
        self.validate_sensor()?;
        self.validate_actuator()?;
        self.validate_timers()
    }

    fn validate_bus(&self) -> Result<(), ConfigError> {
        match self.bus.transport {
            Transport::Rtu if self.bus.device.as_deref().unwrap_or("").is_empty() => {
                return Err(ConfigError::invalid("bus.device is required for rtu"));
            }
            Transport::Tcp if self.bus.tcp_address.as_deref().unwrap_or("").is_empty() => {
                return Err(ConfigError::invalid("bus.tcp_address is required for tcp"));
            }
            _ => {}
        }
        if self.bus.baud_rate == 0 {
            return Err(ConfigError::invalid("bus.baud_rate must be positive"));
        }
        if !matches!(self.bus.stop_bits, 1 | 2) {
            return Err(ConfigError::invalid("bus.stop_bits must be 1 or 2"));
        }
        if self.bus.response_timeout_ms == 0 {
            return Err(ConfigError::invalid("bus.response_timeout_ms must be positive"));
        }
        Ok(())
    }

    fn validate_sensor(&self) -> Result<(), ConfigError> {
        if self.sensor.kind == SensorKind::FloatSwitches {
            return Ok(());
        }
        let sensor = &self.sensor;
        if sensor.word_order.is_none() {
            return Err(ConfigError::invalid(
                "sensor.word_order is required for pressure sensors",
            ));
        }
        if !sensor.scale.is_finite() || sensor.scale == 0.0 {
            return Err(ConfigError::invalid("sensor.scale must be finite and non-zero"));
        }
        if !(sensor.full_scale.is_finite() && sensor.full_scale > 0.0) {
            return Err(ConfigError::invalid("sensor.full_scale must be positive"));
        }
        let Some(max_valid) = sensor.max_valid else {
            return Err(ConfigError::invalid(
                "sensor.max_valid is required for pressure sensors",
            ));
        };
        if !max_valid.is_finite() {
            return Err(ConfigError::invalid("sensor.max_valid must be finite"));
        }
        // Negative pressure is never a real level.
        if !(sensor.min_valid.is_finite() && sensor.min_valid >= 0.0) {
            return Err(ConfigError::invalid("sensor.min_valid must be zero or positive"));
        }
        if sensor.min_valid >= max_valid {
            return Err(ConfigError::invalid(
                "sensor.min_valid must be below sensor.max_valid",
            ));
        }

        let control = &self.control;
        let (Some(start), Some(stop)) = (control.start_threshold, control.stop_threshold) else {
            return Err(ConfigError::invalid(
                "control.start_threshold and control.stop_threshold are required for pressure sensors",
            ));
        };
        let ordered = match control.direction {
            ThresholdDirection::Fill => start < stop,
            ThresholdDirection::Drain => start > stop,
        };
        if !ordered {
            return Err(ConfigError::invalid(format!(
                "start threshold {start} must be on the empty side of stop threshold {stop} for {:?} control",
                control.direction
            )));
        }
        for (name, value) in [("start_threshold", start), ("stop_threshold", stop)] {
            if value < sensor.min_valid || value > max_valid {
                return Err(ConfigError::invalid(format!(
                    "control.{name} {value} is outside the sensor envelope [{}, {max_valid}]",
                    sensor.min_valid
                )));
            }
        }
        Ok(())
    }

    fn validate_actuator(&self) -> Result<(), ConfigError> {
        if self.actuator.kind == ActuatorKind::UbusGpio
            && self.actuator.output_pin.as_deref().unwrap_or("").is_empty()
        {
            return Err(ConfigError::invalid(
                "actuator.output_pin is required for ubus_gpio",
            ));
        }
        Ok(())
    }

    fn validate_timers(&self) -> Result<(), ConfigError> {
        let control = &self.control;
        if control.max_consecutive_failures == 0 {
            return Err(ConfigError::invalid(
                "control.max_consecutive_failures must be at least 1",
            ));
        }
        if control.poll_interval_secs == 0 || control.degraded_poll_interval_secs == 0 {
            return Err(ConfigError::invalid("poll intervals must be positive"));
        }
        if control.staleness_timeout_secs <= control.poll_interval_secs {
            return Err(ConfigError::invalid(
                "control.staleness_timeout_secs must exceed control.poll_interval_secs",
            ));
        }
        if control.reconnect_backoff_secs > control.reconnect_backoff_max_secs {
            return Err(ConfigError::invalid(
                "control.reconnect_backoff_secs exceeds control.reconnect_backoff_max_secs",
            ));
        }
        if self.diagnostic.poll_interval_secs == 0 || self.diagnostic.input_sample_ms == 0 {
            return Err(ConfigError::invalid("diagnostic intervals must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SWITCHES: &str = r#"
        [bus]
        transport = "rtu"
        device = "/dev/ttyHS0"

        [sensor]
        kind = "float_switches"
        unit_id = 32

        [actuator]
        kind = "coil"
        unit_id = 31

        [control]
        min_off_time_secs = 180
        max_consecutive_failures = 10
        staleness_timeout_secs = 60
        poll_interval_secs = 12
        degraded_poll_interval_secs = 1
        reconnect_backoff_secs = 8
    "#;

    pub(crate) const PRESSURE: &str = r#"
        [bus]
        transport = "tcp"
        tcp_address = "192.168.1.50:502"

        [sensor]
        kind = "pressure"
        unit_id = 1
        word_order = "CDAB"
        full_scale = 30.0
        max_valid = 150.0

        [actuator]
        kind = "ubus_gpio"
        output_pin = "dio0"

        [control]
        start_threshold = 5.0
        stop_threshold = 25.0
        min_off_time_secs = 180
        max_consecutive_failures = 10
        staleness_timeout_secs = 60
        poll_interval_secs = 12
        degraded_poll_interval_secs = 1
        reconnect_backoff_secs = 8
    "#;

    #[test]
    fn parses_switch_deployment_with_defaults() {
        let config = AppConfig::from_toml(SWITCHES).unwrap();
        config.validate().unwrap();
        assert_eq!(config.bus.baud_rate, 9600);
        assert_eq!(config.bus.response_timeout(), Duration::from_secs(2));
        assert_eq!(config.sensor.inconsistent_switches, InconsistentSwitchPolicy::Fault);
        assert_eq!(config.diagnostic.window(), Duration::from_secs(600));
        assert!(config.control.fault_exit_honors_restart_delay);
    }

    #[test]
    fn parses_pressure_deployment() {
        let config = AppConfig::from_toml(PRESSURE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sensor.word_order, Some(WordOrder::LowHigh));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = AppConfig::from_toml(PRESSURE).unwrap();
        config.control.start_threshold = Some(25.0);
        config.control.stop_threshold = Some(5.0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        config.control.direction = ThresholdDirection::Drain;
        config.validate().unwrap();
    }

    #[test]
    fn pressure_requires_explicit_word_order() {
        let mut config = AppConfig::from_toml(PRESSURE).unwrap();
        config.sensor.word_order = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("word_order"));
    }

    #[test]
    fn pressure_requires_finite_upper_bound() {
        let mut config = AppConfig::from_toml(&PRESSURE.replace("max_valid = 150.0", "")).unwrap();
        assert_eq!(config.sensor.max_valid, None);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("max_valid"));

        config.sensor.max_valid = Some(f64::INFINITY);
        assert!(config.validate().unwrap_err().to_string().contains("max_valid"));

        // Switch deployments have no envelope to set.
        let switches = AppConfig::from_toml(SWITCHES).unwrap();
        assert_eq!(switches.sensor.max_valid, None);
        switches.validate().unwrap();
    }

    #[test]
    fn negative_lower_bound_is_rejected() {
        let mut config = AppConfig::from_toml(PRESSURE).unwrap();
        config.sensor.min_valid = -0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_valid"));
    }

    #[test]
    fn bundled_configs_are_valid() {
        for (name, toml) in [
            ("float_switches", include_str!("../../../configs/float_switches.toml")),
            ("pressure_transducer", include_str!("../../../configs/pressure_transducer.toml")),
        ] {
            let config = AppConfig::from_toml(toml).unwrap();
            config.validate().unwrap_or_else(|e| panic!("{name}: {e}"));
            if config.sensor.kind == SensorKind::Pressure {
                assert!(config.sensor.min_valid >= 0.0, "{name}");
                assert!(config.sensor.max_valid.is_some_and(f64::is_finite), "{name}");
            }
        }
    }

    #[test]
    fn thresholds_must_sit_inside_envelope() {
        let mut config = AppConfig::from_toml(PRESSURE).unwrap();
        config.control.stop_threshold = Some(200.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn staleness_must_exceed_poll_interval() {
        let mut config = AppConfig::from_toml(SWITCHES).unwrap();
        config.control.staleness_timeout_secs = 12;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rtu_without_device_is_rejected() {
        let mut config = AppConfig::from_toml(SWITCHES).unwrap();
        config.bus.device = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::from_toml(SWITCHES).unwrap();
        config
            .apply_env_overrides(|var| match var {
                "PUMP_SERIAL_DEVICE" => Some("/dev/rs485".to_string()),
                "PUMP_SENSOR_UNIT" => Some("7".to_string()),
                "PUMP_WORD_ORDER" => Some("DCBA".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.bus.device.as_deref(), Some("/dev/rs485"));
        assert_eq!(config.sensor.unit_id, 7);
        assert_eq!(config.sensor.word_order, Some(WordOrder::LowHighByteSwap));
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut config = AppConfig::from_toml(SWITCHES).unwrap();
        let err = config
            .apply_env_overrides(|var| (var == "PUMP_BAUD_RATE").then(|| "fast".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "PUMP_BAUD_RATE", .. }));
    }
}
