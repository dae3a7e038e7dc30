//! One poll per cycle: read raw values through the [`SensorPort`], decode,
//! timestamp and classify.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::{InconsistentSwitchPolicy, RegisterKind, SensorConfig, SensorKind};
use crate::decoder::{decode_discrete, decode_f32, WordOrder};
use crate::error::AcquisitionError;
use crate::ports::SensorPort;
use crate::{AnalogFloat, DiscretePair, Quality, SensorReading, SensorValue};

pub struct Acquisition {
    sensor: SensorConfig,
    word_order: WordOrder,
    staleness_timeout: Duration,
    last_success: Option<Instant>,
    cached: Option<SensorReading>,
}

impl Acquisition {
    pub fn new(sensor: SensorConfig, staleness_timeout: Duration) -> Self {
        // Validation guarantees a word order for pressure sensors; switches never use it.
        let word_order = sensor.word_order.unwrap_or(WordOrder::HighLow);
        Self {
            sensor,
            word_order,
            staleness_timeout,
            last_success: None,
            cached: None,
        }
    }

    pub async fn poll(
        &mut self,
        port: &mut dyn SensorPort,
        now: Instant,
    ) -> Result<SensorReading, AcquisitionError> {
        let value = match self.sensor.kind {
            SensorKind::FloatSwitches => SensorValue::Discrete(self.read_switches(port).await?),
            SensorKind::Pressure => SensorValue::Analog(self.read_pressure(port).await?),
        };
        let reading = SensorReading {
            value,
            timestamp: now,
            quality: self.classify(&value),
        };
        if reading.quality == Quality::Invalid {
            warn!("inconsistent reading: {:?}", reading.value);
        } else {
            debug!("reading: {:?}", reading.value);
        }
        self.last_success = Some(now);
        self.cached = Some(reading);
        Ok(reading)
    }

    /// The last successful reading, re-qualified against the staleness timeout.
    pub fn cached(&self, now: Instant) -> Option<SensorReading> {
        let mut reading = self.cached?;
        if self.is_stale(now) {
            reading.quality = Quality::Stale;
        }
        Some(reading)
    }

    /// What a cycle whose poll failed gets to see: the last reading, never
    /// `Fresh`, so it can hold the current state but not authorize a start.
    pub fn after_failed_poll(&self) -> Option<SensorReading> {
        let mut reading = self.cached?;
        if reading.quality == Quality::Fresh {
            reading.quality = Quality::Stale;
        }
        Some(reading)
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        match self.last_success {
            Some(at) => now.saturating_duration_since(at) > self.staleness_timeout,
            None => true,
        }
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    async fn read_switches(
        &self,
        port: &mut dyn SensorPort,
    ) -> Result<DiscretePair, AcquisitionError> {
        let bits = port
            .read_discrete(self.sensor.unit_id, self.sensor.address, 2)
            .await?;
        match bits.as_slice() {
            [low, high, ..] => Ok(decode_discrete([*low, *high])),
            _ => Err(AcquisitionError::ShortResponse {
                expected: 2,
                got: bits.len(),
            }),
        }
    }

    async fn read_pressure(&self, port: &mut dyn SensorPort) -> Result<AnalogFloat, AcquisitionError> {
        let (unit, address) = (self.sensor.unit_id, self.sensor.address);
        let words = match self.sensor.register_kind {
            RegisterKind::Holding => port.read_holding(unit, address, 2).await?,
            RegisterKind::Input => port.read_input(unit, address, 2).await?,
        };
        let words: [u16; 2] = words
            .get(..2)
            .and_then(|w| w.try_into().ok())
            .ok_or(AcquisitionError::ShortResponse {
                expected: 2,
                got: words.len(),
            })?;
        let raw = decode_f32(words, self.word_order) as f64;
        let value = raw * self.sensor.scale + self.sensor.offset;
        debug!(
            "registers [{:#06x}, {:#06x}] {} -> {raw} -> {value}",
            words[0], words[1], self.word_order
        );
        Ok(AnalogFloat {
            value,
            level_percent: value / self.sensor.full_scale * 100.0,
        })
    }

    fn classify(&self, value: &SensorValue) -> Quality {
        match value {
            SensorValue::Discrete(pair) => {
                let contradictory = !pair.low_switch && pair.high_switch;
                if contradictory
                    && self.sensor.inconsistent_switches == InconsistentSwitchPolicy::Fault
                {
                    Quality::Invalid
                } else {
                    Quality::Fresh
                }
            }
            SensorValue::Analog(analog) => {
                let v = analog.value;
                let within = v >= self.sensor.min_valid
                    && self.sensor.max_valid.is_some_and(|max| v <= max);
                if v.is_finite() && within {
                    Quality::Fresh
                } else {
                    Quality::Invalid
                }
            }
        }
    }
}
