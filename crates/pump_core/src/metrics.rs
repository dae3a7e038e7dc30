use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::info;
use serde::Serialize;

use crate::control::{ActuatorMode, ReasonCode, Transition};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct TransitionRecord {
    /// Seconds since the log was created.
    pub at_secs: f64,
    pub from: ActuatorMode,
    pub to: ActuatorMode,
    pub reason: ReasonCode,
    /// Analog value or switch pair at the time, when one was available.
    pub reading: Option<String>,
}

/// Bounded in-memory journal of actuator transitions.
///
/// Clones share the same buffer, so the loop can record while another
/// owner reads or exports.
#[derive(Clone)]
pub struct TransitionLog {
    records: Arc<Mutex<VecDeque<TransitionRecord>>>,
    capacity: usize,
    start_time: Instant,
}

impl TransitionLog {
    pub fn new(capacity: usize, start_time: Instant) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity: capacity.max(1),
            start_time,
        }
    }

    pub fn record(&self, transition: &Transition, reading: Option<String>) {
        let record = TransitionRecord {
            at_secs: transition
                .at
                .saturating_duration_since(self.start_time)
                .as_secs_f64(),
            from: transition.from,
            to: transition.to,
            reason: transition.reason,
            reading,
        };
        if let Ok(mut data) = self.records.lock() {
            if data.len() == self.capacity {
                data.pop_front();
            }
            data.push_back(record);
        }
    }

    pub fn get_results(&self) -> Vec<TransitionRecord> {
        self.records
            .lock()
            .map(|data| data.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|data| data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn save_to_csv(&self, filename: &str) -> Result<(), csv::Error> {
        let data = self.get_results();
        let mut wtr = csv::Writer::from_path(filename)?;
        for record in &data {
            wtr.serialize(record)?;
        }
        wtr.flush()?;
        info!("saved {} transitions to {}", data.len(), filename);
        Ok(())
    }

    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut wtr = csv::Writer::from_writer(writer);
        for record in self.get_results() {
            wtr.serialize(record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}
