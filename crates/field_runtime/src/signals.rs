//! Out-of-band inputs to the control loop: process termination and the
//! diagnostic push button.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::actuator::UbusGpio;

/// Completes on SIGINT, or SIGTERM on unix.
pub async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                    _ = term.recv() => info!("SIGTERM received"),
                }
            }
            Err(err) => {
                warn!("cannot listen for SIGTERM: {err}");
                let _ = tokio::signal::ctrl_c().await;
                info!("SIGINT received");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }
}

/// Shutdown flag published on termination. The loop polls it between cycles.
pub fn spawn_signal_listener() -> (watch::Receiver<bool>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        wait_for_termination().await;
        let _ = tx.send(true);
    });
    (rx, handle)
}

/// A digital input the diagnostic watcher can sample.
#[async_trait]
pub trait DigitalInput: Send {
    /// Current level, `None` when it could not be read.
    async fn read(&mut self) -> Option<bool>;
}

/// Router GPIO input read through `ubus`.
pub struct UbusGpioInput {
    gpio: UbusGpio,
    pin: String,
}

impl UbusGpioInput {
    pub fn new(gpio: UbusGpio, pin: String) -> Self {
        Self { gpio, pin }
    }
}

#[async_trait]
impl DigitalInput for UbusGpioInput {
    async fn read(&mut self) -> Option<bool> {
        match self.gpio.read(&self.pin).await {
            Ok(level) => level,
            Err(err) => {
                debug!("diagnostic input {}: {err}", self.pin);
                None
            }
        }
    }
}

/// Sample `input` every `period` and publish the number of rising edges seen.
///
/// The receiver only ever holds the latest count, so a press that lands
/// between two control cycles is still seen as one change. The task stops
/// when every receiver is dropped.
pub fn spawn_diagnostic_watcher<I>(mut input: I, period: Duration) -> watch::Receiver<u64>
where
    I: DigitalInput + 'static,
{
    let (tx, rx) = watch::channel(0u64);
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Unknown at start: a button held during boot is not a press.
        let mut previous: Option<bool> = None;
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }
            let Some(level) = input.read().await else {
                continue;
            };
            if previous == Some(false) && level {
                debug!("diagnostic button pressed");
                tx.send_modify(|presses| *presses += 1);
            }
            previous = Some(level);
        }
    });
    rx
}
