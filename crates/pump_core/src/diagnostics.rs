use std::time::{Duration, Instant};

use log::info;

/// Timed operator test mode.
///
/// Opened by a button press (a rising edge detected by whoever samples the
/// input), closed when the window duration elapses. Presses while open are
/// ignored, so the window never extends.
#[derive(Debug, Clone)]
pub struct DiagnosticWindow {
    duration: Duration,
    active: bool,
    started_at: Option<Instant>,
}

impl DiagnosticWindow {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            active: false,
            started_at: None,
        }
    }

    /// Register a press. Returns true when this press opened the window.
    pub fn trigger(&mut self, now: Instant) -> bool {
        self.expire(now);
        if self.active {
            return false;
        }
        self.active = true;
        self.started_at = Some(now);
        info!("diagnostic mode on for {}s", self.duration.as_secs());
        true
    }

    /// Close the window once its duration has elapsed. Returns the state after the check.
    pub fn expire(&mut self, now: Instant) -> bool {
        if let Some(started) = self.started_at {
            if now.saturating_duration_since(started) >= self.duration {
                self.active = false;
                self.started_at = None;
                info!("diagnostic mode expired");
            }
        }
        self.active
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match self.started_at {
            Some(started) => self.duration.saturating_sub(now.saturating_duration_since(started)),
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn press_opens_window() {
        let t0 = Instant::now();
        let mut window = DiagnosticWindow::new(Duration::from_secs(60));
        assert!(!window.active());
        assert!(window.trigger(t0));
        assert_eq!(window.started_at(), Some(t0));
        assert_eq!(window.remaining(t0 + Duration::from_secs(20)), Duration::from_secs(40));
    }

    #[test]
    fn presses_inside_window_do_not_extend_it() {
        let t0 = Instant::now();
        let mut window = DiagnosticWindow::new(Duration::from_secs(60));
        window.trigger(t0);
        assert!(!window.trigger(t0 + Duration::from_secs(30)));
        assert!(window.expire(t0 + Duration::from_secs(59)));
        assert!(!window.expire(t0 + Duration::from_secs(60)));
        assert_eq!(window.remaining(t0 + Duration::from_secs(60)), Duration::ZERO);
    }

    #[test]
    fn can_reopen_after_expiry() {
        let t0 = Instant::now();
        let mut window = DiagnosticWindow::new(Duration::from_secs(60));
        window.trigger(t0);
        assert!(window.trigger(t0 + Duration::from_secs(61)));
        assert_eq!(window.started_at(), Some(t0 + Duration::from_secs(61)));
    }
}
