//! Exponential reconnect backoff and connection events.
//!
//! Used by the reconnecting async client; kept free of any runtime so the
//! delay schedule can be checked without timers.
use crate::protocol::CommunicationParameters;
use std::fmt;
use std::time::Duration;

/// A connection state transition, as seen by the reconnecting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The line is open.
    Connected,
    /// The line was lost or could not be opened.
    Disconnected,
    /// A reconnect attempt is about to start after waiting `delay`.
    Reconnecting { attempt: u32, delay: Duration },
}

impl ConnectionEvent {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionEvent::Connected)
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connected => write!(f, "connected"),
            ConnectionEvent::Disconnected => write!(f, "disconnected"),
            ConnectionEvent::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt} after {delay:?})")
            }
        }
    }
}

/// Reconnect delay schedule: `initial`, doubled after every failed attempt,
/// never above `max`. A zero initial delay disables reconnecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
            attempts: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.initial.is_zero()
    }

    /// The delay the next attempt will wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the delay before the next attempt and doubles it for the one
    /// after. `None` when reconnecting is disabled.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.is_enabled() {
            return None;
        }
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts += 1;
        Some(delay)
    }

    /// Back to the initial delay, after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
        self.attempts = 0;
    }
}

impl From<&CommunicationParameters> for Backoff {
    fn from(params: &CommunicationParameters) -> Self {
        Self::new(params.reconnect_delay(), params.reconnect_delay_max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay())
            .take(6)
            .map(|delay| delay.as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(300));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_millis(400));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(100));
        assert_eq!(backoff.attempts(), 0);
    }

    #[test]
    fn zero_delay_disables_reconnect() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::from_secs(300));
        assert!(!backoff.is_enabled());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 0);
    }

    #[test]
    fn from_parameters() {
        let params = CommunicationParameters::builder("/dev/ttyUSB0")
            .reconnect_delay(Duration::from_millis(250))
            .reconnect_delay_max(Duration::from_secs(2))
            .build()
            .unwrap();
        let mut backoff = Backoff::from(&params);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(250)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn event_display() {
        assert!(ConnectionEvent::Connected.is_connected());
        assert!(!ConnectionEvent::Disconnected.is_connected());
        assert_eq!(
            ConnectionEvent::Reconnecting {
                attempt: 2,
                delay: Duration::from_millis(200)
            }
            .to_string(),
            "reconnecting (attempt 2 after 200ms)"
        );
    }
}
