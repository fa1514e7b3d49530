//! Modbus RTU timing derived from the serial byte geometry.
//!
//! RTU frames carry no length field, a frame ends when the line stays idle
//! long enough. All intervals here are derived from the character time `t0`:
//!
//! * `t0`: seconds to transmit one character (start bit, data bits, stop bits).
//! * `recv_poll_interval`: how often the receive loop checks for more bytes.
//! * `inter_byte_timeout`: longest gap tolerated inside one frame.
//! * `silent_interval`: shortest gap that terminates a frame.
//!
//! Above 19200 baud the character based values get too small to observe, so
//! fixed values are used instead (`inter_byte_timeout` disabled, 1.75 ms silent
//! interval), as the Modbus serial line specification recommends.
use crate::protocol::CommunicationParameters;
use std::time::Duration;

/// Baud rates above this threshold use the fixed timing constants.
pub const FIXED_TIMING_BAUD_THRESHOLD: u32 = 19200;

/// Silent interval used above [`FIXED_TIMING_BAUD_THRESHOLD`], in seconds.
pub const FIXED_SILENT_INTERVAL: f64 = 1.75 / 1000.0;

/// Lower bound of the receive poll interval, in seconds.
pub const MIN_RECV_POLL_INTERVAL: f64 = 0.001;

/// Number of characters between two polls of the receive buffer.
const POLL_CHARACTERS: f64 = 4.0;

fn round_micros(seconds: f64) -> f64 {
    (seconds * 1_000_000.0).round() / 1_000_000.0
}

/// The intervals derived from one set of [`CommunicationParameters`].
///
/// # Examples
///
/// ```
/// use rtu_link_lib::{protocol::CommunicationParameters, timing::TimingProfile};
///
/// let params = CommunicationParameters::builder("/dev/ttyUSB0")
///     .baud_rate(115200)
///     .build()
///     .unwrap();
/// let timing = TimingProfile::from(&params);
/// assert_eq!(timing.silent_interval(), 0.00175);
/// assert_eq!(timing.inter_byte_timeout(), 0.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingProfile {
    t0: f64,
    recv_poll_interval: f64,
    inter_byte_timeout: f64,
    silent_interval: f64,
}

impl TimingProfile {
    /// Seconds per character.
    pub fn t0(&self) -> f64 {
        self.t0
    }

    /// Seconds between two polls of the receive buffer.
    pub fn recv_poll_interval(&self) -> f64 {
        self.recv_poll_interval
    }

    /// Maximum silence inside a frame in seconds, zero means disabled.
    pub fn inter_byte_timeout(&self) -> f64 {
        self.inter_byte_timeout
    }

    /// Minimum silence marking the end of a frame, in seconds.
    pub fn silent_interval(&self) -> f64 {
        self.silent_interval
    }

    pub fn recv_poll_duration(&self) -> Duration {
        Duration::from_secs_f64(self.recv_poll_interval)
    }

    /// `None` when the inter byte timeout is disabled.
    pub fn inter_byte_duration(&self) -> Option<Duration> {
        (self.inter_byte_timeout > 0.0).then(|| Duration::from_secs_f64(self.inter_byte_timeout))
    }

    pub fn silent_duration(&self) -> Duration {
        Duration::from_secs_f64(self.silent_interval)
    }
}

impl From<&CommunicationParameters> for TimingProfile {
    fn from(params: &CommunicationParameters) -> Self {
        let bits = 1.0 + f64::from(params.data_bits().bits()) + params.stop_bits().as_f64();
        let t0 = bits / f64::from(params.baud_rate());
        let recv_poll_interval = (t0 * POLL_CHARACTERS).max(MIN_RECV_POLL_INTERVAL);

        let (inter_byte_timeout, silent_interval) =
            if params.baud_rate() > FIXED_TIMING_BAUD_THRESHOLD {
                (0.0, FIXED_SILENT_INTERVAL)
            } else {
                (1.5 * t0, 3.5 * t0)
            };

        Self {
            t0,
            recv_poll_interval,
            inter_byte_timeout,
            silent_interval: round_micros(silent_interval),
        }
    }
}
