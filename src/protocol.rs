//! Communication parameters and the small value types shared by the serial
//! transports and the transaction engines.
//!
//! Everything in here is validated once, at construction time, and is
//! immutable afterwards. A reconnect always reuses the same
//! [`CommunicationParameters`].
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Errors raised while validating communication parameters.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The baud rate was zero.
    #[error("Baud rate must be greater than zero")]
    BaudRateZero,

    /// The byte size is not 7 or 8 bits.
    #[error("Byte size {0} is not supported, expected 7 or 8")]
    ByteSizeOutOfRange(u8),

    /// The stop bits are not 1, 1.5 or 2.
    #[error("Stop bits {0} are not supported, expected 1, 1.5 or 2")]
    StopBitsOutOfRange(f32),

    /// The parity is not one of 'N', 'E' or 'O'.
    #[error("Parity '{0}' is not supported, expected 'N', 'E' or 'O'")]
    InvalidParity(String),

    /// The endpoint (device path) was empty.
    #[error("Endpoint must not be empty")]
    EmptyEndpoint,

    /// The connect timeout was zero.
    #[error("Connect timeout must be greater than zero")]
    TimeoutZero,

    /// The maximum reconnect delay is lower than the initial delay.
    #[error("Maximum reconnect delay {max:?} is lower than the initial delay {initial:?}")]
    ReconnectDelayRange { initial: Duration, max: Duration },
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DataBits {
    Seven = 7,
    #[default]
    Eight = 8,
}

impl DataBits {
    /// The number of bits as an integer.
    pub fn bits(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for DataBits {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            _ => Err(Error::ByteSizeOutOfRange(value)),
        }
    }
}

impl fmt::Display for DataBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl TryFrom<char> for Parity {
    type Error = Error;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value.to_ascii_uppercase() {
            'N' => Ok(Parity::None),
            'E' => Ok(Parity::Even),
            'O' => Ok(Parity::Odd),
            _ => Err(Error::InvalidParity(value.to_string())),
        }
    }
}

impl FromStr for Parity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "n" | "none" => Ok(Parity::None),
            "e" | "even" => Ok(Parity::Even),
            "o" | "odd" => Ok(Parity::Odd),
            _ => Err(Error::InvalidParity(s.to_string())),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        write!(f, "{c}")
    }
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

impl StopBits {
    /// The number of stop bits as used in the character time calculation.
    pub fn as_f64(&self) -> f64 {
        match self {
            StopBits::One => 1.0,
            StopBits::OnePointFive => 1.5,
            StopBits::Two => 2.0,
        }
    }
}

impl TryFrom<f32> for StopBits {
    type Error = Error;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        if value == 1.0 {
            Ok(StopBits::One)
        } else if value == 1.5 {
            Ok(StopBits::OnePointFive)
        } else if value == 2.0 {
            Ok(StopBits::Two)
        } else {
            Err(Error::StopBitsOutOfRange(value))
        }
    }
}

impl FromStr for StopBits {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .parse::<f32>()
            .map_err(|_| Error::StopBitsOutOfRange(f32::NAN))?;
        StopBits::try_from(value)
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_f64())
    }
}

/// Whether a transport currently holds an open line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// Progress of the request currently driven by a transaction engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Idle,
    Sending,
    WaitingForReply,
    Retrying,
    Failed,
    Complete,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Idle => "idle",
            TransactionState::Sending => "sending",
            TransactionState::WaitingForReply => "waiting for reply",
            TransactionState::Retrying => "retrying",
            TransactionState::Failed => "failed",
            TransactionState::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// Immutable settings of one serial connection.
///
/// Use [`CommunicationParameters::builder`] to create an instance; the builder
/// validates every value before freezing it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommunicationParameters {
    port: String,
    baud_rate: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    handle_local_echo: bool,
    timeout: Duration,
    reconnect_delay: Duration,
    reconnect_delay_max: Duration,
    name: String,
}

impl CommunicationParameters {
    pub const DEFAULT_BAUD_RATE: u32 = 19200;
    pub const DEFAULT_NAME: &'static str = "comm";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
    pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(100);
    pub const DEFAULT_RECONNECT_DELAY_MAX: Duration = Duration::from_secs(300);

    /// Starts building parameters for the serial device at `port`
    /// (e.g. `/dev/ttyUSB0` or `COM3`).
    ///
    /// # Examples
    ///
    /// ```
    /// use rtu_link_lib::protocol::{CommunicationParameters, Parity};
    ///
    /// let params = CommunicationParameters::builder("/dev/ttyUSB0")
    ///     .baud_rate(9600)
    ///     .parity(Parity::Even)
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(params.baud_rate(), 9600);
    /// ```
    pub fn builder(port: impl Into<String>) -> CommunicationParametersBuilder {
        CommunicationParametersBuilder::new(port)
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn data_bits(&self) -> DataBits {
        self.data_bits
    }

    pub fn parity(&self) -> Parity {
        self.parity
    }

    pub fn stop_bits(&self) -> StopBits {
        self.stop_bits
    }

    /// Whether the adapter echoes every transmitted byte back to us.
    pub fn handle_local_echo(&self) -> bool {
        self.handle_local_echo
    }

    /// Timeout for opening the line and for waiting on a reply.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Initial delay before an automatic reconnect. Zero disables reconnecting.
    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn reconnect_delay_max(&self) -> Duration {
        self.reconnect_delay_max
    }

    /// Human readable connection name, used in log messages.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for CommunicationParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {}{}{})",
            self.port, self.baud_rate, self.data_bits, self.parity, self.stop_bits
        )
    }
}

/// Builder for [`CommunicationParameters`].
#[derive(Debug, Clone)]
pub struct CommunicationParametersBuilder {
    port: String,
    baud_rate: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    handle_local_echo: bool,
    timeout: Duration,
    reconnect_delay: Duration,
    reconnect_delay_max: Duration,
    name: String,
}

impl CommunicationParametersBuilder {
    fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: CommunicationParameters::DEFAULT_BAUD_RATE,
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            handle_local_echo: false,
            timeout: CommunicationParameters::DEFAULT_TIMEOUT,
            reconnect_delay: CommunicationParameters::DEFAULT_RECONNECT_DELAY,
            reconnect_delay_max: CommunicationParameters::DEFAULT_RECONNECT_DELAY_MAX,
            name: CommunicationParameters::DEFAULT_NAME.to_string(),
        }
    }

    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    pub fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub fn handle_local_echo(mut self, handle_local_echo: bool) -> Self {
        self.handle_local_echo = handle_local_echo;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }

    pub fn reconnect_delay_max(mut self, reconnect_delay_max: Duration) -> Self {
        self.reconnect_delay_max = reconnect_delay_max;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Validates the collected values and freezes them.
    pub fn build(self) -> Result<CommunicationParameters, Error> {
        if self.port.is_empty() {
            return Err(Error::EmptyEndpoint);
        }
        if self.baud_rate == 0 {
            return Err(Error::BaudRateZero);
        }
        if self.timeout.is_zero() {
            return Err(Error::TimeoutZero);
        }
        if !self.reconnect_delay.is_zero() && self.reconnect_delay_max < self.reconnect_delay {
            return Err(Error::ReconnectDelayRange {
                initial: self.reconnect_delay,
                max: self.reconnect_delay_max,
            });
        }
        Ok(CommunicationParameters {
            port: self.port,
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            parity: self.parity,
            stop_bits: self.stop_bits,
            handle_local_echo: self.handle_local_echo,
            timeout: self.timeout,
            reconnect_delay: self.reconnect_delay,
            reconnect_delay_max: self.reconnect_delay_max,
            name: self.name,
        })
    }
}

/// How a transaction engine reacts to missing replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Upper bound of receive attempts per request (at least one is made).
    pub max_retries: u32,
    /// Treat an empty reply as retryable.
    pub retry_on_empty: bool,
    /// Treat unit 0 as broadcast: send only, never wait for a reply.
    pub broadcast_enable: bool,
    /// On retry only listen again instead of re-sending the request.
    pub no_resend_on_retry: bool,
}

impl RetryPolicy {
    pub const DEFAULT_RETRIES: u32 = 3;

    /// A policy with `max_retries` attempts and all flags cleared.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn retry_on_empty(mut self, retry_on_empty: bool) -> Self {
        self.retry_on_empty = retry_on_empty;
        self
    }

    pub fn broadcast_enable(mut self, broadcast_enable: bool) -> Self {
        self.broadcast_enable = broadcast_enable;
        self
    }

    pub fn no_resend_on_retry(mut self, no_resend_on_retry: bool) -> Self {
        self.no_resend_on_retry = no_resend_on_retry;
        self
    }

    /// The number of receive attempts one request may take.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_RETRIES,
            retry_on_empty: false,
            broadcast_enable: false,
            no_resend_on_retry: false,
        }
    }
}
