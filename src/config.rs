//! YAML configuration of a serial client.
//!
//! ```yaml
//! serial:
//!   port: /dev/ttyUSB0
//!   baud_rate: 9600
//!   parity: E
//!   timeout: 1s 500ms
//!   reconnect_delay: 100ms
//! retry:
//!   retries: 5
//!   retry_on_empty: true
//! ```
//!
//! Missing keys take the defaults of [`CommunicationParameters::builder`] and
//! [`RetryPolicy::default`]. Values are validated when converting into those
//! types, not while parsing.
use crate::protocol::{self as proto, CommunicationParameters, RetryPolicy};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stopbits")]
    pub stopbits: f32,
    #[serde(default)]
    pub handle_local_echo: bool,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,
    #[serde(default = "default_reconnect_delay_max", with = "humantime_serde")]
    pub reconnect_delay_max: Duration,
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_baud_rate() -> u32 {
    CommunicationParameters::DEFAULT_BAUD_RATE
}

fn default_bytesize() -> u8 {
    8
}

fn default_parity() -> String {
    String::from("N")
}

fn default_stopbits() -> f32 {
    1.0
}

fn default_timeout() -> Duration {
    CommunicationParameters::DEFAULT_TIMEOUT
}

fn default_reconnect_delay() -> Duration {
    CommunicationParameters::DEFAULT_RECONNECT_DELAY
}

fn default_reconnect_delay_max() -> Duration {
    CommunicationParameters::DEFAULT_RECONNECT_DELAY_MAX
}

fn default_name() -> String {
    String::from(CommunicationParameters::DEFAULT_NAME)
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub retry_on_empty: bool,
    #[serde(default)]
    pub broadcast_enable: bool,
    #[serde(default)]
    pub no_resend_on_retry: bool,
}

fn default_retries() -> u32 {
    RetryPolicy::DEFAULT_RETRIES
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_on_empty: false,
            broadcast_enable: false,
            no_resend_on_retry: false,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(config.retries)
            .retry_on_empty(config.retry_on_empty)
            .broadcast_enable(config.broadcast_enable)
            .no_resend_on_retry(config.no_resend_on_retry)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub serial: SerialConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ClientConfig {
    /// Parses a YAML document.
    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_reader(reader)
    }
}

impl TryFrom<&SerialConfig> for CommunicationParameters {
    type Error = proto::Error;

    fn try_from(config: &SerialConfig) -> Result<Self, Self::Error> {
        CommunicationParameters::builder(config.port.as_str())
            .baud_rate(config.baud_rate)
            .data_bits(config.bytesize.try_into()?)
            .parity(config.parity.parse()?)
            .stop_bits(config.stopbits.try_into()?)
            .handle_local_echo(config.handle_local_echo)
            .timeout(config.timeout)
            .reconnect_delay(config.reconnect_delay)
            .reconnect_delay_max(config.reconnect_delay_max)
            .name(config.name.as_str())
            .build()
    }
}

impl TryFrom<&ClientConfig> for (CommunicationParameters, RetryPolicy) {
    type Error = proto::Error;

    fn try_from(config: &ClientConfig) -> Result<Self, Self::Error> {
        Ok((
            CommunicationParameters::try_from(&config.serial)?,
            RetryPolicy::from(&config.retry),
        ))
    }
}
