//! A Modbus RTU serial transport and transaction core.
//!
//! RTU frames carry no length field; a frame ends when the line falls silent.
//! This crate turns a serial byte stream into such frames and pairs every
//! request with its reply under a retry policy. It does not encode or decode
//! Modbus PDUs and does not compute CRCs; callers hand in complete frames.
//!
//! The crate offers two flavours with identical framing rules:
//!
//! 1.  **Blocking** (`sync` feature): [`transport::SerialTransport`] and
//!     [`transaction::TransactionEngine`], bundled in
//!     [`sync_client::SerialClient`]. No automatic reconnection.
//!
//! 2.  **Async** (`async` feature): [`tokio_async::AsyncSerialTransport`] and
//!     [`tokio_async::AsyncTransactionEngine`], bundled in
//!     [`tokio_async_client::AsyncSerialClient`] which reconnects in the
//!     background with exponential backoff and reports
//!     [`reconnect::ConnectionEvent`]s.
//!
//! The `sync`, `async` and `serde` features are all enabled by default,
//! together with `bin-dependencies` for the `rtulink` tool. Library users
//! who need only one flavour can set `default-features = false`.
//!
//! ## Features
//!
//! - **Timing Model**: RTU character time, poll interval and silent interval
//!   derived from the serial settings, see [`timing`].
//! - **Silence based framing**: a frame is complete once the receive buffer
//!   stops growing for one poll interval, see [`frame`].
//! - **Retry policy**: retry on empty replies, broadcast without reply,
//!   listen-only retries, see [`protocol::RetryPolicy`].
//! - **YAML configuration** (`serde` feature), see `config`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rtu_link_lib::{
//!     protocol::{CommunicationParameters, Parity, RetryPolicy},
//!     sync_client::SerialClient,
//! };
//! use tokio_modbus::Slave;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = CommunicationParameters::builder("/dev/ttyUSB0")
//!         .baud_rate(9600)
//!         .parity(Parity::Even)
//!         .build()?;
//!     let mut client = SerialClient::new(params, RetryPolicy::new(3).retry_on_empty(true));
//!     if !client.connect() {
//!         return Err("cannot open serial port".into());
//!     }
//!
//!     // read holding register 0 of unit 1
//!     let reply = client.execute(Slave(1), &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A], None)?;
//!     println!("Reply: {reply:02X?}");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod frame;
pub mod line;
pub mod protocol;
pub mod reconnect;
pub mod timing;

pub use error::{Error, Result};

#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
#[cfg(feature = "sync")]
pub mod transport;

#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
#[cfg(feature = "sync")]
pub mod transaction;

#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
#[cfg(feature = "sync")]
pub mod sync_client;

#[cfg_attr(docsrs, doc(cfg(feature = "async")))]
#[cfg(feature = "async")]
pub mod tokio_async;

#[cfg_attr(docsrs, doc(cfg(feature = "async")))]
#[cfg(feature = "async")]
pub mod tokio_async_client;

#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
#[cfg(feature = "serde")]
pub mod config;

#[cfg(test)]
mod testing;
