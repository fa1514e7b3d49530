//! Blocking Modbus RTU serial transport.
//!
//! [`SerialTransport`] owns the serial line and turns the raw byte stream into
//! frames. RTU has no length field, so [`SerialTransport::recv`] polls the
//! receive buffer until its fill level stays unchanged for one poll interval
//! (see [`crate::frame`]). All waiting is done with thread sleeps on the
//! calling thread; there is no internal locking and no automatic reconnect,
//! call [`SerialTransport::connect`] again after a failure.
//!
//! # Example
//!
//! ```no_run
//! use rtu_link_lib::{protocol::CommunicationParameters, transport::SerialTransport};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = CommunicationParameters::builder("/dev/ttyUSB0")
//!         .baud_rate(9600)
//!         .build()?;
//!     let mut transport = SerialTransport::new(params);
//!     if !transport.connect() {
//!         return Err("cannot open serial port".into());
//!     }
//!     // read holding register 0 of unit 1, CRC included
//!     transport.send(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A])?;
//!     let frame = transport.recv(None)?;
//!     println!("Reply: {frame:02X?}");
//!     Ok(())
//! }
//! ```
use crate::error::{Error, Result};
use crate::frame::FrameDetector;
use crate::line::{LineOpener, SerialLine, SerialPortOpener};
use crate::protocol::{CommunicationParameters, ConnectionState};
use crate::timing::TimingProfile;
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::io;
use std::time::{Duration, Instant};

/// Polls `line` until the frame is complete or `timeout` elapsed and returns
/// the number of bytes of the frame.
fn wait_for_data<L: SerialLine>(line: &mut L, poll: Duration, timeout: Duration) -> io::Result<usize> {
    let start = Instant::now();
    let mut detector = FrameDetector::new();
    while start.elapsed() <= timeout {
        if detector.observe(line.bytes_to_read()?) {
            break;
        }
        std::thread::sleep(poll);
    }
    Ok(detector.size())
}

fn write_request<L: SerialLine>(line: &mut L, name: &str, request: &[u8]) -> io::Result<usize> {
    let waiting = line.bytes_to_read()?;
    if waiting > 0 {
        let stale = line.read(waiting)?;
        warn!("{name}: cleanup recv buffer before send: {stale:02X?}");
    }
    trace!("{name}: send {request:02X?}");
    line.write(request)
}

fn read_frame<L: SerialLine>(
    line: &mut L,
    size: Option<usize>,
    poll: Duration,
    timeout: Duration,
) -> io::Result<Vec<u8>> {
    let size = match size {
        Some(size) => size,
        None => wait_for_data(line, poll, timeout)?,
    };
    if size > line.bytes_to_read()? {
        wait_for_data(line, poll, timeout)?;
    }
    line.read(size)
}

/// Blocking serial transport with silence based framing.
pub struct SerialTransport<O: LineOpener = SerialPortOpener> {
    params: CommunicationParameters,
    timing: TimingProfile,
    opener: O,
    line: Option<O::Line>,
    last_frame_end: Option<Instant>,
}

impl SerialTransport {
    /// Creates a disconnected transport for a system serial port.
    pub fn new(params: CommunicationParameters) -> Self {
        Self::with_opener(params, SerialPortOpener)
    }
}

impl<O: LineOpener> SerialTransport<O> {
    /// Creates a disconnected transport that opens its line through `opener`.
    pub fn with_opener(params: CommunicationParameters, opener: O) -> Self {
        let timing = TimingProfile::from(&params);
        Self {
            params,
            timing,
            opener,
            line: None,
            last_frame_end: None,
        }
    }

    pub fn params(&self) -> &CommunicationParameters {
        &self.params
    }

    pub fn timing(&self) -> &TimingProfile {
        &self.timing
    }

    pub fn connection_state(&self) -> ConnectionState {
        if self.line.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_open(&self) -> bool {
        self.line.is_some()
    }

    /// Opens the serial line.
    ///
    /// Returns `true` when the line is open afterwards. Calling this on an
    /// open transport does nothing. Failures are logged, not returned.
    pub fn connect(&mut self) -> bool {
        if self.line.is_some() {
            return true;
        }
        match self.opener.open(&self.params, &self.timing) {
            Ok(line) => {
                info!("{}: connected to {}", self.params.name(), self.params);
                self.line = Some(line);
                self.last_frame_end = None;
            }
            Err(err) => {
                error!(
                    "{}: cannot open {}: {err}",
                    self.params.name(),
                    self.params.port()
                );
                self.close();
            }
        }
        self.line.is_some()
    }

    /// Closes the serial line. Idempotent.
    pub fn close(&mut self) {
        if self.line.take().is_some() {
            debug!("{}: closed {}", self.params.name(), self.params.port());
        }
    }

    fn not_connected(&self) -> Error {
        Error::NotConnected(self.to_string())
    }

    /// Converts a line failure into a disconnect.
    fn check<T>(&mut self, result: io::Result<T>) -> Result<T> {
        result.map_err(|source| {
            warn!(
                "{}: serial line failed, closing connection: {source}",
                self.params.name()
            );
            self.close();
            Error::TransportIo {
                name: self.params.name().to_string(),
                source,
            }
        })
    }

    /// Sleeps until the silent interval after the last received frame passed.
    fn wait_for_silence(&self) {
        if let Some(end) = self.last_frame_end {
            let silence = self.timing.silent_duration();
            let elapsed = end.elapsed();
            if elapsed < silence {
                std::thread::sleep(silence - elapsed);
            }
        }
    }

    /// Sends `request` and returns the number of bytes written.
    ///
    /// Bytes still waiting in the receive buffer belong to an earlier exchange
    /// and are discarded first, they would break the alignment of the next
    /// frame. Empty requests are not written.
    pub fn send(&mut self, request: &[u8]) -> Result<usize> {
        if self.line.is_none() {
            return Err(self.not_connected());
        }
        if request.is_empty() {
            return Ok(0);
        }
        self.wait_for_silence();

        let Some(line) = self.line.as_mut() else {
            return Err(self.not_connected());
        };
        let result = write_request(line, self.params.name(), request);
        self.check(result)
    }

    /// Receives one frame.
    ///
    /// With `size` unset, waits until a complete frame arrived and returns all
    /// of it. With `size` set, waits for the rest of the frame if fewer bytes
    /// are buffered, then returns `size` bytes; surplus bytes stay buffered.
    /// Either way the wait ends after the connect timeout, returning what
    /// arrived until then (possibly nothing).
    pub fn recv(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        let poll = self.timing.recv_poll_duration();
        let timeout = self.params.timeout();
        let Some(line) = self.line.as_mut() else {
            return Err(self.not_connected());
        };
        let result = read_frame(line, size, poll, timeout);
        let frame = self.check(result)?;
        if !frame.is_empty() {
            trace!("{}: recv {frame:02X?}", self.params.name());
            self.last_frame_end = Some(Instant::now());
        }
        Ok(frame)
    }
}

impl<O: LineOpener> fmt::Display for SerialTransport<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {} (timeout {:?})",
            self.params.name(),
            self.params,
            self.params.timeout()
        )
    }
}

impl<O: LineOpener> fmt::Debug for SerialTransport<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("name", &self.params.name())
            .field("port", &self.params.port())
            .field("state", &self.connection_state())
            .field("timeout", &self.params.timeout())
            .finish()
    }
}
