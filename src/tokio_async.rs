//! Non-blocking RTU transport and transaction engine on `tokio`.
//!
//! Same framing and retry rules as the blocking [`crate::transport`] and
//! [`crate::transaction`] modules, but every wait (receive polls, the silent
//! interval before a send, the byte read itself) is a `tokio::time` suspension
//! point instead of a thread sleep. Opening a port stays synchronous.
//!
//! Reconnection lives one level up in [`crate::tokio_async_client`].
//!
//! ## Example
//!
//! ```no_run
//! use rtu_link_lib::{
//!     protocol::{CommunicationParameters, RetryPolicy},
//!     tokio_async::{AsyncSerialTransport, AsyncTransactionEngine},
//! };
//! use tokio_modbus::Slave;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = CommunicationParameters::builder("/dev/ttyUSB0").build()?;
//!     let mut transport = AsyncSerialTransport::new(params);
//!     if !transport.connect() {
//!         return Err("cannot open serial port".into());
//!     }
//!     let mut engine = AsyncTransactionEngine::new(RetryPolicy::default());
//!     let request = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
//!     let reply = engine.execute(&mut transport, Slave(1), &request, None).await?;
//!     println!("Reply: {reply:02X?}");
//!     Ok(())
//! }
//! ```
use crate::error::{Error, Result};
use crate::frame::FrameDetector;
use crate::line::port_builder;
use crate::protocol::{CommunicationParameters, ConnectionState, RetryPolicy, TransactionState};
use crate::timing::TimingProfile;
use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_modbus::Slave;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// A serial line driven from async code.
#[async_trait]
pub trait AsyncSerialLine: Send {
    /// Number of bytes waiting in the receive buffer.
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// Reads up to `size` bytes, returning fewer when the line timeout elapsed.
    async fn read(&mut self, size: usize) -> io::Result<Vec<u8>>;

    async fn write(&mut self, data: &[u8]) -> io::Result<usize>;
}

/// Opens [`AsyncSerialLine`]s with exclusive access.
pub trait AsyncLineOpener: Send + Sync + 'static {
    type Line: AsyncSerialLine + 'static;

    fn open(
        &self,
        params: &CommunicationParameters,
        timing: &TimingProfile,
    ) -> io::Result<Self::Line>;
}

/// Opens system serial ports as `tokio_serial::SerialStream`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSerialOpener;

impl AsyncLineOpener for TokioSerialOpener {
    type Line = TokioSerialLine;

    fn open(
        &self,
        params: &CommunicationParameters,
        timing: &TimingProfile,
    ) -> io::Result<Self::Line> {
        #[allow(unused_mut)]
        let mut stream = port_builder(params)?.open_native_async()?;
        #[cfg(unix)]
        stream.set_exclusive(true)?;
        Ok(TokioSerialLine {
            stream,
            timeout: params.timeout(),
            inter_byte_timeout: timing.inter_byte_duration(),
        })
    }
}

/// A system serial port read and written through tokio.
#[derive(Debug)]
pub struct TokioSerialLine {
    stream: SerialStream,
    timeout: Duration,
    inter_byte_timeout: Option<Duration>,
}

#[async_trait]
impl AsyncSerialLine for TokioSerialLine {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(self.stream.bytes_to_read()? as usize)
    }

    async fn read(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0; size];
        let mut filled = 0;
        while filled < size {
            let mut wait = deadline.saturating_duration_since(Instant::now());
            if let (true, Some(gap)) = (filled > 0, self.inter_byte_timeout) {
                wait = wait.min(gap);
            }
            match tokio::time::timeout(wait, self.stream.read(&mut buf[filled..])).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(err)) => return Err(err),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(data.len())
    }
}

async fn wait_for_data<L: AsyncSerialLine>(line: &mut L, poll: Duration, timeout: Duration) -> io::Result<usize> {
    let deadline = Instant::now() + timeout;
    let mut detector = FrameDetector::new();
    while Instant::now() <= deadline {
        if detector.observe(line.bytes_to_read()?) {
            break;
        }
        tokio::time::sleep(poll).await;
    }
    Ok(detector.size())
}

async fn write_request<L: AsyncSerialLine>(line: &mut L, name: &str, request: &[u8]) -> io::Result<usize> {
    let waiting = line.bytes_to_read()?;
    if waiting > 0 {
        let stale = line.read(waiting).await?;
        warn!("{name}: cleanup recv buffer before send: {stale:02X?}");
    }
    trace!("{name}: send {request:02X?}");
    line.write(request).await
}

async fn read_frame<L: AsyncSerialLine>(
    line: &mut L,
    size: Option<usize>,
    poll: Duration,
    timeout: Duration,
) -> io::Result<Vec<u8>> {
    let size = match size {
        Some(size) => size,
        None => wait_for_data(line, poll, timeout).await?,
    };
    if size > line.bytes_to_read()? {
        wait_for_data(line, poll, timeout).await?;
    }
    line.read(size).await
}

/// Async serial transport with silence based framing.
pub struct AsyncSerialTransport<O: AsyncLineOpener = TokioSerialOpener> {
    params: CommunicationParameters,
    timing: TimingProfile,
    opener: O,
    line: Option<O::Line>,
    last_frame_end: Option<Instant>,
}

impl AsyncSerialTransport {
    /// Creates a disconnected transport for a system serial port.
    pub fn new(params: CommunicationParameters) -> Self {
        Self::with_opener(params, TokioSerialOpener)
    }
}

impl<O: AsyncLineOpener> AsyncSerialTransport<O> {
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

    /// Opens the serial line, returns `true` when it is open afterwards.
    ///
    /// Must be called from within a tokio runtime.
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

    pub fn close(&mut self) {
        if self.line.take().is_some() {
            debug!("{}: closed {}", self.params.name(), self.params.port());
        }
    }

    fn not_connected(&self) -> Error {
        Error::NotConnected(self.to_string())
    }

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

    /// End of the silent interval after the last received frame.
    fn silence_deadline(&self) -> Option<Instant> {
        self.last_frame_end
            .map(|end| end + self.timing.silent_duration())
    }

    /// Sends `request`, see [`crate::transport::SerialTransport::send`].
    pub async fn send(&mut self, request: &[u8]) -> Result<usize> {
        if self.line.is_none() {
            return Err(self.not_connected());
        }
        if request.is_empty() {
            return Ok(0);
        }
        let deadline = self.silence_deadline();
        if let Some(deadline) = deadline {
            tokio::time::sleep_until(deadline).await;
        }

        let Some(line) = self.line.as_mut() else {
            return Err(self.not_connected());
        };
        let result = write_request(line, self.params.name(), request).await;
        self.check(result)
    }

    /// Receives one frame, see [`crate::transport::SerialTransport::recv`].
    pub async fn recv(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        let poll = self.timing.recv_poll_duration();
        let timeout = self.params.timeout();
        let Some(line) = self.line.as_mut() else {
            return Err(self.not_connected());
        };
        let result = read_frame(line, size, poll, timeout).await;
        let frame = self.check(result)?;
        if !frame.is_empty() {
            trace!("{}: recv {frame:02X?}", self.params.name());
            self.last_frame_end = Some(Instant::now());
        }
        Ok(frame)
    }
}

impl<O: AsyncLineOpener> fmt::Display for AsyncSerialTransport<O> {
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

impl<O: AsyncLineOpener> fmt::Debug for AsyncSerialTransport<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSerialTransport")
            .field("name", &self.params.name())
            .field("port", &self.params.port())
            .field("state", &self.connection_state())
            .field("timeout", &self.params.timeout())
            .finish()
    }
}

/// The request/reply primitives an async transaction needs.
#[async_trait]
pub trait AsyncTransport: Send {
    async fn send(&mut self, request: &[u8]) -> Result<usize>;

    async fn recv(&mut self, size: Option<usize>) -> Result<Vec<u8>>;

    fn is_connected(&self) -> bool;
}

#[async_trait]
impl<O: AsyncLineOpener> AsyncTransport for AsyncSerialTransport<O> {
    async fn send(&mut self, request: &[u8]) -> Result<usize> {
        AsyncSerialTransport::send(self, request).await
    }

    async fn recv(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        AsyncSerialTransport::recv(self, size).await
    }

    fn is_connected(&self) -> bool {
        self.is_open()
    }
}

/// Async counterpart of [`crate::transaction::TransactionEngine`].
#[derive(Debug, Clone)]
pub struct AsyncTransactionEngine {
    policy: RetryPolicy,
    handle_local_echo: bool,
    state: TransactionState,
}

impl AsyncTransactionEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            handle_local_echo: false,
            state: TransactionState::Idle,
        }
    }

    pub fn with_local_echo(mut self, handle_local_echo: bool) -> Self {
        self.handle_local_echo = handle_local_echo;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        self.state = TransactionState::Failed;
        Err(err)
    }

    async fn send_request<T: AsyncTransport + ?Sized>(&mut self, transport: &mut T, request: &[u8]) -> Result<bool> {
        self.state = TransactionState::Sending;
        let written = transport.send(request).await?;
        if written != request.len() {
            warn!("Only {written} of {} request bytes written", request.len());
        }
        if self.handle_local_echo {
            let echo = transport.recv(Some(request.len())).await?;
            if echo != request {
                debug!("Wrong local echo: {echo:02X?}");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Executes one request and returns the raw reply frame, with the rules of
    /// [`crate::transaction::TransactionEngine::execute`].
    pub async fn execute<T: AsyncTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        unit: Slave,
        request: &[u8],
        response_len: Option<usize>,
    ) -> Result<Vec<u8>> {
        self.state = TransactionState::Idle;
        if !transport.is_connected() {
            return self.fail(Error::NotConnected(format!("unit {}", unit.0)));
        }

        if self.policy.broadcast_enable && unit.is_broadcast() {
            // the local echo is left in the buffer, the next send drains it
            self.state = TransactionState::Sending;
            if let Err(err) = transport.send(request).await {
                return self.fail(err);
            }
            debug!("Broadcast request sent, no reply expected");
            self.state = TransactionState::Complete;
            return Ok(Vec::new());
        }

        let attempts = self.policy.attempts();
        let mut attempt = 1;
        let mut resend = true;
        loop {
            let mut echo_ok = true;
            if resend {
                echo_ok = match self.send_request(transport, request).await {
                    Ok(echo_ok) => echo_ok,
                    Err(err) => return self.fail(err),
                };
            }

            self.state = TransactionState::WaitingForReply;
            let reply = if echo_ok {
                match transport.recv(response_len).await {
                    Ok(reply) => reply,
                    Err(err) => return self.fail(err),
                }
            } else {
                Vec::new()
            };

            if !reply.is_empty() {
                trace!("Unit {}: reply after {attempt} attempt(s)", unit.0);
                self.state = TransactionState::Complete;
                return Ok(reply);
            }

            if !self.policy.retry_on_empty || attempt >= attempts {
                warn!("Unit {}: no response after {attempt} attempt(s)", unit.0);
                return self.fail(Error::RetryExhausted { attempts: attempt });
            }

            debug!("Unit {}: empty reply, retry {attempt}/{attempts}", unit.0);
            self.state = TransactionState::Retrying;
            attempt += 1;
            resend = !self.policy.no_resend_on_retry;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_params, ScriptedLine, ScriptedOpener};
    use assert_matches::assert_matches;

    const REQUEST: [u8; 8] = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
    const REPLY: [u8; 7] = [0x01, 0x03, 0x02, 0x00, 0x2A, 0x38, 0x5B];

    fn connected() -> (AsyncSerialTransport<ScriptedOpener>, ScriptedLine) {
        let opener = ScriptedOpener::default();
        let line = opener.line.clone();
        let mut transport = AsyncSerialTransport::with_opener(fast_params(), opener);
        assert!(transport.connect());
        (transport, line)
    }

    #[tokio::test(start_paused = true)]
    async fn requires_connection() {
        let opener = ScriptedOpener::default();
        let line = opener.line.clone();
        let mut transport = AsyncSerialTransport::with_opener(fast_params(), opener);
        assert_matches!(transport.send(&REQUEST).await, Err(Error::NotConnected(_)));
        assert_matches!(transport.recv(None).await, Err(Error::NotConnected(_)));
        assert_eq!(line.state().polls, 0);

        assert!(transport.connect());
        assert!(transport.connect());
        assert_eq!(line.state().opened, 1);
        transport.close();
        transport.close();
        assert_matches!(transport.recv(Some(1)).await, Err(Error::NotConnected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn frame_is_returned_once_count_is_stable() {
        let (mut transport, line) = connected();
        line.arrive(&[&[], &[0x01, 0x03], &[0x02, 0x00, 0x2A], &[0x38, 0x5B]]);
        assert_eq!(transport.recv(None).await.unwrap(), REPLY);
    }

    #[tokio::test(start_paused = true)]
    async fn recv_times_out_empty() {
        let (mut transport, _line) = connected();
        let start = Instant::now();
        assert!(transport.recv(None).await.unwrap().is_empty());
        assert!(start.elapsed() >= transport.params().timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn recv_returns_partial_frame_at_timeout() {
        let (mut transport, line) = connected();
        line.trickle(10_000);
        let timeout = transport.params().timeout();
        let poll = transport.timing().recv_poll_duration();

        let start = Instant::now();
        let frame = transport.recv(None).await.unwrap();
        let elapsed = start.elapsed();
        assert!(!frame.is_empty());
        assert!(frame.len() < 10_000);
        assert!(elapsed >= timeout);
        assert!(elapsed <= timeout + 2 * poll);
        assert!(transport.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn send_drains_stale_bytes() {
        let (mut transport, line) = connected();
        line.buffer(&[0xFF, 0xFE]);
        assert_eq!(transport.send(&REQUEST).await.unwrap(), REQUEST.len());
        assert!(line.state().rx.is_empty());
        assert_eq!(transport.send(&[]).await.unwrap(), 0);
        assert_eq!(line.written(), vec![REQUEST.to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn send_waits_for_silent_interval() {
        let (mut transport, line) = connected();
        line.buffer(&REPLY);
        let start = Instant::now();
        transport.recv(Some(REPLY.len())).await.unwrap();
        transport.send(&REQUEST).await.unwrap();
        assert!(start.elapsed() >= transport.timing().silent_duration());
    }

    #[tokio::test(start_paused = true)]
    async fn line_failure_closes_transport() {
        let (mut transport, line) = connected();
        line.fail_with(io::ErrorKind::BrokenPipe);
        let err = transport.recv(None).await.unwrap_err();
        assert_matches!(err, Error::TransportIo { .. });
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_retries_empty_replies() {
        let (mut transport, line) = connected();
        // first attempt times out, the second gets the reply
        let silent_polls = 600;
        line.reply_after(silent_polls, &REPLY);
        let mut engine = AsyncTransactionEngine::new(RetryPolicy::new(3).retry_on_empty(true));
        let reply = engine
            .execute(&mut transport, Slave(1), &REQUEST, None)
            .await
            .unwrap();
        assert_eq!(reply, REPLY);
        assert_eq!(line.written().len(), 2);
        assert_eq!(engine.state(), TransactionState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_exhausts_retries() {
        let (mut transport, line) = connected();
        let mut engine = AsyncTransactionEngine::new(RetryPolicy::new(3).retry_on_empty(true));
        assert_matches!(
            engine.execute(&mut transport, Slave(1), &REQUEST, None).await,
            Err(Error::RetryExhausted { attempts: 3 })
        );
        assert_eq!(line.written().len(), 3);
        assert_eq!(engine.state(), TransactionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_broadcast_skips_receive() {
        let (mut transport, line) = connected();
        let mut engine = AsyncTransactionEngine::new(RetryPolicy::default().broadcast_enable(true));
        let reply = engine
            .execute(&mut transport, Slave::broadcast(), &REQUEST, None)
            .await
            .unwrap();
        assert!(reply.is_empty());
        assert_eq!(line.state().reads, 0);
        assert_eq!(line.written(), vec![REQUEST.to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_broadcast_leaves_local_echo_unread() {
        let (mut transport, line) = connected();
        line.state().echo = true;
        let mut engine = AsyncTransactionEngine::new(RetryPolicy::default().broadcast_enable(true))
            .with_local_echo(true);
        let reply = engine
            .execute(&mut transport, Slave::broadcast(), &REQUEST, None)
            .await
            .unwrap();
        assert!(reply.is_empty());
        assert_eq!(engine.state(), TransactionState::Complete);
        assert_eq!(line.state().reads, 0);
        assert_eq!(line.state().rx.len(), REQUEST.len());
    }

    #[tokio::test(start_paused = true)]
    async fn engine_stops_on_connection_error() {
        let (mut transport, line) = connected();
        line.fail_with(io::ErrorKind::BrokenPipe);
        let mut engine = AsyncTransactionEngine::new(RetryPolicy::new(3).retry_on_empty(true));
        let err = engine
            .execute(&mut transport, Slave(1), &REQUEST, None)
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
        assert!(line.written().is_empty());
        assert!(!transport.is_open());
    }
}
