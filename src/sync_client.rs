//! Blocking RTU client.
//!
//! [`SerialClient`] bundles one [`SerialTransport`] with one
//! [`TransactionEngine`]. It never reconnects by itself: after a connection
//! error call [`SerialClient::connect`] again.
//!
//! ## Example
//!
//! ```no_run
//! use rtu_link_lib::{
//!     protocol::{CommunicationParameters, RetryPolicy},
//!     sync_client::SerialClient,
//! };
//! use tokio_modbus::Slave;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = CommunicationParameters::builder("/dev/ttyUSB0").build()?;
//!     let mut client = SerialClient::new(params, RetryPolicy::new(3).retry_on_empty(true));
//!     if !client.connect() {
//!         return Err("cannot open serial port".into());
//!     }
//!
//!     let request = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
//!     let reply = client.execute(Slave(1), &request, None)?;
//!     println!("Reply: {reply:02X?}");
//!     Ok(())
//! }
//! ```
use crate::error::Result;
use crate::line::{LineOpener, SerialPortOpener};
use crate::protocol::{CommunicationParameters, ConnectionState, RetryPolicy, TransactionState};
use crate::transaction::TransactionEngine;
use crate::transport::SerialTransport;
use tokio_modbus::Slave;

/// Blocking client for request/reply exchanges on one serial line.
#[derive(Debug)]
pub struct SerialClient<O: LineOpener = SerialPortOpener> {
    transport: SerialTransport<O>,
    engine: TransactionEngine,
}

impl SerialClient {
    /// Creates a disconnected client for a system serial port.
    pub fn new(params: CommunicationParameters, policy: RetryPolicy) -> Self {
        Self::with_opener(params, policy, SerialPortOpener)
    }
}

impl<O: LineOpener> SerialClient<O> {
    /// Creates a disconnected client that opens its line through `opener`.
    pub fn with_opener(params: CommunicationParameters, policy: RetryPolicy, opener: O) -> Self {
        let engine = TransactionEngine::new(policy).with_local_echo(params.handle_local_echo());
        Self {
            transport: SerialTransport::with_opener(params, opener),
            engine,
        }
    }

    /// Opens the serial line, returns `true` when it is open afterwards.
    pub fn connect(&mut self) -> bool {
        self.transport.connect()
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.connection_state()
    }

    /// State of the last transaction.
    pub fn transaction_state(&self) -> TransactionState {
        self.engine.state()
    }

    pub fn transport(&self) -> &SerialTransport<O> {
        &self.transport
    }

    /// Executes one request and returns the reply frame, see
    /// [`TransactionEngine::execute`].
    pub fn execute(&mut self, unit: Slave, request: &[u8], response_len: Option<usize>) -> Result<Vec<u8>> {
        self.engine
            .execute(&mut self.transport, unit, request, response_len)
    }

    /// Sends raw bytes without waiting for a reply.
    pub fn send(&mut self, request: &[u8]) -> Result<usize> {
        self.transport.send(request)
    }

    /// Receives one raw frame, see [`SerialTransport::recv`].
    pub fn recv(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.transport.recv(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testing::{fast_params, ScriptedOpener};
    use assert_matches::assert_matches;

    const REQUEST: [u8; 8] = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
    const REPLY: [u8; 7] = [0x01, 0x03, 0x02, 0x00, 0x2A, 0x38, 0x5B];

    #[test]
    fn execute_round_trip() {
        let opener = ScriptedOpener::default();
        let line = opener.line.clone();
        let mut client = SerialClient::with_opener(fast_params(), RetryPolicy::default(), opener);
        assert!(client.connect());

        line.reply_after(2, &REPLY);
        let reply = client.execute(Slave(1), &REQUEST, None).unwrap();
        assert_eq!(reply, REPLY);
        assert_eq!(line.written(), vec![REQUEST.to_vec()]);
        assert_eq!(client.transaction_state(), TransactionState::Complete);
    }

    #[test]
    fn execute_consumes_local_echo() {
        let opener = ScriptedOpener::default();
        let line = opener.line.clone();
        line.state().echo = true;
        let params = CommunicationParameters::builder("/dev/ttyTEST0")
            .baud_rate(115200)
            .handle_local_echo(true)
            .timeout(std::time::Duration::from_millis(200))
            .build()
            .unwrap();
        let mut client = SerialClient::with_opener(params, RetryPolicy::default(), opener);
        assert!(client.connect());

        line.reply_after(1, &REPLY);
        assert_eq!(client.execute(Slave(1), &REQUEST, None).unwrap(), REPLY);
    }

    #[test]
    fn broadcast_with_local_echo_does_not_read() {
        let opener = ScriptedOpener::default();
        let line = opener.line.clone();
        line.state().echo = true;
        let params = CommunicationParameters::builder("/dev/ttyTEST0")
            .baud_rate(115200)
            .handle_local_echo(true)
            .timeout(std::time::Duration::from_millis(200))
            .build()
            .unwrap();
        let policy = RetryPolicy::default().broadcast_enable(true);
        let mut client = SerialClient::with_opener(params, policy, opener);
        assert!(client.connect());

        let reply = client.execute(Slave::broadcast(), &REQUEST, None).unwrap();
        assert!(reply.is_empty());
        assert_eq!(client.transaction_state(), TransactionState::Complete);
        assert_eq!(line.state().reads, 0);
        assert_eq!(line.written(), vec![REQUEST.to_vec()]);
    }

    #[test]
    fn silent_device_exhausts_retries() {
        let opener = ScriptedOpener::default();
        let line = opener.line.clone();
        let params = CommunicationParameters::builder("/dev/ttyTEST0")
            .baud_rate(115200)
            .timeout(std::time::Duration::from_millis(20))
            .build()
            .unwrap();
        let policy = RetryPolicy::new(2).retry_on_empty(true);
        let mut client = SerialClient::with_opener(params, policy, opener);
        assert!(client.connect());

        assert_matches!(
            client.execute(Slave(1), &REQUEST, None),
            Err(Error::RetryExhausted { attempts: 2 })
        );
        assert_eq!(line.written().len(), 2);
        assert!(client.is_connected());
    }

    #[test]
    fn no_automatic_reconnect() {
        let opener = ScriptedOpener::default();
        let line = opener.line.clone();
        let mut client = SerialClient::with_opener(fast_params(), RetryPolicy::default(), opener);
        assert!(client.connect());

        line.fail_with(std::io::ErrorKind::BrokenPipe);
        let err = client.execute(Slave(1), &REQUEST, None).unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_matches!(
            client.execute(Slave(1), &REQUEST, None),
            Err(Error::NotConnected(_))
        );
        assert_eq!(line.state().opened, 1);

        assert!(client.connect());
        line.reply_after(1, &REPLY);
        assert_eq!(client.execute(Slave(1), &REQUEST, None).unwrap(), REPLY);
    }
}
