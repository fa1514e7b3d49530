//! Blocking transaction engine: one request, one reply, retries.
//!
//! The engine does not own the transport; like the stateless helpers of a
//! Modbus context it borrows one per call. This keeps the transport reusable
//! for raw `send`/`recv` exchanges between transactions.
use crate::error::{Error, Result};
use crate::line::LineOpener;
use crate::protocol::{RetryPolicy, TransactionState};
use crate::transport::SerialTransport;
use log::{debug, trace, warn};
use tokio_modbus::Slave;

/// The request/reply primitives a transaction needs.
pub trait Transport {
    /// Sends `request`, returns the number of bytes written.
    fn send(&mut self, request: &[u8]) -> Result<usize>;

    /// Receives one frame, or exactly `size` bytes when given.
    fn recv(&mut self, size: Option<usize>) -> Result<Vec<u8>>;

    fn is_connected(&self) -> bool;
}

impl<O: LineOpener> Transport for SerialTransport<O> {
    fn send(&mut self, request: &[u8]) -> Result<usize> {
        SerialTransport::send(self, request)
    }

    fn recv(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        SerialTransport::recv(self, size)
    }

    fn is_connected(&self) -> bool {
        self.is_open()
    }
}

/// Drives request/reply exchanges according to a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct TransactionEngine {
    policy: RetryPolicy,
    handle_local_echo: bool,
    state: TransactionState,
}

impl TransactionEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            handle_local_echo: false,
            state: TransactionState::Idle,
        }
    }

    /// Expect every sent byte to be echoed back by the adapter and discard it.
    pub fn with_local_echo(mut self, handle_local_echo: bool) -> Self {
        self.handle_local_echo = handle_local_echo;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The state the last transaction ended in, or is currently in.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        self.state = TransactionState::Failed;
        Err(err)
    }

    /// Sends the request and consumes its local echo.
    ///
    /// Returns `false` when the echo did not match; the exchange then counts
    /// as unanswered.
    fn send_request<T: Transport + ?Sized>(&mut self, transport: &mut T, request: &[u8]) -> Result<bool> {
        self.state = TransactionState::Sending;
        let written = transport.send(request)?;
        if written != request.len() {
            warn!("Only {written} of {} request bytes written", request.len());
        }
        if self.handle_local_echo {
            let echo = transport.recv(Some(request.len()))?;
            if echo != request {
                debug!("Wrong local echo: {echo:02X?}");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Executes one request and returns the raw reply frame.
    ///
    /// * A request to the broadcast unit with broadcast enabled is only sent,
    ///   the returned frame is empty.
    /// * An empty reply is retried when `retry_on_empty` is set, up to
    ///   [`RetryPolicy::attempts`] receive attempts in total.
    ///
    /// # Errors
    ///
    /// * [`Error::RetryExhausted`] when no reply arrived.
    /// * [`Error::NotConnected`] or [`Error::TransportIo`] when the connection
    ///   failed; no further attempt is made in that case.
    pub fn execute<T: Transport + ?Sized>(
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
            if let Err(err) = transport.send(request) {
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
                echo_ok = match self.send_request(transport, request) {
                    Ok(echo_ok) => echo_ok,
                    Err(err) => return self.fail(err),
                };
            }

            self.state = TransactionState::WaitingForReply;
            let reply = if echo_ok {
                match transport.recv(response_len) {
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
