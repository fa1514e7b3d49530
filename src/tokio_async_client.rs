//! Reconnecting async RTU client.
//!
//! [`AsyncSerialClient`] shares one [`AsyncSerialTransport`] between the caller
//! and a background reconnect task. When the initial connect fails, or a
//! transaction loses the connection, the task retries the connect with an
//! exponential [`Backoff`] until it succeeds. Callers never wait for it; a
//! transaction issued while the line is down fails with
//! [`Error::NotConnected`](crate::error::Error::NotConnected).
//!
//! Connection state transitions are published as [`ConnectionEvent`]s on the
//! channel returned by [`AsyncSerialClient::events`].
//!
//! ## Example
//!
//! ```no_run
//! use rtu_link_lib::{
//!     protocol::{CommunicationParameters, RetryPolicy},
//!     tokio_async_client::AsyncSerialClient,
//! };
//! use tokio_modbus::Slave;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = CommunicationParameters::builder("/dev/ttyUSB0").build()?;
//!     let mut client = AsyncSerialClient::new(params, RetryPolicy::default());
//!     let mut events = client.events();
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("Connection {event}");
//!         }
//!     });
//!
//!     client.connect().await;
//!     let request = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
//!     let reply = client.execute(Slave(1), &request, None).await?;
//!     println!("Reply: {reply:02X?}");
//!     Ok(())
//! }
//! ```
use crate::error::Result;
use crate::protocol::{CommunicationParameters, RetryPolicy, TransactionState};
use crate::reconnect::{Backoff, ConnectionEvent};
use crate::tokio_async::{AsyncLineOpener, AsyncSerialTransport, AsyncTransactionEngine, TokioSerialOpener};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_modbus::Slave;

type EventSender = Option<mpsc::UnboundedSender<ConnectionEvent>>;

fn notify(events: &EventSender, event: ConnectionEvent) {
    if let Some(tx) = events {
        // a dropped receiver only means nobody listens anymore
        let _ = tx.send(event);
    }
}

async fn reconnect_loop<O: AsyncLineOpener>(
    transport: Arc<Mutex<AsyncSerialTransport<O>>>,
    mut backoff: Backoff,
    events: EventSender,
) {
    while let Some(delay) = backoff.next_delay() {
        tokio::time::sleep(delay).await;
        let attempt = backoff.attempts();
        notify(&events, ConnectionEvent::Reconnecting { attempt, delay });

        let mut transport = transport.lock().await;
        if transport.connect() {
            info!("{}: reconnected after {attempt} attempt(s)", transport.params().name());
            notify(&events, ConnectionEvent::Connected);
            return;
        }
        debug!(
            "{}: reconnect attempt {attempt} failed, next in {:?}",
            transport.params().name(),
            backoff.current()
        );
    }
}

/// Async client that reconnects in the background.
pub struct AsyncSerialClient<O: AsyncLineOpener = TokioSerialOpener> {
    transport: Arc<Mutex<AsyncSerialTransport<O>>>,
    engine: AsyncTransactionEngine,
    backoff: Backoff,
    events: EventSender,
    reconnect_task: Option<JoinHandle<()>>,
    auto_reconnect: bool,
}

impl AsyncSerialClient {
    /// Creates a disconnected client for a system serial port.
    pub fn new(params: CommunicationParameters, policy: RetryPolicy) -> Self {
        Self::with_opener(params, policy, TokioSerialOpener)
    }
}

impl<O: AsyncLineOpener> AsyncSerialClient<O> {
    pub fn with_opener(params: CommunicationParameters, policy: RetryPolicy, opener: O) -> Self {
        let backoff = Backoff::from(&params);
        let engine = AsyncTransactionEngine::new(policy).with_local_echo(params.handle_local_echo());
        Self {
            transport: Arc::new(Mutex::new(AsyncSerialTransport::with_opener(params, opener))),
            engine,
            backoff,
            events: None,
            reconnect_task: None,
            auto_reconnect: false,
        }
    }

    /// Returns a receiver for connection events. Only the receiver of the
    /// latest call gets events.
    pub fn events(&mut self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Clones the shared transport, e.g. for raw `send`/`recv` exchanges.
    pub fn clone_shared(&self) -> Arc<Mutex<AsyncSerialTransport<O>>> {
        self.transport.clone()
    }

    /// Opens the serial line.
    ///
    /// On failure a background reconnect is scheduled, unless the reconnect
    /// delay is zero. A successful connect cancels a pending reconnect.
    /// Returns whether the line is open now.
    pub async fn connect(&mut self) -> bool {
        self.auto_reconnect = true;
        let connected = self.transport.lock().await.connect();
        if connected {
            self.abort_reconnect();
            notify(&self.events, ConnectionEvent::Connected);
        } else {
            notify(&self.events, ConnectionEvent::Disconnected);
            self.schedule_reconnect();
        }
        connected
    }

    /// Closes the line and stops any pending reconnect.
    pub async fn close(&mut self) {
        self.auto_reconnect = false;
        self.abort_reconnect();
        let mut transport = self.transport.lock().await;
        if transport.is_open() {
            transport.close();
            notify(&self.events, ConnectionEvent::Disconnected);
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_open()
    }

    /// Whether a background reconnect is pending.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnect_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.engine.state()
    }

    /// Executes one request and returns the reply frame.
    ///
    /// A connection failure is returned to the caller; the request is not
    /// repeated. When this call lost an open line, a `Disconnected` event is
    /// published and a background reconnect scheduled.
    pub async fn execute(&mut self, unit: Slave, request: &[u8], response_len: Option<usize>) -> Result<Vec<u8>> {
        let (result, lost) = {
            let mut transport = self.transport.lock().await;
            let was_open = transport.is_open();
            let result = self
                .engine
                .execute(&mut *transport, unit, request, response_len)
                .await;
            (result, was_open && !transport.is_open())
        };
        if let Err(err) = &result {
            if err.is_connection_error() {
                warn!("Unit {}: {err}", unit.0);
            }
        }
        if lost {
            notify(&self.events, ConnectionEvent::Disconnected);
            self.schedule_reconnect();
        }
        result
    }

    fn schedule_reconnect(&mut self) {
        if !self.auto_reconnect || self.is_reconnecting() {
            return;
        }
        if !self.backoff.is_enabled() {
            debug!("Reconnect delay is zero, not reconnecting");
            return;
        }
        let task = reconnect_loop(self.transport.clone(), self.backoff.clone(), self.events.clone());
        self.reconnect_task = Some(tokio::spawn(task));
    }

    fn abort_reconnect(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }
}

impl<O: AsyncLineOpener> Drop for AsyncSerialClient<O> {
    fn drop(&mut self) {
        self.abort_reconnect();
    }
}
