//! Scripted serial lines for unit tests.
//!
//! A [`ScriptedLine`] releases one programmed burst of bytes into its receive
//! buffer every time the buffer is polled, which lets tests describe a reply
//! that trickles in over several poll intervals. All clones share state, so a
//! test keeps a handle while the transport owns the line.
use crate::line::{LineOpener, SerialLine};
use crate::protocol::CommunicationParameters;
use crate::timing::TimingProfile;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
pub(crate) struct LineState {
    /// Bytes waiting in the receive buffer.
    pub rx: VecDeque<u8>,
    /// Bursts released into `rx`, one per poll.
    pub arrivals: VecDeque<Vec<u8>>,
    /// Every write, in order.
    pub written: Vec<Vec<u8>>,
    /// Copy written bytes into `rx`, like an RS485 adapter without echo suppression.
    pub echo: bool,
    /// Fail the next line operation with this error kind.
    pub fault: Option<io::ErrorKind>,
    pub polls: usize,
    pub reads: usize,
    pub opened: usize,
    /// Number of upcoming opens that fail.
    pub open_failures: usize,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct ScriptedLine {
    state: Arc<Mutex<LineState>>,
}

impl ScriptedLine {
    pub fn state(&self) -> MutexGuard<'_, LineState> {
        self.state.lock().unwrap()
    }

    /// Bytes already sitting in the receive buffer.
    pub fn buffer(&self, data: &[u8]) {
        self.state().rx.extend(data);
    }

    /// Schedules bursts, one released per poll.
    pub fn arrive(&self, bursts: &[&[u8]]) {
        self.state()
            .arrivals
            .extend(bursts.iter().map(|burst| burst.to_vec()));
    }

    /// A reply that arrives after `silent_polls` empty polls, in one burst.
    pub fn reply_after(&self, silent_polls: usize, data: &[u8]) {
        let mut state = self.state();
        state
            .arrivals
            .extend(std::iter::repeat_with(Vec::new).take(silent_polls));
        state.arrivals.push_back(data.to_vec());
    }

    /// One byte per poll for `polls` polls; the frame never goes quiet.
    pub fn trickle(&self, polls: usize) {
        self.state()
            .arrivals
            .extend(std::iter::repeat_with(|| vec![0xAA]).take(polls));
    }

    pub fn fail_with(&self, kind: io::ErrorKind) {
        self.state().fault = Some(kind);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    fn take_fault(state: &mut LineState) -> io::Result<()> {
        match state.fault.take() {
            Some(kind) => Err(io::Error::from(kind)),
            None => Ok(()),
        }
    }

    fn poll(&self) -> io::Result<usize> {
        let mut state = self.state();
        Self::take_fault(&mut state)?;
        state.polls += 1;
        if let Some(burst) = state.arrivals.pop_front() {
            state.rx.extend(burst);
        }
        Ok(state.rx.len())
    }

    fn take(&self, size: usize) -> io::Result<Vec<u8>> {
        let mut state = self.state();
        Self::take_fault(&mut state)?;
        state.reads += 1;
        let size = size.min(state.rx.len());
        Ok(state.rx.drain(..size).collect())
    }

    fn put(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        Self::take_fault(&mut state)?;
        state.written.push(data.to_vec());
        if state.echo {
            state.rx.extend(data);
        }
        Ok(data.len())
    }

    fn open_clone(&self) -> io::Result<Self> {
        let mut state = self.state();
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(io::Error::other("device busy"));
        }
        state.opened += 1;
        Ok(self.clone())
    }
}

impl SerialLine for ScriptedLine {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        self.poll()
    }

    fn read(&mut self, size: usize) -> io::Result<Vec<u8>> {
        self.take(size)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.put(data)
    }
}

/// Hands out clones of one [`ScriptedLine`].
#[derive(Debug, Default, Clone)]
pub(crate) struct ScriptedOpener {
    pub line: ScriptedLine,
}

impl LineOpener for ScriptedOpener {
    type Line = ScriptedLine;

    fn open(
        &self,
        _params: &CommunicationParameters,
        _timing: &TimingProfile,
    ) -> io::Result<Self::Line> {
        self.line.open_clone()
    }
}

#[cfg(feature = "async")]
mod tokio_impl {
    use super::*;
    use crate::tokio_async::{AsyncLineOpener, AsyncSerialLine};

    #[async_trait::async_trait]
    impl AsyncSerialLine for ScriptedLine {
        fn bytes_to_read(&mut self) -> io::Result<usize> {
            self.poll()
        }

        async fn read(&mut self, size: usize) -> io::Result<Vec<u8>> {
            self.take(size)
        }

        async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.put(data)
        }
    }

    impl AsyncLineOpener for ScriptedOpener {
        type Line = ScriptedLine;

        fn open(
            &self,
            _params: &CommunicationParameters,
            _timing: &TimingProfile,
        ) -> io::Result<Self::Line> {
            self.line.open_clone()
        }
    }
}

/// Parameters for a fast line with a short timeout.
pub(crate) fn fast_params() -> CommunicationParameters {
    CommunicationParameters::builder("/dev/ttyTEST0")
        .baud_rate(115200)
        .timeout(std::time::Duration::from_millis(500))
        .name("test")
        .build()
        .unwrap()
}
