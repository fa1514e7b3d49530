//! The serial device seam of the blocking transport.
//!
//! [`SerialLine`] is the minimal capability set the transport needs from a
//! serial back-end: a byte count query, a bounded read, a write. Closing is
//! done by dropping the line. [`LineOpener`] opens lines with exclusive
//! access; [`SerialPortOpener`] does so with the `serialport` crate.
use crate::protocol::{CommunicationParameters, DataBits, Parity, StopBits};
use crate::timing::TimingProfile;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

impl TryFrom<StopBits> for serialport::StopBits {
    type Error = io::Error;

    fn try_from(bits: StopBits) -> Result<Self, Self::Error> {
        match bits {
            StopBits::One => Ok(serialport::StopBits::One),
            StopBits::Two => Ok(serialport::StopBits::Two),
            StopBits::OnePointFive => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "1.5 stop bits are not supported by the serial back-end",
            )),
        }
    }
}

/// Creates a `serialport::SerialPortBuilder` with the byte geometry of `params`.
///
/// The port timeout is the connect timeout; it bounds every blocking read.
pub fn port_builder(params: &CommunicationParameters) -> io::Result<serialport::SerialPortBuilder> {
    Ok(serialport::new(params.port(), params.baud_rate())
        .data_bits(params.data_bits().into())
        .parity(params.parity().into())
        .stop_bits(params.stop_bits().try_into()?)
        .flow_control(serialport::FlowControl::None)
        .timeout(params.timeout()))
}

/// A blocking serial line.
pub trait SerialLine {
    /// Number of bytes waiting in the receive buffer.
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// Reads up to `size` bytes. Blocks until they arrived or the line timeout
    /// elapsed, in which case fewer bytes are returned.
    fn read(&mut self, size: usize) -> io::Result<Vec<u8>>;

    /// Writes `data` and returns the number of bytes written.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;
}

/// Opens [`SerialLine`]s with exclusive access.
pub trait LineOpener {
    type Line: SerialLine;

    /// Opens the line described by `params` and applies the inter byte timeout
    /// of `timing`.
    fn open(
        &self,
        params: &CommunicationParameters,
        timing: &TimingProfile,
    ) -> io::Result<Self::Line>;
}

/// Opens system serial ports through the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortOpener;

impl LineOpener for SerialPortOpener {
    type Line = SystemLine;

    fn open(
        &self,
        params: &CommunicationParameters,
        timing: &TimingProfile,
    ) -> io::Result<Self::Line> {
        let builder = port_builder(params)?;

        #[cfg(unix)]
        let port: Box<dyn SerialPort> = {
            let mut port = builder.open_native()?;
            // TIOCEXCL, a second open of the device fails with EBUSY
            port.set_exclusive(true)?;
            Box::new(port)
        };
        // COM ports are always opened exclusively on Windows
        #[cfg(not(unix))]
        let port = builder.open()?;

        Ok(SystemLine {
            port,
            timeout: params.timeout(),
            inter_byte_timeout: timing.inter_byte_duration(),
        })
    }
}

/// A system serial port.
///
/// `serialport` only knows a single read timeout. The inter byte timeout is
/// emulated by shortening the timeout once the first byte of a read arrived.
pub struct SystemLine {
    port: Box<dyn SerialPort>,
    timeout: Duration,
    inter_byte_timeout: Option<Duration>,
}

impl std::fmt::Debug for SystemLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemLine")
            .field("port", &self.port.name())
            .field("timeout", &self.timeout)
            .field("inter_byte_timeout", &self.inter_byte_timeout)
            .finish()
    }
}

impl SystemLine {
    fn read_bounded(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        let mut gap_armed = false;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    if let (false, Some(gap)) = (gap_armed, self.inter_byte_timeout) {
                        self.port.set_timeout(gap)?;
                        gap_armed = true;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        if gap_armed {
            self.port.set_timeout(self.timeout)?;
        }
        Ok(filled)
    }
}

impl SerialLine for SystemLine {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; size];
        let filled = self.read_bounded(&mut buf)?;
        buf.truncate(filled);
        Ok(buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn geometry_conversion() {
        assert_eq!(
            serialport::DataBits::from(DataBits::Seven),
            serialport::DataBits::Seven
        );
        assert_eq!(
            serialport::Parity::from(Parity::Even),
            serialport::Parity::Even
        );
        assert_matches!(
            serialport::StopBits::try_from(StopBits::Two),
            Ok(serialport::StopBits::Two)
        );
        assert_matches!(
            serialport::StopBits::try_from(StopBits::OnePointFive),
            Err(err) if err.kind() == io::ErrorKind::Unsupported
        );
    }

    #[test]
    fn unsupported_stop_bits_fail_the_builder() {
        let params = CommunicationParameters::builder("/dev/ttyUSB0")
            .stop_bits(StopBits::OnePointFive)
            .build()
            .unwrap();
        assert!(port_builder(&params).is_err());
    }

    #[test]
    fn opening_a_missing_device_fails() {
        let params = CommunicationParameters::builder("/dev/does-not-exist-rtu-link")
            .build()
            .unwrap();
        let timing = TimingProfile::from(&params);
        assert!(SerialPortOpener.open(&params, &timing).is_err());
    }
}
