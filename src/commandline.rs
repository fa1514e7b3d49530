use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use rtu_link_lib::protocol as proto;
use std::path::PathBuf;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_unit(s: &str) -> Result<u8, String> {
    clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid unit address format: {e}"))
}

fn parse_data_bits(s: &str) -> Result<proto::DataBits, String> {
    let bits = s
        .parse::<u8>()
        .map_err(|e| format!("Invalid byte size format: {e}"))?;
    proto::DataBits::try_from(bits).map_err(|e| e.to_string())
}

fn parse_parity(s: &str) -> Result<proto::Parity, String> {
    s.parse::<proto::Parity>().map_err(|e| e.to_string())
}

fn parse_stop_bits(s: &str) -> Result<proto::StopBits, String> {
    s.parse::<proto::StopBits>().map_err(|e| e.to_string())
}

/// Raw frame bytes given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexFrame(pub Vec<u8>);

/// Parses a frame given as hex digits, e.g. "01 03 00 00 00 01 84 0A".
fn parse_frame(s: &str) -> Result<HexFrame, String> {
    let digits: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(&digits);
    if !digits.is_ascii() {
        return Err(format!("Expected hex digits only, got '{s}'"));
    }
    if digits.is_empty()|| digits.len() % 2 != 0 {
        return Err(format!("Expected an even number of hex digits, got '{s}'"));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| format!("Invalid hex byte '{}': {e}", &digits[i..i + 2]))
        })
        .collect::<Result<Vec<u8>, String>>()
        .map(HexFrame)
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Print the RTU timing derived from the serial settings.
    Timing,

    /// Send one raw request frame and print the reply.
    /// The frame is sent as given, including its CRC.
    /// Example: rtulink send --unit 1 "01 03 00 00 00 01 84 0A"
    #[clap(verbatim_doc_comment)]
    Send {
        /// Unit address of the device (0 is broadcast).
        /// Can be specified in decimal or hexadecimal (e.g., "0x11").
        #[arg(short, long, default_value_t = 1, value_parser = parse_unit, verbatim_doc_comment)]
        unit: u8,

        /// Request frame in hex, whitespace between bytes is ignored.
        #[arg(value_parser = parse_frame)]
        request: HexFrame,

        /// Read exactly this many reply bytes instead of detecting the frame end.
        #[arg(long)]
        response_len: Option<usize>,
    },
}

const fn about_text() -> &'static str {
    "Modbus RTU serial link tool - send raw frames and inspect line timing."
}

#[derive(Parser, Debug)]
#[command(name="rtulink", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// YAML configuration file. When given, the serial and retry options
    /// below are taken from the file instead.
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub config: Option<PathBuf>,

    /// Serial port device name.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    #[arg(global = true, short, long, default_value_t = default_device_name(), verbatim_doc_comment)]
    pub device: String,

    /// Baud rate for serial communication.
    #[arg(global = true, short, long, default_value_t = proto::CommunicationParameters::DEFAULT_BAUD_RATE)]
    pub baud_rate: u32,

    /// Data bits per character (7 or 8).
    #[arg(global = true, long, default_value_t = proto::DataBits::default(), value_parser = parse_data_bits)]
    pub bytesize: proto::DataBits,

    /// Parity: N, E or O.
    #[arg(global = true, long, default_value_t = proto::Parity::default(), value_parser = parse_parity)]
    pub parity: proto::Parity,

    /// Stop bits: 1, 1.5 or 2.
    #[arg(global = true, long, default_value_t = proto::StopBits::default(), value_parser = parse_stop_bits)]
    pub stopbits: proto::StopBits,

    /// The adapter echoes every sent byte back (RS485 without echo suppression).
    #[arg(global = true, long)]
    pub local_echo: bool,

    /// Time to wait for a reply before giving up on an attempt.
    /// Examples: "1s", "500ms".
    #[arg(global = true, short, long, default_value = "3s", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// Maximum number of attempts per request.
    #[arg(global = true, short, long, default_value_t = proto::RetryPolicy::DEFAULT_RETRIES)]
    pub retries: u32,

    /// Retry when the device does not answer.
    #[arg(global = true, long)]
    pub retry_on_empty: bool,

    /// Treat unit 0 as broadcast and do not wait for a reply.
    #[arg(global = true, long)]
    pub broadcast: bool,

    /// On retry only wait for a reply again, without re-sending the request.
    #[arg(global = true, long)]
    pub no_resend_on_retry: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_parsing() {
        assert_eq!(
            parse_frame("01 03 00 00 00 01 84 0A"),
            Ok(HexFrame(vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]))
        );
        assert_eq!(parse_frame("0x0103"), Ok(HexFrame(vec![0x01, 0x03])));
        assert_eq!(parse_frame("ff:fe"), Ok(HexFrame(vec![0xFF, 0xFE])));
        assert!(parse_frame("").is_err());
        assert!(parse_frame("123").is_err());
        assert!(parse_frame("zz").is_err());
    }

    #[test]
    fn frame_rejects_non_ascii() {
        assert!(parse_frame("aé1").is_err());
        assert!(parse_frame("0é").is_err());
        assert!(parse_frame("01 ü2").is_err());
    }

    #[test]
    fn unit_accepts_hex() {
        assert_eq!(parse_unit("17"), Ok(17));
        assert_eq!(parse_unit("0x11"), Ok(17));
        assert!(parse_unit("256").is_err());
    }

    #[test]
    fn serial_settings() {
        let args = CliArgs::try_parse_from([
            "rtulink",
            "--bytesize",
            "7",
            "--parity",
            "E",
            "--stopbits",
            "2",
            "timing",
        ])
        .unwrap();
        assert_eq!(args.bytesize, proto::DataBits::Seven);
        assert_eq!(args.parity, proto::Parity::Even);
        assert_eq!(args.stopbits, proto::StopBits::Two);
        assert_eq!(args.command, CliCommands::Timing);
    }
}
