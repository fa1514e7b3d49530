//! Modbus RTU serial link CLI
//!
//! A small command-line tool around the `rtu_link_lib` transport:
//! - Print the character time, poll interval and silent interval derived from
//!   the serial settings.
//! - Send one raw request frame (CRC included) to a unit and print the reply,
//!   with the same retry handling the library offers.
//!
//! Serial and retry settings come from command-line options or a YAML file.

use anyhow::{Context, Result, bail};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use rtu_link_lib::{
    config::ClientConfig,
    protocol::{self as proto, CommunicationParameters, RetryPolicy},
    sync_client::SerialClient,
    timing::TimingProfile,
};
use std::{fs::File, panic};
use tokio_modbus::Slave;

mod commandline;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .start()
        .with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    Ok(log_handle)
}

fn load_settings(args: &commandline::CliArgs) -> Result<(CommunicationParameters, RetryPolicy)> {
    if let Some(path) = &args.config {
        debug!("Loading config file from {path:?}");
        let file = File::open(path).with_context(|| format!("Cannot open config file {path:?}"))?;
        let config = ClientConfig::from_reader(file)
            .with_context(|| format!("Cannot parse config file {path:?}"))?;
        return <(CommunicationParameters, RetryPolicy)>::try_from(&config)
            .with_context(|| format!("Invalid settings in config file {path:?}"));
    }

    let params = CommunicationParameters::builder(args.device.as_str())
        .baud_rate(args.baud_rate)
        .data_bits(args.bytesize)
        .parity(args.parity)
        .stop_bits(args.stopbits)
        .handle_local_echo(args.local_echo)
        .timeout(args.timeout)
        .build()
        .with_context(|| "Invalid serial settings")?;
    let policy = RetryPolicy::new(args.retries)
        .retry_on_empty(args.retry_on_empty)
        .broadcast_enable(args.broadcast)
        .no_resend_on_retry(args.no_resend_on_retry);
    Ok((params, policy))
}

fn print_timing(params: &CommunicationParameters) {
    let timing = TimingProfile::from(params);
    println!("Serial settings: {params}");
    println!("Character time:      {:.6} s", timing.t0());
    println!("Receive poll:        {:.6} s", timing.recv_poll_interval());
    println!("Inter byte timeout:  {:.6} s", timing.inter_byte_timeout());
    println!("Silent interval:     {:.6} s", timing.silent_interval());
}

fn send_frame(
    params: CommunicationParameters,
    policy: RetryPolicy,
    unit: u8,
    request: &[u8],
    response_len: Option<usize>,
) -> Result<()> {
    let port = params.port().to_string();
    let mut client = SerialClient::new(params, policy);
    if !client.connect() {
        bail!("Cannot open serial port {port}");
    }

    let reply = client
        .execute(Slave(unit), request, response_len)
        .with_context(|| format!("No valid reply from unit {unit}"))?;
    if reply.is_empty() {
        println!("Broadcast sent, no reply expected");
    } else {
        let hex: Vec<String> = reply.iter().map(|b| format!("{b:02X}")).collect();
        println!("Reply ({} bytes): {}", reply.len(), hex.join(" "));
    }
    client.close();
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();
    let _log_handle = logging_init(args.verbose.log_level_filter())?;
    let (params, policy) = load_settings(&args)?;
    trace!("Using {params} with {policy:?}");

    match &args.command {
        commandline::CliCommands::Timing => print_timing(&params),
        commandline::CliCommands::Send {
            unit,
            request,
            response_len,
        } => {
            if params.stop_bits() == proto::StopBits::OnePointFive {
                warn!("1.5 stop bits are not supported by the serial back-end");
            }
            send_frame(params, policy, *unit, &request.0, *response_len)?;
        }
    }
    Ok(())
}
