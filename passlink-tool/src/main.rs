//! Operator CLI: one-shot adapter queries, a frame monitor, and offline
//! protocol debug aids.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use passlink::{Endpoint, Session};
use passlink_isotp::{Action, Behavior, Mode, Transceiver, TransceiverFd};
use passlink_kline::ProtocolMode;
use passlink_wire::ChannelProtocol;

#[derive(Parser)]
#[command(name = "passlink", about = "Talk to a passlink CAN/K-Line adapter.")]
struct Cli {
    /// Connection string: empty for the TCP default, `TCP:host[:port]`,
    /// `BLE:name-or-mac`, a bare address, or a BLE device name.
    #[arg(long, default_value = "")]
    device: String,

    /// Request timeout in milliseconds.
    #[arg(long, default_value = "1000")]
    timeout: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the adapter identity strings.
    Info,
    /// Round-trip a ping and report the latency.
    Ping {
        /// Optional hex payload to echo.
        #[arg(long, default_value = "")]
        payload: String,
    },
    /// Read the battery voltage.
    Voltage,
    /// Open a raw CAN channel and print received frames.
    Monitor(MonitorOpts),
    /// Open a raw CAN channel and transmit one frame.
    Send(SendOpts),
    /// Print the ISO-TP segmentation of a payload (offline).
    Segment(SegmentOpts),
    /// Merge a captured K-Line byte stream into a payload (offline).
    KlineDecode(KlineDecodeOpts),
}

#[derive(Args)]
struct MonitorOpts {
    #[arg(long, default_value = "500000")]
    bitrate: u32,
    /// Stop after this many frames (0 = run until interrupted).
    #[arg(long, default_value = "0")]
    count: u64,
}

#[derive(Args)]
struct SendOpts {
    #[arg(long, default_value = "500000")]
    bitrate: u32,
    /// CAN identifier, decimal or 0x-prefixed hex.
    #[arg(long, value_parser = parse_u32)]
    id: u32,
    /// Frame payload as hex.
    data: String,
}

#[derive(Args)]
struct SegmentOpts {
    /// Payload as hex.
    data: String,
    /// Segment for CAN FD instead of classic CAN.
    #[arg(long)]
    fd: bool,
    /// Maximum frame width (FD only, 0 = maximum).
    #[arg(long, default_value = "0")]
    width: usize,
}

#[derive(Args)]
struct KlineDecodeOpts {
    /// Raw capture as hex.
    data: String,
    /// Decode as ISO 9141-2 instead of KWP2000.
    #[arg(long)]
    iso9141: bool,
    /// Expected total payload length, when known.
    #[arg(long)]
    expected_len: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Info => {
            let session = open_session(&cli.device)?;
            let info = session.device_info(cli.timeout)?;
            println!("vendor:   {}", info.vendor);
            println!("model:    {}", info.model);
            println!("hardware: {}", info.hardware);
            println!("serial:   {}", info.serial);
            println!("firmware: {}", info.firmware);
        }
        Command::Ping { payload } => {
            let session = open_session(&cli.device)?;
            let payload = parse_hex(&payload)?;
            let started = std::time::Instant::now();
            let echo = session.ping(&payload, cli.timeout)?;
            if echo != payload {
                bail!("pong payload mismatch");
            }
            println!("pong in {:?}", started.elapsed());
        }
        Command::Voltage => {
            let session = open_session(&cli.device)?;
            let millivolts = session.read_voltage(cli.timeout)?;
            println!("{:.3} V", f64::from(millivolts) / 1000.0);
        }
        Command::Monitor(opts) => {
            let session = open_session(&cli.device)?;
            let handle =
                session.open_channel(ChannelProtocol::Raw, opts.bitrate, None, 0, 0, cli.timeout)?;
            info!("channel {handle} open at {} bps", opts.bitrate);
            let mut seen = 0u64;
            loop {
                for frame in session.receive_messages(200) {
                    println!(
                        "{:>10.6}  {}  [{}]  {}",
                        frame.timestamp_us as f64 / 1_000_000.0,
                        format_id(frame.id),
                        frame.data.len(),
                        hex_string(&frame.data),
                    );
                    seen += 1;
                    if opts.count > 0 && seen >= opts.count {
                        session.close_channel(handle, cli.timeout)?;
                        return Ok(());
                    }
                }
            }
        }
        Command::Send(opts) => {
            let session = open_session(&cli.device)?;
            let data = parse_hex(&opts.data)?;
            let handle =
                session.open_channel(ChannelProtocol::Raw, opts.bitrate, None, 0, 0, cli.timeout)?;
            let arbitration = passlink_wire::Arbitration {
                request: opts.id,
                ..Default::default()
            };
            session.set_arbitration(handle, &arbitration, cli.timeout)?;
            session.send_frame(handle, &data, cli.timeout)?;
            println!("sent {} to {}", hex_string(&data), format_id(opts.id));
            session.close_channel(handle, cli.timeout)?;
        }
        Command::Segment(opts) => {
            let payload = parse_hex(&opts.data)?;
            let action = if opts.fd {
                let mut transceiver =
                    TransceiverFd::new(Behavior::Strict, Mode::Standard, 0, 0, 0, opts.width);
                transceiver.write_pdu(&payload)
            } else {
                let mut transceiver = Transceiver::new(Behavior::Strict, Mode::Standard, 0, 0, 0);
                transceiver.write_pdu(&payload)
            };
            match action {
                Action::WriteFrames { frames, .. } => {
                    for frame in frames {
                        println!("{}", hex_string(&frame));
                    }
                    if payload.len() >= 8 && !opts.fd {
                        println!("(consecutive frames follow after flow control)");
                    }
                }
                Action::ProtocolViolation(reason) => bail!("cannot segment: {reason}"),
                other => bail!("unexpected transceiver action: {other:?}"),
            }
        }
        Command::KlineDecode(opts) => {
            let raw = parse_hex(&opts.data)?;
            let mode = if opts.iso9141 {
                ProtocolMode::Iso9141
            } else {
                ProtocolMode::Kwp
            };
            let payload =
                passlink_kline::decode_stream(&raw, mode, None, None, opts.expected_len);
            if payload.is_empty() {
                bail!("no valid payload in the capture");
            }
            println!("{}", hex_string(&payload));
        }
    }

    Ok(())
}

fn open_session(device: &str) -> Result<Session> {
    let endpoint = Endpoint::parse(device);
    let transport = endpoint
        .open()
        .with_context(|| format!("cannot open endpoint {endpoint:?}"))?;
    let session = Session::new(transport);
    session.connect().context("connect failed")?;
    Ok(session)
}

fn format_id(id: u32) -> String {
    if id > 0x7FF {
        format!("{id:08X}")
    } else {
        format!("{id:03X}")
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_u32(input: &str) -> Result<u32, String> {
    let trimmed = input.trim();
    let parsed = if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else {
        trimmed.parse::<u32>()
    };
    parsed.map_err(|err| err.to_string())
}

/// Parse hex bytes, accepting whitespace, comma, colon and dash separators
/// and optional `0x` prefixes.
fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for token in input.split(|c: char| c.is_whitespace() || c == ',' || c == ':' || c == '-') {
        let token = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        if token.is_empty() {
            continue;
        }
        if token.len() % 2 != 0 {
            bail!("hex token {token:?} has odd length");
        }
        for i in (0..token.len()).step_by(2) {
            let byte = u8::from_str_radix(&token[i..i + 2], 16)
                .with_context(|| format!("invalid hex token {token:?}"))?;
            bytes.push(byte);
        }
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parser_accepts_common_shapes() {
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
        assert_eq!(parse_hex("DEADBEEF").unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(parse_hex("de ad be ef").unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(parse_hex("0x02,0x01,0x0d").unwrap(), vec![0x02, 0x01, 0x0D]);
        assert_eq!(parse_hex("02-01-0D").unwrap(), vec![0x02, 0x01, 0x0D]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn id_formatting_widens_for_extended_identifiers() {
        assert_eq!(format_id(0x7E8), "7E8");
        assert_eq!(format_id(0x18DA_F110), "18DAF110");
    }

    #[test]
    fn u32_parser_handles_hex_and_decimal() {
        assert_eq!(parse_u32("0x7E0").unwrap(), 0x7E0);
        assert_eq!(parse_u32("2016").unwrap(), 2016);
        assert!(parse_u32("frob").is_err());
    }
}
