//! Serial endpoints and the blocking line reader.

use std::{
    fmt,
    io::{self, BufRead, BufReader, Read},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Span};

use super::{error::SessionError, protocol::LineProtocol};

/// How long a read may block before the reader checks for cancellation.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Longest accepted line, terminator included.
pub const MAX_LINE_LEN: usize = 1024;

/// `serial:<device>:<baud>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialEndpoint {
    pub device: String,
    pub baud_rate: u32,
}

impl FromStr for SerialEndpoint {
    type Err = SessionError;

    fn from_str(endpoint: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| SessionError::Endpoint {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        };

        let (kind, rest) = endpoint
            .split_once(':')
            .ok_or_else(|| invalid("expected serial:<device>:<baud>"))?;
        if kind != "serial" {
            return Err(invalid(&format!("unsupported endpoint type '{kind}'")));
        }
        let (device, baud) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing baud rate"))?;
        if device.is_empty() {
            return Err(invalid("missing device path"));
        }
        let baud_rate = baud
            .parse::<u32>()
            .ok()
            .filter(|b| *b > 0)
            .ok_or_else(|| invalid(&format!("invalid baud rate '{baud}'")))?;

        Ok(SerialEndpoint {
            device: device.to_string(),
            baud_rate,
        })
    }
}

impl fmt::Display for SerialEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "serial:{}:{}", self.device, self.baud_rate)
    }
}

impl SerialEndpoint {
    /// Opens the device as 8N1 without flow control.
    pub fn open(&self) -> Result<Box<dyn SerialPort>, SessionError> {
        let port = serialport::new(&self.device, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        Ok(port)
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Feeds complete lines from `source` to `protocol` until EOF or cancellation.
///
/// Read timeouts are not errors; a partial line is kept until its terminator
/// arrives. Lines longer than [`MAX_LINE_LEN`] are discarded up to the next
/// terminator.
pub fn read_lines<R: Read>(
    source: R,
    protocol: &LineProtocol,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let mut reader = BufReader::new(source);
    let mut line = Vec::with_capacity(128);
    let mut overflowed = false;

    while !cancel.is_cancelled() {
        let available = match reader.fill_buf() {
            Ok([]) => {
                if !overflowed {
                    deliver(protocol, &line);
                }
                debug!("Serial source reached end of file");
                return Ok(());
            }
            Ok(available) => available,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => return Err(e),
        };

        let (chunk, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(end) => (&available[..=end], true),
            None => (available, false),
        };
        let consumed = chunk.len();
        if !overflowed {
            line.extend_from_slice(chunk);
            if line.len() > MAX_LINE_LEN {
                debug!("Discarding line longer than {} bytes", MAX_LINE_LEN);
                line.clear();
                overflowed = true;
            }
        }
        reader.consume(consumed);

        if complete {
            if !overflowed {
                deliver(protocol, &line);
            }
            line.clear();
            overflowed = false;
        }
    }
    Ok(())
}

fn deliver(protocol: &LineProtocol, line: &[u8]) {
    let content = trim_line_ending(line);
    if !content.is_empty() {
        protocol.line_received(content);
    }
}

/// Opens `endpoint` and runs [`read_lines`] on a blocking thread.
///
/// An open failure is logged and the task ends. The session stays alive and
/// simply never produces readings.
pub fn spawn_reader(
    endpoint: SerialEndpoint,
    protocol: Arc<LineProtocol>,
    cancel: CancellationToken,
    span: Span,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let _enter = span.enter();
        let port = match endpoint.open() {
            Ok(port) => port,
            Err(e) => {
                error!("Could not open {}: {}", endpoint, e);
                return;
            }
        };
        info!(
            "Using serial port {} @ {} bps",
            endpoint.device, endpoint.baud_rate
        );

        match read_lines(port, &protocol, &cancel) {
            Ok(()) => debug!("Serial reader on {} finished", endpoint.device),
            Err(e) => error!("Serial reader on {} failed: {}", endpoint.device, e),
        }
    })
}
