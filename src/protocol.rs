//! Component J — device transport and line framing.
//!
//! Grounded directly on `src/adapters/serial_adapter.rs` (line-terminator
//! write, delimiter-scanning read loop) and `src/adapters/mock.rs`'s
//! `Adapter` trait shape, which becomes `MockTransport` here — the harness
//! the seed tests (spec.md §8) script canned replies through.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::device::DeviceError;

/// Address disambiguation (spec.md §4.J): IPv4 dotted quad → TCP (optional
/// `:port`), `COM<digits>` → serial, otherwise a fatal setup error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionKind {
    Tcp { host: String, port: u16 },
    Serial { port: String },
}

pub fn parse_address(address: &str, default_port: u16) -> Result<ConnectionKind, DeviceError> {
    if let Some((host, port)) = address.split_once(':') {
        if is_ipv4(host) {
            let port: u16 = port
                .parse()
                .map_err(|_| DeviceError::UnknownConnectionType(address.to_string()))?;
            return Ok(ConnectionKind::Tcp {
                host: host.to_string(),
                port,
            });
        }
    }
    if is_ipv4(address) {
        return Ok(ConnectionKind::Tcp {
            host: address.to_string(),
            port: default_port,
        });
    }
    if is_com_port(address) {
        return Ok(ConnectionKind::Serial {
            port: address.to_string(),
        });
    }
    Err(DeviceError::UnknownConnectionType(address.to_string()))
}

fn is_ipv4(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| p.parse::<u8>().is_ok())
}

fn is_com_port(s: &str) -> bool {
    s.len() > 3
        && s[..3].eq_ignore_ascii_case("com")
        && s[3..].chars().all(|c| c.is_ascii_digit())
        && !s[3..].is_empty()
}

/// The minimal byte-stream operations every backing transport supports.
/// Boxed as a trait object so `Transport` stays a single concrete type
/// regardless of which backend is in play.
#[async_trait]
trait RawIo: Send {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;
    /// Reads at least one more byte into `buf`, appended. Returns the
    /// number of bytes read; `Ok(0)` signals EOF.
    async fn read_more(&mut self, buf: &mut Vec<u8>) -> std::io::Result<usize>;
}

#[async_trait]
impl RawIo for TcpStream {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        AsyncWriteExt::write_all(self, buf).await
    }

    async fn read_more(&mut self, buf: &mut Vec<u8>) -> std::io::Result<usize> {
        let mut chunk = [0u8; 512];
        let n = self.read(&mut chunk).await?;
        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl RawIo for tokio_serial::SerialStream {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        AsyncWriteExt::write_all(self, buf).await
    }

    async fn read_more(&mut self, buf: &mut Vec<u8>) -> std::io::Result<usize> {
        let mut chunk = [0u8; 512];
        let n = self.read(&mut chunk).await?;
        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

/// Scripted reply used by tests and by any harness standing in for real
/// hardware, mirroring the teacher's `MockAdapter`.
#[derive(Debug, Clone)]
pub enum MockReply {
    Line(String),
    /// The device never replies; the actor's timeout fires instead.
    Never,
}

#[derive(Default)]
pub struct MockTransport {
    pub sent: Vec<Vec<u8>>,
    pub scripted: VecDeque<MockReply>,
}

#[async_trait]
impl RawIo for MockTransport {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.sent.push(buf.to_vec());
        Ok(())
    }

    async fn read_more(&mut self, buf: &mut Vec<u8>) -> std::io::Result<usize> {
        match self.scripted.pop_front() {
            Some(MockReply::Line(line)) => {
                buf.extend_from_slice(line.as_bytes());
                buf.push(b'\n');
                Ok(line.len() + 1)
            }
            Some(MockReply::Never) | None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Named-group event/error pattern, scanned before parser dispatch
/// (spec.md §4.J).
pub struct NamedPattern {
    pub name: String,
    pub regex: Regex,
}

/// Owns the connection and the framing state (buffered bytes, delimiter,
/// event/error pattern lists) for one device (spec.md §3/§4.J).
pub struct Transport {
    raw: Box<dyn RawIo>,
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
    /// Reply texts from the device's reply-to-state map; any of these
    /// appearing in the buffer is also treated as a framed reply even
    /// without a trailing delimiter (spec.md §4.J).
    reply_to_state_keys: Vec<String>,
    pub event_patterns: Vec<NamedPattern>,
    pub error_patterns: Vec<Regex>,
}

impl Transport {
    #[must_use]
    pub fn new(raw: Box<dyn RawIo>, delimiter: impl Into<Vec<u8>>) -> Self {
        Self {
            raw,
            delimiter: delimiter.into(),
            buffer: Vec::new(),
            reply_to_state_keys: Vec::new(),
            event_patterns: Vec::new(),
            error_patterns: Vec::new(),
        }
    }

    pub async fn connect_tcp(host: &str, port: u16, delimiter: impl Into<Vec<u8>>) -> std::io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self::new(Box::new(stream), delimiter))
    }

    #[cfg(feature = "instrument_serial")]
    pub fn connect_serial(
        port: &str,
        baud: u32,
        delimiter: impl Into<Vec<u8>>,
    ) -> Result<Self, DeviceError> {
        let builder = tokio_serial::new(port, baud);
        let stream = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        Ok(Self::new(Box::new(stream), delimiter))
    }

    #[must_use]
    pub fn test_stub() -> Self {
        Self::new(Box::new(MockTransport::default()), b"\n".to_vec())
    }

    #[must_use]
    pub fn mock(scripted: Vec<MockReply>) -> Self {
        let mock = MockTransport {
            sent: Vec::new(),
            scripted: scripted.into(),
        };
        Self::new(Box::new(mock), b"\n".to_vec())
    }

    pub fn with_reply_to_state_keys(mut self, keys: Vec<String>) -> Self {
        self.reply_to_state_keys = keys;
        self
    }

    /// Writes the command's bytestring followed by the delimiter
    /// (spec.md §4.J).
    pub async fn write_line(&mut self, bytestring: &[u8]) -> std::io::Result<()> {
        let mut out = bytestring.to_vec();
        out.extend_from_slice(&self.delimiter);
        self.raw.write_all(&out).await
    }

    /// Reads one framed reply: either delimiter-terminated, or matching a
    /// known reply-to-state key as a bare substring (spec.md §4.J).
    pub async fn read_line(&mut self) -> std::io::Result<String> {
        loop {
            if let Some(frame) = self.try_extract_frame() {
                return Ok(frame);
            }
            let n = self.raw.read_more(&mut self.buffer).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ));
            }
        }
    }

    fn try_extract_frame(&mut self) -> Option<String> {
        if !self.delimiter.is_empty() {
            if let Some(pos) = find_subslice(&self.buffer, &self.delimiter) {
                let frame = self.buffer[..pos].to_vec();
                self.buffer.drain(..pos + self.delimiter.len());
                return Some(String::from_utf8_lossy(&frame).to_string());
            }
        }
        let text = String::from_utf8_lossy(&self.buffer).to_string();
        for key in &self.reply_to_state_keys {
            if let Some(idx) = text.find(key.as_str()) {
                let end = idx + key.len();
                let consumed = end;
                self.buffer.drain(..consumed);
                return Some(key.clone());
            }
        }
        None
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Scans `event_patterns`, firing `(name, captured groups)` for each match
/// (spec.md §4.J step 1).
#[must_use]
pub fn scan_events(
    line: &str,
    patterns: &[NamedPattern],
) -> Vec<(String, std::collections::HashMap<String, String>)> {
    let mut events = Vec::new();
    for pattern in patterns {
        if let Some(captures) = pattern.regex.captures(line) {
            let mut groups = std::collections::HashMap::new();
            for name in pattern.regex.capture_names().flatten() {
                if let Some(m) = captures.name(name) {
                    groups.insert(name.to_string(), m.as_str().to_string());
                }
            }
            events.push((pattern.name.clone(), groups));
        }
    }
    events
}

/// Scans `error_patterns`; true on the first match (spec.md §4.J step 2).
#[must_use]
pub fn scan_errors(line: &str, patterns: &[Regex]) -> bool {
    patterns.iter().any(|p| p.is_match(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_without_port_uses_default() {
        let kind = parse_address("192.168.1.10", 502).unwrap();
        assert_eq!(
            kind,
            ConnectionKind::Tcp {
                host: "192.168.1.10".into(),
                port: 502
            }
        );
    }

    #[test]
    fn ipv4_with_port_overrides_default() {
        let kind = parse_address("192.168.1.10:9001", 502).unwrap();
        assert_eq!(
            kind,
            ConnectionKind::Tcp {
                host: "192.168.1.10".into(),
                port: 9001
            }
        );
    }

    #[test]
    fn com_port_is_serial() {
        let kind = parse_address("COM3", 0).unwrap();
        assert_eq!(
            kind,
            ConnectionKind::Serial {
                port: "COM3".into()
            }
        );
    }

    #[test]
    fn garbage_address_is_unknown() {
        assert!(parse_address("not-an-address", 0).is_err());
    }

    #[tokio::test]
    async fn mock_transport_round_trips_a_scripted_line() {
        let mut transport = Transport::mock(vec![MockReply::Line("OK".into())]);
        transport.write_line(b"PING").await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(1), transport.read_line())
            .await
            .expect("should not hang")
            .unwrap();
        assert_eq!(reply, "OK");
    }

    #[test]
    fn event_patterns_extract_named_groups() {
        let patterns = vec![NamedPattern {
            name: "temp_reached".into(),
            regex: Regex::new(r"TEMP_OK (?P<value>\d+)").unwrap(),
        }];
        let events = scan_events("TEMP_OK 42", &patterns);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "temp_reached");
        assert_eq!(events[0].1.get("value"), Some(&"42".to_string()));
    }

    #[test]
    fn error_patterns_detect_match() {
        let patterns = vec![Regex::new(r"^ERR").unwrap()];
        assert!(scan_errors("ERR 12", &patterns));
        assert!(!scan_errors("OK", &patterns));
    }
}
