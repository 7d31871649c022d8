//! STOMP 1.2 frame model and the tokio codec that reads and writes it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame, header block included.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

pub const CONTENT_LENGTH: &str = "content-length";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("header line without ':' separator: '{0}'")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header '{0}'")]
    InvalidEscape(String),

    #[error("invalid content-length '{0}'")]
    InvalidContentLength(String),

    #[error("frame body is not terminated by NUL")]
    MissingTerminator,

    #[error("frame exceeds {MAX_FRAME_SIZE} bytes")]
    TooLarge,

    #[error("frame header block is not valid UTF-8")]
    NotUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let command = match raw {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        };
        Some(command)
    }

    /// CONNECT and CONNECTED frames carry their headers unescaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Frame {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Replaces the first header called `name`, or appends it.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    /// Repeated headers resolve to the first occurrence.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Default, Clone)]
pub struct StompCodec {
    /// Bytes of a partial frame already searched for the body terminator.
    scanned: usize,
}

impl StompCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unescape(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

fn put_header_text(dst: &mut BytesMut, raw: &str, escape: bool) {
    if !escape {
        dst.put_slice(raw.as_bytes());
        return;
    }
    for c in raw.chars() {
        match c {
            '\\' => dst.put_slice(b"\\\\"),
            '\n' => dst.put_slice(b"\\n"),
            '\r' => dst.put_slice(b"\\r"),
            ':' => dst.put_slice(b"\\c"),
            other => {
                let mut buf = [0u8; 4];
                dst.put_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        // heart-beats
        loop {
            match src.first() {
                Some(b'\n') => src.advance(1),
                Some(b'\r') if src.get(1) == Some(&b'\n') => src.advance(2),
                _ => break,
            }
            self.scanned = 0;
        }
        if src.is_empty() {
            return Ok(None);
        }

        let mut lines: Vec<(usize, usize)> = Vec::new();
        let mut pos = 0;
        let body_start = loop {
            let Some(offset) = src[pos..].iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_FRAME_SIZE {
                    return Err(FrameError::TooLarge);
                }
                return Ok(None);
            };
            let next = pos + offset + 1;
            let mut end = pos + offset;
            if end > pos && src[end - 1] == b'\r' {
                end -= 1;
            }
            if end == pos && !lines.is_empty() {
                break next;
            }
            lines.push((pos, end));
            pos = next;
        };

        let line = |(start, end): (usize, usize)| -> Result<&str, FrameError> {
            std::str::from_utf8(&src[start..end]).map_err(|_| FrameError::NotUtf8)
        };

        let raw_command = line(lines[0])?;
        let command = Command::parse(raw_command)
            .ok_or_else(|| FrameError::UnknownCommand(raw_command.to_string()))?;

        let mut headers = Vec::with_capacity(lines.len() - 1);
        for range in &lines[1..] {
            let raw = line(*range)?;
            let (name, value) = raw
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(raw.to_string()))?;
            if command.escapes_headers() {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(name, _)| name == CONTENT_LENGTH)
            .map(|(_, value)| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::InvalidContentLength(value.clone()))
            })
            .transpose()?;

        let body_end = match content_length {
            Some(length) => {
                let end = body_start + length;
                if end + 1 > MAX_FRAME_SIZE {
                    return Err(FrameError::TooLarge);
                }
                if src.len() < end + 1 {
                    src.reserve(end + 1 - src.len());
                    return Ok(None);
                }
                if src[end] != 0 {
                    return Err(FrameError::MissingTerminator);
                }
                end
            }
            None => {
                let from = body_start.max(self.scanned);
                match src[from..].iter().position(|b| *b == 0) {
                    Some(offset) => from + offset,
                    None => {
                        if src.len() > MAX_FRAME_SIZE {
                            return Err(FrameError::TooLarge);
                        }
                        self.scanned = src.len();
                        return Ok(None);
                    }
                }
            }
        };

        self.scanned = 0;
        let raw = src.split_to(body_end + 1).freeze();
        Ok(Some(Frame {
            command,
            headers,
            body: raw.slice(body_start..body_end),
        }))
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let escape = frame.command.escapes_headers();
        dst.reserve(frame.body.len() + 64);
        dst.put_slice(frame.command.as_str().as_bytes());
        dst.put_u8(b'\n');
        for (name, value) in &frame.headers {
            put_header_text(dst, name, escape);
            dst.put_u8(b':');
            put_header_text(dst, value, escape);
            dst.put_u8(b'\n');
        }
        // a NUL inside the body would end the frame early without an explicit length
        if frame.body.contains(&0) && frame.header(CONTENT_LENGTH).is_none() {
            dst.put_slice(format!("{CONTENT_LENGTH}:{}\n", frame.body.len()).as_bytes());
        }
        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}
