//! STOMP frames and their wire codec.
//!
//! A frame is a command line, `key:value` header lines, a blank line, then
//! the body terminated by a NUL byte:
//!
//! ```text
//! SEND
//! destination:/queue/a
//! content-length:5
//!
//! hello^@
//! ```
//!
//! When `content-length` is present the body is read by length (and may
//! contain NUL bytes); otherwise it runs up to the first NUL.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::utils::error::FrameError;

pub const CONTENT_LENGTH: &str = "content-length";

/// Largest frame the decoder buffers before giving up on the peer.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => {
                return Err(FrameError::UnknownCommand {
                    command: other.to_string(),
                });
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order. Lookups return the first occurrence.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, key: &'static str) -> Result<&str, FrameError> {
        self.get(key)
            .ok_or(FrameError::MissingHeader { header: key })
    }

    /// ERROR frame carrying `message` as its `message` header.
    pub fn error(message: impl Into<String>) -> Self {
        Frame::new(Command::Error).header("message", message)
    }
}

#[derive(Debug, Clone)]
pub struct StompCodec {
    max_frame_len: usize,
}

impl StompCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        // heart-beats and the newline trailing the previous NUL
        let eols = src
            .iter()
            .take_while(|b| matches!(**b, b'\n' | b'\r'))
            .count();
        src.advance(eols);
        if src.is_empty() {
            return Ok(None);
        }

        let Some(head_len) = find_head_end(src) else {
            return self.incomplete(src);
        };
        let (command, headers) = parse_head(&src[..head_len])?;

        let content_length = match headers.iter().find(|(k, _)| k == CONTENT_LENGTH) {
            Some((_, v)) => Some(v.trim().parse::<usize>().map_err(|_| {
                FrameError::Malformed {
                    reason: format!("bad content-length {v:?}"),
                }
            })?),
            None => None,
        };

        // bytes between a length-delimited body and its NUL are dropped
        let (body_end, nul_at) = match content_length {
            Some(len) => {
                let end = match head_len.checked_add(len) {
                    Some(end) if end <= self.max_frame_len => end,
                    _ => {
                        return Err(FrameError::Malformed {
                            reason: format!(
                                "content-length {len} exceeds the {} byte frame limit",
                                self.max_frame_len
                            ),
                        });
                    }
                };
                match src.get(end..).and_then(|rest| rest.iter().position(|b| *b == 0)) {
                    Some(gap) => (end, end + gap),
                    None => return self.incomplete(src),
                }
            }
            None => match src[head_len..].iter().position(|b| *b == 0) {
                Some(nul) => (head_len + nul, head_len + nul),
                None => return self.incomplete(src),
            },
        };

        let mut frame_bytes = src.split_to(nul_at + 1);
        frame_bytes.advance(head_len);
        frame_bytes.truncate(body_end - head_len);

        Ok(Some(Frame {
            command,
            headers,
            body: frame_bytes.freeze(),
        }))
    }
}

impl StompCodec {
    fn incomplete(&self, src: &BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() > self.max_frame_len {
            return Err(FrameError::Malformed {
                reason: format!("frame exceeds {} bytes", self.max_frame_len),
            });
        }
        Ok(None)
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.reserve(frame.body.len() + 64);
        dst.put_slice(frame.command.as_str().as_bytes());
        dst.put_u8(b'\n');

        for (key, value) in &frame.headers {
            if key == CONTENT_LENGTH {
                continue;
            }
            if key.is_empty() || key.contains([':', '\n']) || value.contains('\n') {
                return Err(FrameError::Malformed {
                    reason: format!("unencodable header {key:?}"),
                });
            }
            dst.put_slice(key.as_bytes());
            dst.put_u8(b':');
            dst.put_slice(value.as_bytes());
            dst.put_u8(b'\n');
        }
        if !frame.body.is_empty() {
            dst.put_slice(format!("{CONTENT_LENGTH}:{}\n", frame.body.len()).as_bytes());
        }

        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Length of the command and header block including the blank line.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while let Some(nl) = buf[pos..].iter().position(|b| *b == b'\n') {
        let line = &buf[pos..pos + nl];
        pos += nl + 1;
        if line.is_empty() || line == b"\r" {
            return Some(pos);
        }
    }
    None
}

fn parse_head(head: &[u8]) -> Result<(Command, Vec<(String, String)>), FrameError> {
    let text = std::str::from_utf8(head).map_err(|_| FrameError::Malformed {
        reason: "frame head is not utf-8".to_string(),
    })?;
    let mut lines = text.lines().map(|l| l.trim_end_matches('\r'));

    let command = lines.next().unwrap_or_default().trim().parse::<Command>()?;

    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (key, value) = line.split_once(':').ok_or_else(|| FrameError::Malformed {
            reason: format!("header line without ':' {line:?}"),
        })?;
        headers.push((key.trim().to_string(), value.trim().to_string()));
    }
    Ok((command, headers))
}
