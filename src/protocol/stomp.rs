//! Minimal STOMP 1.2 frame codec
//!
//! Only the client side of the protocol is covered: the frames a client sends
//! and the frames a broker sends back. Frames are text; bodies are JSON.

use std::time::Duration;
use thiserror::Error;

/// A heart-beat is a bare end-of-line between frames
pub const HEARTBEAT: &str = "\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StompError {
    #[error("Unknown STOMP command: {0}")]
    UnknownCommand(String),
    #[error("Malformed STOMP header: {0}")]
    MalformedHeader(String),
    #[error("STOMP frame is missing its NUL terminator")]
    Unterminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Result<Self, StompError> {
        Ok(match s {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(StompError::UnknownCommand(other.to_string())),
        })
    }

    /// CONNECT and CONNECTED frames carry unescaped headers
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header; repeated headers keep the first occurrence
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, heartbeat: Duration) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", "1.2,1.1")
            .header("host", host)
            .header("heart-beat", format!("{},0", heartbeat.as_millis()))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode every frame in a transport message, skipping heart-beats
    pub fn decode_all(text: &str) -> Result<Vec<Frame>, StompError> {
        let mut frames = Vec::new();
        let mut rest = text;
        loop {
            let trimmed = rest.trim_start_matches(|c| c == '\r' || c == '\n');
            if trimmed.is_empty() {
                break;
            }
            let Some(end) = trimmed.find('\0') else {
                return Err(StompError::Unterminated);
            };
            let (raw, tail) = trimmed.split_at(end);
            frames.push(parse_frame(raw)?);
            rest = tail.strip_prefix('\0').unwrap_or_default();
        }
        Ok(frames)
    }
}

fn parse_frame(raw: &str) -> Result<Frame, StompError> {
    let (head, body) = split_head(raw);
    let mut lines = head.lines().map(|l| l.trim_end_matches('\r'));
    let command = Command::parse(lines.next().unwrap_or_default())?;
    let unescape = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(StompError::MalformedHeader(line.to_string()));
        };
        if unescape {
            headers.push((unescape_header(name), unescape_header(value)));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    Ok(Frame {
        command,
        headers,
        body: body.to_string(),
    })
}

fn split_head(raw: &str) -> (&str, &str) {
    let lf = raw.find("\n\n").map(|i| (i, 2));
    let crlf = raw.find("\n\r\n").map(|i| (i, 3));
    let split = match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    match split {
        Some((at, sep)) => {
            let (head, rest) = raw.split_at(at);
            (head, rest.get(sep..).unwrap_or_default())
        }
        None => (raw, ""),
    }
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
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
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_frame_encoding() {
        let frame = Frame::send("/app/traveling/chat", r#"{"a":1}"#);
        assert_eq!(
            frame.encode(),
            "SEND\ndestination:/app/traveling/chat\ncontent-type:application/json\n\n{\"a\":1}\0"
        );
    }

    #[test]
    fn test_connect_frame_is_not_escaped() {
        let encoded = Frame::connect("localhost:8080", Duration::from_secs(10)).encode();
        assert!(encoded.contains("host:localhost:8080\n"));
        assert!(encoded.contains("heart-beat:10000,0\n"));
    }

    #[test]
    fn test_decode_message_frame() {
        let raw = "MESSAGE\ndestination:/topic/reply\nsubscription:sub-0\nmessage-id:7\n\n{\"type\":\"response\"}\0";
        let frames = Frame::decode_all(raw).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, Command::Message);
        assert_eq!(frames[0].get("subscription"), Some("sub-0"));
        assert_eq!(frames[0].body, "{\"type\":\"response\"}");
    }

    #[test]
    fn test_header_escaping_survives_a_round_trip() {
        let frame = Frame::new(Command::Message)
            .header("note", "a:b\nc\\d")
            .with_body("x");
        let encoded = frame.encode();
        assert!(encoded.contains("note:a\\cb\\nc\\\\d\n"));
        assert_eq!(Frame::decode_all(&encoded).unwrap(), vec![frame]);
    }

    #[test]
    fn test_decode_skips_heartbeats_between_frames() {
        let raw = "\n\nCONNECTED\nversion:1.2\n\n\0\r\nRECEIPT\nreceipt-id:1\n\n\0\n";
        let frames = Frame::decode_all(raw).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].command, Command::Connected);
        assert_eq!(frames[0].get("version"), Some("1.2"));
        assert_eq!(frames[1].command, Command::Receipt);

        assert!(Frame::decode_all(HEARTBEAT).unwrap().is_empty());
    }

    #[test]
    fn test_crlf_frames() {
        let raw = "ERROR\r\nmessage:bad\r\n\r\ndetails\0";
        let frames = Frame::decode_all(raw).unwrap();
        assert_eq!(frames[0].command, Command::Error);
        assert_eq!(frames[0].get("message"), Some("bad"));
        assert_eq!(frames[0].body, "details");
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            Frame::decode_all("MESSAGE\n\nbody"),
            Err(StompError::Unterminated)
        );
        assert!(matches!(
            Frame::decode_all("BOGUS\n\n\0"),
            Err(StompError::UnknownCommand(_))
        ));
        assert!(matches!(
            Frame::decode_all("MESSAGE\nnocolon\n\n\0"),
            Err(StompError::MalformedHeader(_))
        ));
    }
}
