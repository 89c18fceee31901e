//! Envelope definitions and newline framing
//!
//! Messages are serialized as JSON objects with a `type` discriminator:
//!
//! ```text
//! {"type":"chat","id":"<sender>-<ms>-<n>","message":"hi","from":"...","name":"...","timestamp":1700000000000}
//! {"type":"note_update","id":"...","note":"...","timestamp":1700000000000}
//! {"type":"lan_hello","id":"<peer id>","name":"..."}
//! {"type":"lan_announce","id":"<peer id>","name":"...","port":47800,"timestamp":...}
//! ```
//!
//! On stream transports every envelope is one UTF-8 line ended by `\n`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted line, excluding the delimiter
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

// ─────────────────────────────────────────────────────────────────
// Envelope Types
// ─────────────────────────────────────────────────────────────────

/// One application or handshake message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Chat line
    Chat(ChatMessage),

    /// Full replacement of the shared note
    NoteUpdate(NoteUpdate),

    /// Direct-link handshake
    Hello(Hello),

    /// Local-network handshake
    LanHello(Hello),

    /// Local-network discovery datagram
    LanAnnounce(Announce),
}

/// Chat line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub message: String,

    /// Sender id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Sender display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, deserialize_with = "lenient_millis")]
    pub timestamp: i64,
}

/// Shared note snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub note: String,

    /// Last-writer-wins stamp in milliseconds
    #[serde(deserialize_with = "lenient_millis")]
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// Handshake binding a connection to a peer identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Peer identity (not a message id)
    pub id: String,
    pub name: String,
}

/// Discovery announce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub id: String,
    pub name: String,
    /// TCP data port the sender accepts on
    pub port: u16,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub timestamp: i64,
}

/// Millisecond stamps from peers that encode them as floating point
fn lenient_millis<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let number = serde_json::Number::deserialize(deserializer)?;
    number
        .as_i64()
        .or_else(|| number.as_f64().map(|ms| ms as i64))
        .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {}", number)))
}

/// Which handshake type a stream transport speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloKind {
    /// `{"type":"lan_hello"}`
    Lan,
    /// `{"type":"hello"}`
    Direct,
}

impl HelloKind {
    /// Build the handshake envelope for this kind
    pub fn envelope(self, id: &str, name: &str) -> Envelope {
        let hello = Hello {
            id: id.to_string(),
            name: name.to_string(),
        };
        match self {
            HelloKind::Lan => Envelope::LanHello(hello),
            HelloKind::Direct => Envelope::Hello(hello),
        }
    }

    /// Extract the hello of this kind; the other kind is not a handshake here
    pub fn matches(self, envelope: &Envelope) -> Option<&Hello> {
        match (self, envelope) {
            (HelloKind::Lan, Envelope::LanHello(h)) => Some(h),
            (HelloKind::Direct, Envelope::Hello(h)) => Some(h),
            _ => None,
        }
    }
}

impl Envelope {
    /// Parse one line or payload
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text.trim())
    }

    /// Serialize to a single JSON line without the delimiter
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Wire name of the type
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Chat(_) => "chat",
            Envelope::NoteUpdate(_) => "note_update",
            Envelope::Hello(_) => "hello",
            Envelope::LanHello(_) => "lan_hello",
            Envelope::LanAnnounce(_) => "lan_announce",
        }
    }

    /// Message id used for deduplication.
    ///
    /// Handshake and announce ids are identities, so they never dedup.
    pub fn dedup_key(&self) -> Option<&str> {
        match self {
            Envelope::Chat(m) => m.id.as_deref(),
            Envelope::NoteUpdate(n) => n.id.as_deref(),
            Envelope::Hello(_) | Envelope::LanHello(_) | Envelope::LanAnnounce(_) => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Line Framing
// ─────────────────────────────────────────────────────────────────

/// Read the next complete line.
///
/// Returns `Ok(None)` at end of stream; a trailing fragment without a
/// delimiter is dropped. Invalid UTF-8 is replaced rather than rejected so
/// the line can still be shown as opaque chat.
pub async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = MAX_LINE_BYTES as u64 + 1;
    let n = reader.take(limit).read_until(b'\n', buf).await?;

    if n == 0 {
        return Ok(None);
    }

    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_LINE_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("line exceeds {} bytes", MAX_LINE_BYTES),
            ));
        }
        return Ok(None);
    }

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }

    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Write one line followed by the delimiter
pub async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_parse_chat_wire_shape() {
        let line = r#"{"type":"chat","id":"A-1000-0","message":"hi","from":"A","name":"Ann","timestamp":1000}"#;
        match Envelope::parse(line).unwrap() {
            Envelope::Chat(m) => {
                assert_eq!(m.id.as_deref(), Some("A-1000-0"));
                assert_eq!(m.message, "hi");
                assert_eq!(m.name.as_deref(), Some("Ann"));
            }
            other => panic!("Expected chat, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_note_update_encodes_snake_case() {
        let env = Envelope::NoteUpdate(NoteUpdate {
            id: Some("A-1-1".into()),
            note: "groceries".into(),
            timestamp: 42,
            from: None,
        });
        let json = env.encode().unwrap();
        assert!(json.contains(r#""type":"note_update""#));
        assert!(!json.contains("from"));
        assert!(!json.contains('\n'));
    }

    #[test]
    fn test_hello_kinds_are_distinct() {
        let lan = HelloKind::Lan.envelope("p1", "Pat");
        let direct = HelloKind::Direct.envelope("p1", "Pat");
        assert_eq!(lan.type_name(), "lan_hello");
        assert_eq!(direct.type_name(), "hello");
        assert!(HelloKind::Lan.matches(&lan).is_some());
        assert!(HelloKind::Lan.matches(&direct).is_none());
        assert!(HelloKind::Direct.matches(&direct).is_some());
    }

    #[test]
    fn test_control_envelopes_skip_dedup() {
        let hello = HelloKind::Lan.envelope("p1", "Pat");
        assert!(hello.dedup_key().is_none());

        let chat = Envelope::parse(r#"{"type":"chat","message":"no id"}"#).unwrap();
        assert!(chat.dedup_key().is_none());
    }

    #[test]
    fn test_optional_fields_and_float_stamps() {
        let chat = Envelope::parse(r#"{"type":"chat","id":"A-1000-7","from":"A","timestamp":1000}"#)
            .unwrap();
        assert_eq!(chat.dedup_key(), Some("A-1000-7"));
        match chat {
            Envelope::Chat(m) => {
                assert_eq!(m.message, "");
                assert_eq!(m.timestamp, 1000);
            }
            other => panic!("Expected chat, got {}", other.type_name()),
        }

        let note = Envelope::parse(r#"{"type":"note_update","id":"B-1-0","note":"x","timestamp":1700000000123.0}"#)
            .unwrap();
        match note {
            Envelope::NoteUpdate(n) => assert_eq!(n.timestamp, 1_700_000_000_123),
            other => panic!("Expected note update, got {}", other.type_name()),
        }

        assert!(Envelope::parse(r#"{"type":"note_update","note":"x","timestamp":"soon"}"#).is_err());
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        assert!(Envelope::parse(r#"{"type":"ping"}"#).is_err());
        assert!(Envelope::parse("plain text").is_err());
    }

    #[tokio::test]
    async fn test_read_line_buffers_partial_input() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = BufReader::new(server);
        let mut buf = Vec::new();

        let writer = tokio::spawn(async move {
            let mut client = client;
            client.write_all(br#"{"type":"chat","#).await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(b"\"message\":\"x\"}\r\nsecond\n").await.unwrap();
        });

        let first = read_line(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(first, r#"{"type":"chat","message":"x"}"#);
        let second = read_line(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(second, "second");

        writer.await.unwrap();
        assert!(read_line(&mut reader, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_line_rejects_oversized() {
        let data = vec![b'x'; MAX_LINE_BYTES + 10];
        let mut reader = BufReader::new(&data[..]);
        let mut buf = Vec::new();
        let err = read_line(&mut reader, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
