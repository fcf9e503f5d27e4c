//! Line-oriented singleton wire protocol.
//!
//! ```text
//! byte 0   encoding selector (1 = platform/UTF-8, 2 = UTF-16LE)
//! line     secret, decimal
//! line     "si.init" | "si.stop"
//! si.init: ["si.arg"] argument lines ["si.prop" key=value lines] "si.EOF"
//! reply    "si.ack" | "si.exit"
//! ```
//!
//! Lines end in `\n`; a trailing `\r` is dropped. Lines before any section
//! marker are arguments.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use solo_core::{ActivationRequest, Secret, WireEncoding};

use crate::error::{io_err, IpcError};

pub const MAGICWORD: &str = "si.init";
pub const STOP: &str = "si.stop";
pub const ARG_SECTION: &str = "si.arg";
pub const PROP_SECTION: &str = "si.prop";
pub const EOF: &str = "si.EOF";
pub const ACK: &str = "si.ack";
pub const EXIT: &str = "si.exit";

/// Longest accepted line, in encoded bytes.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Most lines accepted between `si.init` and `si.EOF`.
pub const MAX_BODY_LINES: usize = 4096;

const CONNECTION: &str = "singleton connection";

/// Keyword on the second line of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Activate,
    Stop,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        match line {
            MAGICWORD => Command::Activate,
            STOP => Command::Stop,
            other => Command::Unknown(other.to_string()),
        }
    }
}

/// The single line a host answers an activation with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Exit,
}

impl Reply {
    pub fn as_str(self) -> &'static str {
        match self {
            Reply::Ack => ACK,
            Reply::Exit => EXIT,
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        match line {
            ACK => Some(Reply::Ack),
            EXIT => Some(Reply::Exit),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Reads protocol lines in the connection's encoding, each bounded by `timeout`.
///
/// Bytes taken from `inner` are kept in `pending` until a full line is
/// available, so a `next_line` that times out loses nothing and the next
/// call resumes the same line.
pub struct LineReader<R> {
    inner: R,
    encoding: WireEncoding,
    timeout: Duration,
    pending: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R, encoding: WireEncoding, timeout: Duration) -> Self {
        Self {
            inner,
            encoding,
            timeout,
            pending: Vec::new(),
        }
    }

    pub fn encoding(&self) -> WireEncoding {
        self.encoding
    }

    /// Next line without its terminator, or `None` at end of stream.
    pub async fn next_line(&mut self) -> Result<Option<String>, IpcError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.read_raw())
            .await
            .map_err(|_| IpcError::Timeout("protocol line"))?
    }

    // Cancel-safe: the only await is `fill_buf`, and consumed bytes are
    // moved into `pending` before the next one.
    async fn read_raw(&mut self) -> Result<Option<String>, IpcError> {
        loop {
            if let Some(end) = self.line_end() {
                if end > MAX_LINE_BYTES {
                    return Err(line_too_long());
                }
                let width = self.terminator_width();
                let mut line: Vec<u8> = self.pending.drain(..end + width).collect();
                line.truncate(end);
                return self.decode(line).map(Some);
            }
            if self.pending.len() > MAX_LINE_BYTES {
                return Err(line_too_long());
            }

            let available = self
                .inner
                .fill_buf()
                .await
                .map_err(|e| io_err(CONNECTION, e))?;
            if available.is_empty() {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let tail = std::mem::take(&mut self.pending);
                return self.decode(tail).map(Some);
            }
            let read = available.len();
            self.pending.extend_from_slice(available);
            self.inner.consume(read);
        }
    }

    fn terminator_width(&self) -> usize {
        match self.encoding {
            WireEncoding::Platform => 1,
            WireEncoding::Utf16le => 2,
        }
    }

    /// Byte offset of the next line terminator in `pending`.
    fn line_end(&self) -> Option<usize> {
        match self.encoding {
            WireEncoding::Platform => self.pending.iter().position(|&b| b == b'\n'),
            WireEncoding::Utf16le => self
                .pending
                .chunks_exact(2)
                .position(|pair| pair == [b'\n', 0])
                .map(|unit| unit * 2),
        }
    }

    fn decode(&self, mut bytes: Vec<u8>) -> Result<String, IpcError> {
        match self.encoding {
            WireEncoding::Platform => {
                if bytes.last() == Some(&b'\r') {
                    bytes.pop();
                }
                String::from_utf8(bytes).map_err(|_| IpcError::Encoding("UTF-8"))
            }
            WireEncoding::Utf16le => {
                // A dangling odd byte at end of stream is not a code unit.
                let mut units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                if units.last() == Some(&u16::from(b'\r')) {
                    units.pop();
                }
                String::from_utf16(&units).map_err(|_| IpcError::Encoding("UTF-16LE"))
            }
        }
    }
}

fn line_too_long() -> IpcError {
    IpcError::Protocol(format!("line exceeds {MAX_LINE_BYTES} bytes"))
}

/// Read an activation body up to and including the `si.EOF` sentinel.
///
/// Blank lines are skipped; property lines without `=` are ignored.
pub async fn read_activation<R: AsyncBufRead + Unpin>(
    lines: &mut LineReader<R>,
) -> Result<ActivationRequest, IpcError> {
    #[derive(Clone, Copy)]
    enum Section {
        Arguments,
        Properties,
    }

    let mut request = ActivationRequest::default();
    let mut section = Section::Arguments;

    for _ in 0..MAX_BODY_LINES {
        let Some(line) = lines.next_line().await? else {
            return Err(IpcError::Protocol(format!(
                "connection closed before {EOF}"
            )));
        };

        match line.as_str() {
            EOF => return Ok(request),
            ARG_SECTION => section = Section::Arguments,
            PROP_SECTION => section = Section::Properties,
            blank if blank.trim().is_empty() => {}
            text => match section {
                Section::Arguments => request.arguments.push(text.to_string()),
                Section::Properties => match text.split_once('=') {
                    Some((key, value)) => {
                        request.properties.insert(key.to_string(), value.to_string());
                    }
                    None => tracing::debug!(line = text, "ignoring property line without '='"),
                },
            },
        }
    }

    Err(IpcError::Protocol(format!(
        "activation body exceeds {MAX_BODY_LINES} lines"
    )))
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

pub fn encode_line(encoding: WireEncoding, line: &str, out: &mut Vec<u8>) {
    match encoding {
        WireEncoding::Platform => {
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
        WireEncoding::Utf16le => {
            for unit in line.encode_utf16().chain(std::iter::once(u16::from(b'\n'))) {
                out.extend_from_slice(&unit.to_le_bytes());
            }
        }
    }
}

/// Full `si.init` connection payload, selector byte included.
///
/// Arguments and properties that would break line framing are rejected
/// rather than silently split. Blank arguments are rejected too, since
/// `read_activation` skips blank lines.
pub fn encode_activation(
    encoding: WireEncoding,
    secret: Secret,
    request: &ActivationRequest,
) -> Result<Vec<u8>, IpcError> {
    for arg in &request.arguments {
        check_line("argument", arg)?;
        if arg.trim().is_empty() {
            return Err(IpcError::Protocol(
                "argument is blank and would be dropped by the host".to_string(),
            ));
        }
    }
    for (key, value) in &request.properties {
        check_line("property key", key)?;
        check_line("property value", value)?;
        if key.is_empty() || key.contains('=') {
            return Err(IpcError::Protocol(format!(
                "property key '{key}' must be non-empty and free of '='"
            )));
        }
    }

    let mut out = vec![encoding.selector()];
    encode_line(encoding, &secret.to_string(), &mut out);
    encode_line(encoding, MAGICWORD, &mut out);
    encode_line(encoding, ARG_SECTION, &mut out);
    for arg in &request.arguments {
        encode_line(encoding, arg, &mut out);
    }
    if !request.properties.is_empty() {
        encode_line(encoding, PROP_SECTION, &mut out);
        for (key, value) in &request.properties {
            encode_line(encoding, &format!("{key}={value}"), &mut out);
        }
    }
    encode_line(encoding, EOF, &mut out);
    Ok(out)
}

/// Full `si.stop` connection payload.
pub fn encode_stop(encoding: WireEncoding, secret: Secret) -> Vec<u8> {
    let mut out = vec![encoding.selector()];
    encode_line(encoding, &secret.to_string(), &mut out);
    encode_line(encoding, STOP, &mut out);
    out
}

pub async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    encoding: WireEncoding,
    reply: Reply,
) -> Result<(), IpcError> {
    let mut out = Vec::new();
    encode_line(encoding, reply.as_str(), &mut out);
    writer
        .write_all(&out)
        .await
        .map_err(|e| io_err(CONNECTION, e))?;
    writer.flush().await.map_err(|e| io_err(CONNECTION, e))?;
    Ok(())
}

fn check_line(what: &str, text: &str) -> Result<(), IpcError> {
    if text.contains(['\n', '\r']) {
        return Err(IpcError::Protocol(format!("{what} contains a line break")));
    }
    if matches!(text, EOF | ARG_SECTION | PROP_SECTION) {
        return Err(IpcError::Protocol(format!(
            "{what} '{text}' collides with a protocol keyword"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn reader(bytes: &[u8], encoding: WireEncoding) -> LineReader<BufReader<&[u8]>> {
        LineReader::new(BufReader::new(bytes), encoding, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn utf8_lines_strip_crlf_and_keep_partial_tail() {
        let mut lines = reader(b"123\r\nsi.init\nlast", WireEncoding::Platform);
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("123"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("si.init"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("last"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn utf16le_lines_decode_non_ascii() {
        let mut bytes = Vec::new();
        encode_line(WireEncoding::Utf16le, "dicom:get -l \"Müller ß.dcm\"", &mut bytes);
        encode_line(WireEncoding::Utf16le, "", &mut bytes);

        let mut lines = reader(&bytes, WireEncoding::Utf16le);
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("dicom:get -l \"Müller ß.dcm\"")
        );
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_utf8_is_an_encoding_error() {
        let mut lines = reader(b"\xff\xfe\n", WireEncoding::Platform);
        assert!(matches!(
            lines.next_line().await,
            Err(IpcError::Encoding("UTF-8"))
        ));
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let bytes = vec![b'a'; MAX_LINE_BYTES + 10];
        let mut lines = reader(&bytes, WireEncoding::Platform);
        assert!(matches!(
            lines.next_line().await,
            Err(IpcError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn activation_body_sections() {
        let body = b"bare-arg\nsi.arg\n\ndicom:get -l foo.dcm\nsi.prop\napp.user=alice\nno-equals\napp.config.hash=a=b\nsi.EOF\n";
        let mut lines = reader(body, WireEncoding::Platform);
        let request = read_activation(&mut lines).await.expect("body");

        assert_eq!(request.arguments, vec!["bare-arg", "dicom:get -l foo.dcm"]);
        assert_eq!(request.property("app.user"), Some("alice"));
        assert_eq!(request.property("app.config.hash"), Some("a=b"));
        assert_eq!(request.properties.len(), 2);
    }

    #[tokio::test]
    async fn activation_without_sentinel_is_a_protocol_error() {
        let mut lines = reader(b"arg\n", WireEncoding::Platform);
        let err = read_activation(&mut lines).await.unwrap_err();
        assert!(err.to_string().contains("si.EOF"), "got: {err}");
    }

    #[tokio::test]
    async fn encoded_activation_is_readable_in_both_encodings() {
        let request = ActivationRequest::new(vec!["a b".into(), "ç".into()])
            .with_property("app.user", "bob");

        for encoding in [WireEncoding::Platform, WireEncoding::Utf16le] {
            let payload = encode_activation(encoding, Secret::from(77), &request).expect("encode");
            assert_eq!(payload[0], encoding.selector());

            let mut lines = reader(&payload[1..], encoding);
            assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("77"));
            assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(MAGICWORD));
            assert_eq!(read_activation(&mut lines).await.expect("body"), request);
        }
    }

    #[test]
    fn framing_breaking_arguments_are_rejected() {
        let secret = Secret::from(1);
        for bad in ["two\nlines", "cr\r", EOF, PROP_SECTION, "", "  \t"] {
            let request = ActivationRequest::new(vec![bad.to_string()]);
            assert!(encode_activation(WireEncoding::Platform, secret, &request).is_err());
        }

        let bad_key = ActivationRequest::default().with_property("a=b", "c");
        assert!(encode_activation(WireEncoding::Platform, secret, &bad_key).is_err());
    }

    #[test]
    fn stop_payload_layout() {
        let payload = encode_stop(WireEncoding::Platform, Secret::from(123_456_789));
        assert_eq!(payload, b"\x01123456789\nsi.stop\n".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn line_split_across_a_timeout_is_resumed_not_lost() {
        let mock = tokio_test::io::Builder::new()
            .read(b"si.")
            .wait(Duration::from_millis(450))
            .read(b"ack\n")
            .build();
        let mut lines = LineReader::new(
            BufReader::new(mock),
            WireEncoding::Platform,
            Duration::from_millis(300),
        );

        assert!(matches!(
            lines.next_line().await,
            Err(IpcError::Timeout(_))
        ));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(ACK));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn utf16le_unit_split_across_a_timeout_is_resumed() {
        let mut encoded = Vec::new();
        encode_line(WireEncoding::Utf16le, EXIT, &mut encoded);
        // Cut mid code unit.
        let (head, tail) = encoded.split_at(5);
        let mock = tokio_test::io::Builder::new()
            .read(head)
            .wait(Duration::from_millis(450))
            .read(tail)
            .build();
        let mut lines = LineReader::new(
            BufReader::new(mock),
            WireEncoding::Utf16le,
            Duration::from_millis(300),
        );

        assert!(lines.next_line().await.is_err());
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(EXIT));
    }

    #[tokio::test]
    async fn several_lines_in_one_read_are_returned_one_by_one() {
        let mock = tokio_test::io::Builder::new().read(b"1\nsi.stop\n").build();
        let mut lines = LineReader::new(
            BufReader::new(mock),
            WireEncoding::Platform,
            Duration::from_secs(1),
        );
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("1"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(STOP));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn replies_are_written_in_the_connection_encoding() {
        let mut utf8 = tokio_test::io::Builder::new().write(b"si.ack\n").build();
        write_reply(&mut utf8, WireEncoding::Platform, Reply::Ack)
            .await
            .expect("write ack");

        let mut expected = Vec::new();
        encode_line(WireEncoding::Utf16le, EXIT, &mut expected);
        let mut utf16 = tokio_test::io::Builder::new().write(&expected).build();
        write_reply(&mut utf16, WireEncoding::Utf16le, Reply::Exit)
            .await
            .expect("write exit");
    }

    #[test]
    fn keywords_parse() {
        assert_eq!(Command::parse("si.init"), Command::Activate);
        assert_eq!(Command::parse("si.stop"), Command::Stop);
        assert_eq!(Command::parse("hello"), Command::Unknown("hello".into()));
        assert_eq!(Reply::parse("si.ack"), Some(Reply::Ack));
        assert_eq!(Reply::parse("si.exit"), Some(Reply::Exit));
        assert_eq!(Reply::parse(""), None);
    }
}
