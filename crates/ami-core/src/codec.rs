//! Line-oriented block framing
//!
//! A block is a run of `Key: Value` lines terminated by an empty line. Writes
//! always use CRLF; reads accept CRLF or bare LF. A malformed line poisons
//! only the block it belongs to: the reader consumes the rest of that block
//! and reports [`AmiError::ProtocolParse`], leaving the stream positioned at
//! the start of the next block.
//!
//! Encoding refuses any field that would not decode back to itself: keys may
//! not contain `:` or line breaks and may not start or end with whitespace,
//! values may not contain line breaks.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::trace;

use crate::error::{AmiError, AmiResult};
use crate::message::Fields;

const CRLF: &[u8] = b"\r\n";

fn has_line_break(text: &str) -> bool {
    text.contains(['\r', '\n'])
}

/// Check that a field survives an encode/decode cycle unchanged
pub fn validate_field(key: &str, value: &str) -> AmiResult<()> {
    if key.is_empty() {
        return Err(AmiError::invalid_field("empty key", key));
    }
    if key.contains(':') {
        return Err(AmiError::invalid_field("key contains ':'", key));
    }
    if has_line_break(key) {
        return Err(AmiError::invalid_field("key contains a line break", key));
    }
    if key.trim() != key {
        return Err(AmiError::invalid_field("key has surrounding whitespace", key));
    }
    if has_line_break(value) {
        return Err(AmiError::invalid_field("value contains a line break", key));
    }
    Ok(())
}

/// Encode a field mapping into one wire block
pub fn encode_block(fields: &Fields) -> AmiResult<Bytes> {
    let mut buf = BytesMut::with_capacity(64 + fields.len() * 32);
    for (key, value) in fields.iter() {
        validate_field(key, value)?;
        buf.put_slice(key.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(CRLF);
    }
    buf.put_slice(CRLF);
    Ok(buf.freeze())
}

/// Split one `Key: Value` line at its first colon
pub fn parse_line(line: &str) -> AmiResult<(String, String)> {
    let Some((key, value)) = line.split_once(':') else {
        return Err(AmiError::protocol_parse("missing ':' separator", line));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(AmiError::protocol_parse("empty key", line));
    }
    let value = value.strip_prefix(' ').unwrap_or(value);
    Ok((key.to_string(), value.to_string()))
}

/// Decode a complete block from a byte slice (test and tooling helper)
pub fn decode_block(raw: &[u8]) -> AmiResult<Fields> {
    let text = String::from_utf8_lossy(raw);
    let mut fields = Fields::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let (key, value) = parse_line(line)?;
        fields.push(key, value);
    }
    Ok(fields)
}

/// Incremental block decoder over an async buffered reader
#[derive(Debug)]
pub struct BlockReader<R> {
    inner: R,
    buf: Vec<u8>,
    lookahead: Option<String>,
}

impl<R> BlockReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(256),
            lookahead: None,
        }
    }

    /// Read one line without its terminator; `None` at end of stream
    async fn next_line(&mut self) -> AmiResult<Option<String>> {
        if let Some(line) = self.lookahead.take() {
            return Ok(Some(line));
        }
        self.buf.clear();
        let read = self.inner.read_until(b'\n', &mut self.buf).await?;
        if read == 0 {
            return Ok(None);
        }
        let mut end = self.buf.len();
        while end > 0 && (self.buf[end - 1] == b'\n' || self.buf[end - 1] == b'\r') {
            end -= 1;
        }
        Ok(Some(String::from_utf8_lossy(&self.buf[..end]).into_owned()))
    }

    /// Read the server greeting
    ///
    /// Asterisk announces itself with one bare line (`Asterisk Call
    /// Manager/5.0.1`) before any block. If the first line already looks like
    /// a field it is kept for the next [`read_block`](Self::read_block).
    pub async fn read_greeting(&mut self) -> AmiResult<Option<String>> {
        loop {
            match self.next_line().await? {
                None => return Err(AmiError::connection("connection closed before greeting")),
                Some(line) if line.is_empty() => continue,
                Some(line) => {
                    if parse_line(&line).is_ok() {
                        self.lookahead = Some(line);
                        return Ok(None);
                    }
                    trace!(banner = %line, "Received AMI greeting");
                    return Ok(Some(line));
                }
            }
        }
    }

    /// Read the next block
    ///
    /// Returns `Ok(None)` at end of stream. A partial block cut off by end of
    /// stream is discarded.
    pub async fn read_block(&mut self) -> AmiResult<Option<Fields>> {
        let mut fields = Fields::new();
        let mut first_error: Option<AmiError> = None;

        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };

            if line.is_empty() {
                if fields.is_empty() && first_error.is_none() {
                    // Stray separator between blocks.
                    continue;
                }
                return match first_error {
                    Some(err) => Err(err),
                    None => Ok(Some(fields)),
                };
            }

            match parse_line(&line) {
                Ok((key, value)) => fields.push(key, value),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::BufReader;

    fn reader(raw: &'static [u8]) -> BlockReader<BufReader<&'static [u8]>> {
        BlockReader::new(BufReader::new(raw))
    }

    #[test]
    fn test_encode_block() {
        let fields = Fields::new().with("Action", "Ping").with("ActionID", "1");
        assert_eq!(
            &encode_block(&fields).unwrap()[..],
            b"Action: Ping\r\nActionID: 1\r\n\r\n"
        );
    }

    #[test]
    fn test_encode_rejects_lossy_fields() {
        let lossy = [
            ("Variable", "a\r\nb"),
            ("Key", "v\r"),
            ("X:Y", "v"),
            (" Key", "v"),
            ("Key\t", "v"),
            ("Ke\ny", "v"),
            ("", "v"),
        ];
        for (key, value) in lossy {
            let fields = Fields::new().with("Action", "Setvar").with(key, value);
            match encode_block(&fields) {
                Err(AmiError::InvalidField { key: rejected, .. }) => assert_eq!(rejected, key),
                other => panic!("{key:?}: {value:?} should be rejected, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let fields = Fields::new()
            .with("Action", "Originate")
            .with("ActionID", "17")
            .with("Channel", "SIP/100")
            .with("Variable", "a=1")
            .with("Variable", "b=2")
            .with("Data", "");
        let decoded = decode_block(&encode_block(&fields).unwrap()).unwrap();
        assert_eq!(decoded, fields);
    }

    fn field_strategy() -> impl Strategy<Value = (String, String)> {
        (
            "[A-Za-z][A-Za-z0-9_ -]{0,14}[A-Za-z0-9]",
            "[^\r\n]{0,40}",
        )
    }

    proptest! {
        #[test]
        fn encoded_blocks_decode_to_the_same_fields(
            pairs in proptest::collection::vec(field_strategy(), 0..8)
        ) {
            let mut fields = Fields::new();
            for (key, value) in &pairs {
                fields.push(key.as_str(), value.as_str());
            }
            let decoded = decode_block(&encode_block(&fields).unwrap()).unwrap();
            prop_assert_eq!(decoded, fields);
        }
    }

    #[test]
    fn test_parse_line_keeps_colons_in_value() {
        let (key, value) = parse_line("Message: Timeout: 5s").unwrap();
        assert_eq!(key, "Message");
        assert_eq!(value, "Timeout: 5s");
        assert!(parse_line("no separator").is_err());
        assert!(parse_line(": value").is_err());
    }

    #[tokio::test]
    async fn test_read_blocks_in_order() {
        let mut reader = reader(
            b"Event: Newchannel\r\nUniqueid: 1\r\n\r\nEvent: Hangup\nUniqueid: 1\n\n",
        );
        let first = reader.read_block().await.unwrap().unwrap();
        assert_eq!(first.get("Event"), Some("Newchannel"));
        let second = reader.read_block().await.unwrap().unwrap();
        assert_eq!(second.get("Event"), Some("Hangup"));
        assert!(reader.read_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_block_is_skipped() {
        let mut reader = reader(
            b"Event: Broken\r\nthis line is garbage\r\nUniqueid: 5\r\n\r\n\
              Event: Hangup\r\nUniqueid: 99\r\n\r\n",
        );
        match reader.read_block().await {
            Err(AmiError::ProtocolParse { line, .. }) => {
                assert_eq!(line, "this line is garbage")
            }
            other => panic!("expected parse error, got {:?}", other),
        }
        let next = reader.read_block().await.unwrap().unwrap();
        assert_eq!(next.get("Uniqueid"), Some("99"));
    }

    #[tokio::test]
    async fn test_truncated_block_is_end_of_stream() {
        let mut reader = reader(b"Event: Hangup\r\nUniqueid: 1\r\n");
        assert!(reader.read_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_greeting_is_consumed() {
        let mut reader =
            reader(b"Asterisk Call Manager/5.0.1\r\nResponse: Success\r\nActionID: 1\r\n\r\n");
        assert_eq!(
            reader.read_greeting().await.unwrap().as_deref(),
            Some("Asterisk Call Manager/5.0.1")
        );
        let block = reader.read_block().await.unwrap().unwrap();
        assert_eq!(block.get("Response"), Some("Success"));
    }

    #[tokio::test]
    async fn test_missing_greeting_keeps_first_line() {
        let mut reader = reader(b"Response: Success\r\nActionID: 1\r\n\r\n");
        assert!(reader.read_greeting().await.unwrap().is_none());
        let block = reader.read_block().await.unwrap().unwrap();
        assert_eq!(block.len(), 2);
        assert_eq!(block.get("ActionID"), Some("1"));
    }
}
