use bytes::{Buf, BytesMut};

use crate::{AppError, AppResult};

/// Chunked input buffer backing the protocol framers.
///
/// Bytes arrive in arbitrary slices from the socket reader and are consumed
/// as lines or fixed-size runs.  The content is assumed to be line-oriented
/// text, possibly UTF-8: a newline is a single-byte ASCII character that can
/// never appear inside a multi-byte UTF-8 sequence, so the buffer can be
/// scanned for line terminators without decoding.  Reads are only allowed up
/// through the last terminator seen (`useful` bytes); a read that would need
/// bytes not yet received consumes nothing and returns `None`, so the same
/// read can simply be retried after the next `add_buffer` call.  Unlike a
/// plain cursor there is no rollback: a partial line is never partially
/// consumed in the first place.
///
/// With WebSocket framing enabled, 0xFF frame terminators count as line
/// terminators and 0x00 frame starters are skipped, per the hixie-era
/// framing the post-handshake stream uses.
#[derive(Debug)]
pub struct ChunkyInputStream {
    buf: BytesMut,
    /// Bytes at the front of `buf` that may be consumed right now.
    useful: usize,
    websocket_framing: bool,
}

impl ChunkyInputStream {
    pub fn new() -> ChunkyInputStream {
        ChunkyInputStream {
            buf: BytesMut::with_capacity(4 * 1024),
            useful: 0,
            websocket_framing: false,
        }
    }

    /// Append newly received bytes and extend the readable region up through
    /// the last line terminator in the new data.
    pub fn add_buffer(&mut self, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            if b == b'\n' || (self.websocket_framing && b == 0xFF) {
                self.useful = self.buf.len() + i + 1;
            }
        }
        self.buf.extend_from_slice(data);
    }

    /// Number of unconsumed bytes fed in, whether currently readable or not.
    pub fn available(&self) -> usize {
        self.buf.len()
    }

    /// Messages are delimited by 0x00/0xFF frames instead of newlines from
    /// here on (the post-handshake phase of a WebSocket connection).
    pub fn enable_websocket_framing(&mut self) {
        self.websocket_framing = true;
    }

    /// Allow the next `count` buffered bytes to be read even though no line
    /// terminator covers them.  Used to read an HTTP body whose length is
    /// known from Content-Length.
    pub fn update_useful_byte_count(&mut self, count: usize) {
        if self.useful < count {
            self.useful = count;
        }
    }

    fn read_byte(&mut self) -> Option<u8> {
        if self.useful == 0 {
            return None;
        }
        self.useful -= 1;
        Some(self.buf.get_u8())
    }

    /// Read exactly `count` raw bytes, or `None` if that many are not yet
    /// buffered.  Raw reads are not limited to the line-terminated region.
    pub fn read_bytes(&mut self, count: usize) -> Option<Vec<u8>> {
        if self.buf.len() < count {
            return None;
        }
        let out = self.buf.split_to(count).to_vec();
        self.useful = self.useful.saturating_sub(count);
        Some(out)
    }

    /// Read the next newline-terminated line as ASCII, stripping the line
    /// terminator and any carriage return.  `None` if no complete line is
    /// buffered yet; nothing is consumed in that case.
    pub fn read_ascii_line(&mut self) -> AppResult<Option<String>> {
        self.read_line(false)
    }

    /// Read the next newline-terminated line as UTF-8.  Multi-byte sequences
    /// split across chunk boundaries decode correctly; malformed sequences
    /// are a fatal stream error.
    pub fn read_utf8_line(&mut self) -> AppResult<Option<String>> {
        self.read_line(true)
    }

    fn read_line(&mut self, utf8: bool) -> AppResult<Option<String>> {
        let mut line = String::new();
        let mut ch = match self.read_char(utf8)? {
            Some(c) => c,
            None => return Ok(None),
        };
        while ch != '\n' {
            if ch != '\r' && ch != '\0' {
                line.push(ch);
            }
            // A terminator is known to be buffered, so the line cannot run dry.
            ch = match self.read_char(utf8)? {
                Some(c) => c,
                None => return Ok(None),
            };
        }
        Ok(Some(line))
    }

    fn read_char(&mut self, utf8: bool) -> AppResult<Option<char>> {
        let byte_a = match self.read_byte() {
            Some(b) => b,
            None => return Ok(None),
        };
        if self.websocket_framing && utf8 {
            if byte_a == 0x00 {
                // WebSocket start-of-frame: a nul, skipped by the line reader
                return Ok(Some('\0'));
            } else if byte_a == 0xFF {
                // WebSocket end-of-frame: stands in for a newline
                return Ok(Some('\n'));
            }
        }
        if !utf8 || byte_a & 0x80 == 0 {
            return Ok(Some(byte_a as char));
        }
        let code = if byte_a & 0xE0 == 0xC0 {
            let byte_b = self.read_byte().ok_or(AppError::BadUtf8)?;
            if byte_b & 0xC0 != 0x80 {
                return Err(AppError::BadUtf8);
            }
            ((byte_a as u32 & 0x1F) << 6) | (byte_b as u32 & 0x3F)
        } else if byte_a & 0xF0 == 0xE0 {
            let byte_b = self.read_byte().ok_or(AppError::BadUtf8)?;
            let byte_c = self.read_byte().ok_or(AppError::BadUtf8)?;
            if byte_b & 0xC0 != 0x80 || byte_c & 0xC0 != 0x80 {
                return Err(AppError::BadUtf8);
            }
            ((byte_a as u32 & 0x0F) << 12) | ((byte_b as u32 & 0x3F) << 6) | (byte_c as u32 & 0x3F)
        } else if byte_a & 0xF8 == 0xF0 {
            let byte_b = self.read_byte().ok_or(AppError::BadUtf8)?;
            let byte_c = self.read_byte().ok_or(AppError::BadUtf8)?;
            let byte_d = self.read_byte().ok_or(AppError::BadUtf8)?;
            if byte_b & 0xC0 != 0x80 || byte_c & 0xC0 != 0x80 || byte_d & 0xC0 != 0x80 {
                return Err(AppError::BadUtf8);
            }
            ((byte_a as u32 & 0x07) << 18)
                | ((byte_b as u32 & 0x3F) << 12)
                | ((byte_c as u32 & 0x3F) << 6)
                | (byte_d as u32 & 0x3F)
        } else {
            return Err(AppError::BadUtf8);
        };
        char::from_u32(code).map(Some).ok_or(AppError::BadUtf8)
    }
}

impl Default for ChunkyInputStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn feed(stream: &mut ChunkyInputStream, chunks: &[&[u8]]) {
        for chunk in chunks {
            stream.add_buffer(chunk);
        }
    }

    #[rstest]
    #[case::single_chunk(&[b"one\ntwo\n" as &[u8]])]
    #[case::split_mid_line(&[b"on" as &[u8], b"e\ntw", b"o\n"])]
    #[case::byte_at_a_time(&[b"o" as &[u8], b"n", b"e", b"\n", b"t", b"w", b"o", b"\n"])]
    fn lines_survive_arbitrary_chunking(#[case] chunks: &[&[u8]]) {
        let mut stream = ChunkyInputStream::new();
        feed(&mut stream, chunks);
        assert_eq!(stream.read_ascii_line().unwrap(), Some("one".to_string()));
        assert_eq!(stream.read_ascii_line().unwrap(), Some("two".to_string()));
        assert_eq!(stream.read_ascii_line().unwrap(), None);
    }

    #[test]
    fn partial_line_is_not_lost_across_retries() {
        let mut stream = ChunkyInputStream::new();
        stream.add_buffer(b"hel");
        assert_eq!(stream.read_ascii_line().unwrap(), None);
        assert_eq!(stream.read_ascii_line().unwrap(), None);
        stream.add_buffer(b"lo\nrest");
        assert_eq!(stream.read_ascii_line().unwrap(), Some("hello".to_string()));
        assert_eq!(stream.read_ascii_line().unwrap(), None);
        stream.add_buffer(b"\n");
        assert_eq!(stream.read_ascii_line().unwrap(), Some("rest".to_string()));
    }

    #[test]
    fn carriage_returns_are_stripped() {
        let mut stream = ChunkyInputStream::new();
        stream.add_buffer(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(
            stream.read_ascii_line().unwrap(),
            Some("GET / HTTP/1.1".to_string())
        );
        assert_eq!(stream.read_ascii_line().unwrap(), Some("Host: x".to_string()));
        assert_eq!(stream.read_ascii_line().unwrap(), Some("".to_string()));
    }

    #[test]
    fn utf8_sequence_split_across_chunks() {
        let encoded = "héllo 世界\n".as_bytes();
        // split inside the two-byte and three-byte sequences
        for split in 1..encoded.len() {
            let mut stream = ChunkyInputStream::new();
            stream.add_buffer(&encoded[..split]);
            let _ = stream.read_utf8_line();
            stream.add_buffer(&encoded[split..]);
            assert_eq!(
                stream.read_utf8_line().unwrap(),
                Some("héllo 世界".to_string()),
                "failed at split {}",
                split
            );
        }
    }

    #[test]
    fn read_bytes_is_exact_or_nothing() {
        let mut stream = ChunkyInputStream::new();
        stream.add_buffer(b"12345678");
        assert_eq!(stream.read_bytes(10), None);
        assert_eq!(stream.read_bytes(8), Some(b"12345678".to_vec()));
        assert_eq!(stream.available(), 0);
    }

    #[test]
    fn body_bytes_readable_after_update_useful_count() {
        let mut stream = ChunkyInputStream::new();
        stream.add_buffer(b"header\nbody-no-newline");
        assert_eq!(stream.read_ascii_line().unwrap(), Some("header".to_string()));
        assert_eq!(stream.read_ascii_line().unwrap(), None);
        stream.update_useful_byte_count(15);
        let body = stream.read_bytes(15).unwrap();
        assert_eq!(body, b"body-no-newline".to_vec());
    }

    #[test]
    fn websocket_framing_maps_frame_bytes() {
        let mut stream = ChunkyInputStream::new();
        stream.enable_websocket_framing();
        let mut frame = vec![0x00u8];
        frame.extend_from_slice(b"{\"a\":1}");
        frame.push(0xFF);
        stream.add_buffer(&frame);
        assert_eq!(
            stream.read_utf8_line().unwrap(),
            Some("{\"a\":1}".to_string())
        );
        assert_eq!(stream.read_utf8_line().unwrap(), None);
    }
}
