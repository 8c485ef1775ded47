//! Stream I/O helpers: buffered head reads with big-buffer upgrade and the
//! chunked transfer-coding codec.
//!
//! Connections read request and response heads into a buffer that starts at
//! chunk size and upgrades once, to a bounded "big buffer", when a head
//! overflows it. Chunked bodies are framed and unframed incrementally so any
//! sequence of write sizes round-trips exactly.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::chunk::CHUNK_SIZE;
use crate::error::{ProxyError, Result};
use crate::parse::find_end_of_headers;

/// Upper bound for an upgraded head buffer.
pub const BIG_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of reading a head.
#[derive(Debug)]
pub enum HeadRead {
    /// A complete head ends at this offset in the buffer.
    Complete(usize),
    /// Clean EOF with an empty buffer; the peer closed between messages.
    Closed,
}

/// Read from `stream` into `buf` until a complete header block is present.
///
/// The buffer is allowed to grow to [`CHUNK_SIZE`] and then, if the head
/// still has no end, once more up to `big_cap`. Past that the head is
/// rejected. Bytes beyond the head stay in `buf` for the caller.
pub async fn read_head<S>(stream: &mut S, buf: &mut BytesMut, big_cap: usize) -> Result<HeadRead>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_end_of_headers(buf) {
            return Ok(HeadRead::Complete(end));
        }
        let cap = if buf.len() < CHUNK_SIZE { CHUNK_SIZE } else { big_cap };
        if buf.len() >= cap {
            return Err(ProxyError::BadRequest("header block too long"));
        }
        buf.reserve(cap - buf.len());
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(HeadRead::Closed);
            }
            return Err(ProxyError::BadRequest("truncated header block"));
        }
    }
}

/// Append one chunked-coding frame for `data` to `out`.
///
/// An empty `data` is skipped rather than framed, since a zero-length chunk
/// would terminate the body.
pub fn write_chunk_frame(out: &mut BytesMut, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    let size = format!("{:x}\r\n", data.len());
    out.reserve(size.len() + data.len() + 2);
    out.put_slice(size.as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

/// The chunked-body terminator.
pub const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Size,
    Data,
    DataCrlf,
    Trailer,
    Done,
}

/// Incremental parser for chunked transfer coding.
///
/// Feed it raw connection bytes; it consumes framing and appends payload
/// bytes to the output. Trailers are absorbed and discarded.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecodeState,
    remaining: u64,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    /// A decoder at the start of a chunked body.
    pub fn new() -> ChunkedDecoder {
        ChunkedDecoder { state: DecodeState::Size, remaining: 0 }
    }

    /// True once the terminating zero chunk and trailers are consumed.
    pub fn is_finished(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Consume as much of `input` as possible, appending payload to `out`.
    ///
    /// Leaves any incomplete framing in `input` for the next call.
    pub fn decode(&mut self, input: &mut BytesMut, out: &mut Vec<u8>) -> Result<()> {
        loop {
            match self.state {
                DecodeState::Done => return Ok(()),
                DecodeState::Size => {
                    let Some(line_end) = find_line(input) else { return Ok(()) };
                    let line = input.split_to(line_end + 1);
                    let text = trim_line(&line);
                    let size_text = text.split(|&b| b == b';').next().unwrap_or(&[]);
                    let size = parse_hex(size_text)
                        .ok_or(ProxyError::UpstreamProtoError("malformed chunk size"))?;
                    if size == 0 {
                        self.state = DecodeState::Trailer;
                    } else {
                        self.remaining = size;
                        self.state = DecodeState::Data;
                    }
                }
                DecodeState::Data => {
                    if input.is_empty() {
                        return Ok(());
                    }
                    let take = (self.remaining as usize).min(input.len());
                    out.extend_from_slice(&input.split_to(take));
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.state = DecodeState::DataCrlf;
                    }
                }
                DecodeState::DataCrlf => {
                    let Some(line_end) = find_line(input) else { return Ok(()) };
                    let line = input.split_to(line_end + 1);
                    if !trim_line(&line).is_empty() {
                        return Err(ProxyError::UpstreamProtoError("missing chunk delimiter"));
                    }
                    self.state = DecodeState::Size;
                }
                DecodeState::Trailer => {
                    let Some(line_end) = find_line(input) else { return Ok(()) };
                    let line = input.split_to(line_end + 1);
                    if trim_line(&line).is_empty() {
                        self.state = DecodeState::Done;
                    }
                }
            }
        }
    }
}

fn find_line(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_hex(text: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(text).ok()?.trim();
    if text.is_empty() || text.len() > 16 {
        return None;
    }
    u64::from_str_radix(text, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(pieces: &[&[u8]]) -> BytesMut {
        let mut out = BytesMut::new();
        for piece in pieces {
            write_chunk_frame(&mut out, piece);
        }
        out.put_slice(CHUNKED_TERMINATOR);
        out
    }

    #[test]
    fn codec_round_trips_any_write_sizes() {
        let pieces: Vec<&[u8]> = vec![b"a", b"bcd", b"", b"efghij", b"\r\n", b"0"];
        let mut encoded = encode_all(&pieces);

        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        decoder.decode(&mut encoded, &mut out).unwrap();
        assert!(decoder.is_finished());
        assert_eq!(out, b"abcdefghij\r\n0");
    }

    #[test]
    fn decoder_handles_byte_at_a_time_input() {
        let encoded = encode_all(&[b"hello", b" world"]);
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        let mut input = BytesMut::new();
        for byte in encoded.iter() {
            input.put_u8(*byte);
            decoder.decode(&mut input, &mut out).unwrap();
        }
        assert!(decoder.is_finished());
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn decoder_ignores_chunk_extensions_and_trailers() {
        let mut input = BytesMut::from(&b"5;ext=1\r\nhello\r\n0\r\nx-trailer: v\r\n\r\nleft"[..]);
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        decoder.decode(&mut input, &mut out).unwrap();
        assert!(decoder.is_finished());
        assert_eq!(out, b"hello");
        // Bytes after the body stay in the input buffer.
        assert_eq!(&input[..], b"left");
    }

    #[test]
    fn decoder_rejects_bad_framing() {
        let mut input = BytesMut::from(&b"zz\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        assert!(decoder.decode(&mut input, &mut out).is_err());

        let mut input = BytesMut::from(&b"3\r\nabcX\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();
        let mut out = Vec::new();
        assert!(decoder.decode(&mut input, &mut out).is_err());
    }

    #[tokio::test]
    async fn read_head_upgrades_then_rejects() {
        // A head bigger than a chunk but under the big cap parses fine.
        let mut head = Vec::new();
        head.extend_from_slice(b"GET / HTTP/1.1\r\n");
        while head.len() < CHUNK_SIZE + 100 {
            head.extend_from_slice(b"X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        head.extend_from_slice(b"\r\n");
        let mut buf = BytesMut::new();
        let mut stream = std::io::Cursor::new(head.clone());
        match read_head(&mut stream, &mut buf, BIG_BUFFER_SIZE).await.unwrap() {
            HeadRead::Complete(end) => assert_eq!(end, head.len()),
            other => panic!("unexpected: {other:?}"),
        }

        // Past the big cap the head is rejected.
        let mut buf = BytesMut::new();
        let huge = vec![b'a'; BIG_BUFFER_SIZE + 10];
        let mut stream = std::io::Cursor::new(huge);
        assert!(read_head(&mut stream, &mut buf, BIG_BUFFER_SIZE).await.is_err());
    }

    #[tokio::test]
    async fn read_head_reports_clean_close() {
        let mut buf = BytesMut::new();
        let mut stream = std::io::Cursor::new(Vec::<u8>::new());
        match read_head(&mut stream, &mut buf, BIG_BUFFER_SIZE).await.unwrap() {
            HeadRead::Closed => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
