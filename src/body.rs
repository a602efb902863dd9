//! Request bodies and HTTP/1.1 body framing.
//!
//! [`Body`] is the user-facing request body. [`BodyWriter`] and
//! [`BodyReader`] are sans-IO framing helpers: they move bytes between
//! borrowed buffers and apply content-length accounting or chunked
//! transfer encoding, without touching any socket.

use std::fmt;
use std::io;

use bytes::{Buf, Bytes};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method};

use crate::error::ParseError;
use crate::util::Writer;

/// A request body.
///
/// Buffered variants can be replayed by the retry and redirect layers.
/// A [`Body::Reader`] body can be sent exactly once; after the exchange it
/// becomes [`Body::Consumed`] and is no longer replayable.
#[derive(Default)]
pub enum Body {
    /// No request body.
    #[default]
    Empty,
    /// An owned buffer with a known length.
    Bytes(Bytes),
    /// A streaming source of unknown length. Sent with
    /// `transfer-encoding: chunked`.
    Reader(Box<dyn io::Read + Send>),
    /// Sentinel: the body has already been streamed to a server.
    Consumed,
}

impl Body {
    /// Body size when known up front.
    pub(crate) fn size(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Reader(_) => None,
            Body::Consumed => None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Body::Empty) || matches!(self, Body::Bytes(b) if b.is_empty())
    }

    /// Whether the body can be sent again from the start.
    pub(crate) fn is_replayable(&self) -> bool {
        matches!(self, Body::Empty | Body::Bytes(_))
    }

    /// A one-shot source for the wire. Buffered bodies are cheaply cloned
    /// so the original stays replayable; a reader body is taken and the
    /// body left as [`Body::Consumed`].
    pub(crate) fn to_source(&mut self) -> BodySource {
        match self {
            Body::Empty => BodySource::Empty,
            Body::Bytes(b) => BodySource::Buffer(b.clone()),
            Body::Reader(_) => match std::mem::replace(self, Body::Consumed) {
                Body::Reader(r) => BodySource::Reader(r),
                _ => unreachable!(),
            },
            Body::Consumed => BodySource::Empty,
        }
    }

    /// Peek at the buffered bytes, when buffered.
    pub(crate) fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Empty => Some(&[]),
            Body::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({})", b.len()),
            Body::Reader(_) => write!(f, "Body::Reader"),
            Body::Consumed => write!(f, "Body::Consumed"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        if b.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(b)
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Bytes::from(v).into()
    }
}

impl From<&[u8]> for Body {
    fn from(s: &[u8]) -> Self {
        Bytes::copy_from_slice(s).into()
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        s.as_bytes().into()
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Bytes::from(s.into_bytes()).into()
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Body::Empty
    }
}

/// The byte source the stream driver pulls from while sending.
pub(crate) enum BodySource {
    Empty,
    Buffer(Bytes),
    Reader(Box<dyn io::Read + Send>),
}

impl BodySource {
    /// Pull the next chunk into `buf`. `Ok(0)` means the source is done.
    pub fn next_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BodySource::Empty => Ok(0),
            BodySource::Buffer(b) => {
                let n = b.len().min(buf.len());
                buf[..n].copy_from_slice(&b[..n]);
                b.advance(n);
                Ok(n)
            }
            BodySource::Reader(r) => r.read(buf),
        }
    }
}

// //////////////////////////////////////////////////////////////////////// SENDING

/// Framing for an outgoing request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyWriter {
    /// No body is sent.
    NoBody,
    /// Exactly `left` more bytes are sent, framed by `content-length`.
    LengthDelimited { left: u64 },
    /// `transfer-encoding: chunked` framing.
    Chunked { ended: bool },
}

impl Default for BodyWriter {
    fn default() -> Self {
        BodyWriter::NoBody
    }
}

impl BodyWriter {
    pub fn new_none() -> BodyWriter {
        BodyWriter::NoBody
    }

    pub fn new_sized(len: u64) -> BodyWriter {
        BodyWriter::LengthDelimited { left: len }
    }

    pub fn new_chunked() -> BodyWriter {
        BodyWriter::Chunked { ended: false }
    }

    pub fn has_body(&self) -> bool {
        !matches!(self, BodyWriter::NoBody | BodyWriter::LengthDelimited { left: 0 })
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, BodyWriter::Chunked { .. })
    }

    pub fn is_ended(&self) -> bool {
        match self {
            BodyWriter::NoBody => true,
            BodyWriter::LengthDelimited { left } => *left == 0,
            BodyWriter::Chunked { ended } => *ended,
        }
    }

    /// Bytes remaining for length-delimited sending, `None` when chunked.
    pub fn left_to_send(&self) -> Option<u64> {
        match self {
            BodyWriter::NoBody => Some(0),
            BodyWriter::LengthDelimited { left } => Some(*left),
            BodyWriter::Chunked { .. } => None,
        }
    }

    /// Frame `input` into `w`, returning the amount of input consumed.
    ///
    /// An empty `input` signals the end of the body: for chunked framing
    /// this emits the terminating `0\r\n\r\n`.
    pub fn write(&mut self, input: &[u8], w: &mut Writer) -> usize {
        match self {
            BodyWriter::NoBody => 0,
            BodyWriter::LengthDelimited { left } => {
                let max = (*left).min(input.len() as u64) as usize;
                let n = w.write_bytes(&input[..max]);
                *left -= n as u64;
                n
            }
            BodyWriter::Chunked { ended } => {
                if *ended {
                    return 0;
                }

                if input.is_empty() {
                    if w.try_write(|w| io::Write::write_all(w, b"0\r\n\r\n")) {
                        *ended = true;
                    }
                    return 0;
                }

                let max = calculate_max_input(w.available()).min(input.len());
                if max == 0 {
                    return 0;
                }

                let ok = w.try_write(|w| {
                    use io::Write as _;
                    write!(w, "{:x}\r\n", max)?;
                    w.write_all(&input[..max])?;
                    w.write_all(b"\r\n")
                });

                if ok {
                    max
                } else {
                    0
                }
            }
        }
    }
}

/// Max chunk payload that fits an output buffer of `output_len` once the
/// chunk-size line and CRLF delimiters are accounted for.
pub(crate) fn calculate_max_input(output_len: usize) -> usize {
    let mut n = output_len.saturating_sub(5);
    while n > 0 && n + hex_len(n) + 4 > output_len {
        n -= 1;
    }
    n
}

fn hex_len(n: usize) -> usize {
    let mut len = 1;
    let mut v = n;
    while v >= 16 {
        v /= 16;
        len += 1;
    }
    len
}

// //////////////////////////////////////////////////////////////////////// RECEIVING

/// Framing of an incoming response body, decided once from the response
/// prelude and fixed thereafter.
#[derive(Debug)]
pub(crate) enum BodyReader {
    /// No body follows the headers (HEAD, 1xx, 204, 304, or length 0).
    NoBody,
    /// `content-length` delimited.
    LengthDelimited { left: u64 },
    /// `transfer-encoding: chunked`.
    Chunked(ChunkedDecoder),
    /// Body runs until the server closes the connection (HTTP/1.0
    /// semantics).
    CloseDelimited,
}

impl BodyReader {
    /// Decide response body framing per RFC 7230 §3.3.3.
    pub fn for_response(
        method: &Method,
        status: u16,
        headers: &HeaderMap,
    ) -> Result<BodyReader, ParseError> {
        if *method == Method::HEAD {
            return Ok(BodyReader::NoBody);
        }

        if (100..200).contains(&status) || status == 204 || status == 304 {
            return Ok(BodyReader::NoBody);
        }

        // Transfer-encoding wins over content-length.
        let mut chunked = false;
        for v in headers.get_all(TRANSFER_ENCODING) {
            let Ok(v) = v.to_str() else {
                continue;
            };
            if v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")) {
                chunked = true;
            }
        }
        if chunked {
            return Ok(BodyReader::Chunked(ChunkedDecoder::new()));
        }

        if let Some(len) = content_length(headers)? {
            return Ok(if len == 0 {
                BodyReader::NoBody
            } else {
                BodyReader::LengthDelimited { left: len }
            });
        }

        Ok(BodyReader::CloseDelimited)
    }

    /// Decode body bytes from `input` into `output`.
    ///
    /// The result is `(input consumed, output produced)`.
    pub fn read(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize), ParseError> {
        match self {
            BodyReader::NoBody => Ok((0, 0)),
            BodyReader::LengthDelimited { left } => {
                let n = (*left).min(input.len() as u64).min(output.len() as u64) as usize;
                output[..n].copy_from_slice(&input[..n]);
                *left -= n as u64;
                Ok((n, n))
            }
            BodyReader::Chunked(dec) => dec.read(input, output),
            BodyReader::CloseDelimited => {
                let n = input.len().min(output.len());
                output[..n].copy_from_slice(&input[..n]);
                Ok((n, n))
            }
        }
    }

    /// Whether the framing knows the body to be complete. Close-delimited
    /// bodies never report ended; the connection EOF ends them.
    pub fn is_ended(&self) -> bool {
        match self {
            BodyReader::NoBody => true,
            BodyReader::LengthDelimited { left } => *left == 0,
            BodyReader::Chunked(dec) => dec.is_ended(),
            BodyReader::CloseDelimited => false,
        }
    }

    pub fn is_close_delimited(&self) -> bool {
        matches!(self, BodyReader::CloseDelimited)
    }

    /// Whether a socket EOF at this point is clean framing.
    pub fn eof_is_clean(&self) -> bool {
        self.is_ended() || self.is_close_delimited()
    }
}

/// Extract a validated `content-length`, tolerating repeats with equal
/// values.
fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ParseError> {
    let mut found: Option<u64> = None;
    for v in headers.get_all(CONTENT_LENGTH) {
        let v = v
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(ParseError::BadContentLength)?;

        match found {
            Some(prev) if prev != v => return Err(ParseError::ConflictingContentLength),
            _ => found = Some(v),
        }
    }
    Ok(found)
}

/// Incremental decoder for `transfer-encoding: chunked`.
///
/// Chunk extensions and trailer fields are consumed and discarded.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size { accum: u64, seen_digit: bool },
    Extension { size: u64 },
    SizeLf { size: u64 },
    Data { left: u64 },
    DataCr,
    DataLf,
    TrailerStart,
    Trailer,
    TrailerLf,
    EndLf,
    Ended,
}

impl ChunkedDecoder {
    pub fn new() -> ChunkedDecoder {
        ChunkedDecoder {
            state: ChunkState::Size {
                accum: 0,
                seen_digit: false,
            },
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state == ChunkState::Ended
    }

    pub fn read(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize), ParseError> {
        let mut consumed = 0;
        let mut produced = 0;

        while consumed < input.len() {
            match self.state {
                ChunkState::Size { accum, seen_digit } => {
                    let c = input[consumed];
                    if !c.is_ascii() {
                        return Err(ParseError::ChunkLenNotAscii);
                    }
                    if let Some(d) = hex_digit(c) {
                        let next = accum
                            .checked_mul(16)
                            .and_then(|a| a.checked_add(d as u64))
                            .ok_or(ParseError::ChunkLenNotANumber)?;
                        self.state = ChunkState::Size {
                            accum: next,
                            seen_digit: true,
                        };
                        consumed += 1;
                    } else if c == b';' && seen_digit {
                        self.state = ChunkState::Extension { size: accum };
                        consumed += 1;
                    } else if c == b'\r' && seen_digit {
                        self.state = ChunkState::SizeLf { size: accum };
                        consumed += 1;
                    } else {
                        return Err(ParseError::ChunkLenNotANumber);
                    }
                }

                ChunkState::Extension { size } => {
                    // Everything up to CR is extension data we ignore.
                    match input[consumed..].iter().position(|&c| c == b'\r') {
                        Some(i) => {
                            consumed += i + 1;
                            self.state = ChunkState::SizeLf { size };
                        }
                        None => {
                            consumed = input.len();
                        }
                    }
                }

                ChunkState::SizeLf { size } => {
                    if input[consumed] != b'\n' {
                        return Err(ParseError::ChunkExpectedCrLf);
                    }
                    consumed += 1;
                    self.state = if size == 0 {
                        ChunkState::TrailerStart
                    } else {
                        ChunkState::Data { left: size }
                    };
                }

                ChunkState::Data { left } => {
                    let avail_out = output.len() - produced;
                    if avail_out == 0 {
                        return Ok((consumed, produced));
                    }
                    let n = left
                        .min((input.len() - consumed) as u64)
                        .min(avail_out as u64) as usize;
                    output[produced..produced + n]
                        .copy_from_slice(&input[consumed..consumed + n]);
                    consumed += n;
                    produced += n;

                    let left = left - n as u64;
                    self.state = if left == 0 {
                        ChunkState::DataCr
                    } else {
                        ChunkState::Data { left }
                    };
                }

                ChunkState::DataCr => {
                    if input[consumed] != b'\r' {
                        return Err(ParseError::ChunkExpectedCrLf);
                    }
                    consumed += 1;
                    self.state = ChunkState::DataLf;
                }

                ChunkState::DataLf => {
                    if input[consumed] != b'\n' {
                        return Err(ParseError::ChunkExpectedCrLf);
                    }
                    consumed += 1;
                    self.state = ChunkState::Size {
                        accum: 0,
                        seen_digit: false,
                    };
                }

                ChunkState::TrailerStart => {
                    if input[consumed] == b'\r' {
                        self.state = ChunkState::EndLf;
                    } else {
                        self.state = ChunkState::Trailer;
                    }
                    consumed += 1;
                }

                ChunkState::Trailer => {
                    match input[consumed..].iter().position(|&c| c == b'\r') {
                        Some(i) => {
                            consumed += i + 1;
                            self.state = ChunkState::TrailerLf;
                        }
                        None => {
                            consumed = input.len();
                        }
                    }
                }

                ChunkState::TrailerLf => {
                    if input[consumed] != b'\n' {
                        return Err(ParseError::ChunkExpectedCrLf);
                    }
                    consumed += 1;
                    self.state = ChunkState::TrailerStart;
                }

                ChunkState::EndLf => {
                    if input[consumed] != b'\n' {
                        return Err(ParseError::ChunkExpectedCrLf);
                    }
                    consumed += 1;
                    self.state = ChunkState::Ended;
                }

                ChunkState::Ended => break,
            }
        }

        Ok((consumed, produced))
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
