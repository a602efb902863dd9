//! The blocking driver for one exchange over a pooled connection.
//!
//! Upload and download overlap: once the prelude is on the wire (and the
//! optional 100-continue wait is resolved), the body writer runs on a
//! scoped thread against the write half while this thread parses the
//! response from the read half. An early response never cancels the
//! writer; if the server instead closes the socket, the writer's error is
//! suppressed when a final non-2xx response was received.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use log::{debug, trace};

use crate::body::{Body, BodyReader, BodySource, BodyWriter};
use crate::cancel::CancelToken;
use crate::error::Error;
use crate::exchange::{Exchange, SendState, WireRequest};
use crate::parser::ReasonPhrase;
use crate::pool::Transaction;
use crate::transport::is_timeout;
use crate::transport::{ReadHalf, WriteHalf};
use crate::util::{log_data, Deadline};

const IO_BUF: usize = 16 * 1024;
/// Room for one max-size chunk plus its framing.
const FRAME_BUF: usize = IO_BUF + 32;
/// Cap on the response prelude; more than this without a complete header
/// block is treated as malformed.
const MAX_PRELUDE: usize = 256 * 1024;

/// Per-drive parameters, resolved by the terminal from the call options.
pub(crate) struct DriveConfig<'a> {
    pub readtimeout: Duration,
    pub expect_timeout: Duration,
    pub verbose: u8,
    pub deadline: Deadline,
    pub cancel: Option<&'a CancelToken>,
}

impl DriveConfig<'_> {
    fn effective_read_timeout(&self) -> Option<Duration> {
        let rt = (!self.readtimeout.is_zero()).then_some(self.readtimeout);
        self.deadline.cap_opt(rt)
    }
}

/// What one drive produced.
pub(crate) struct Outcome {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: OutBody,
    /// Whether the connection may go back to the idle pool.
    pub reuse: bool,
    /// Bytes delivered to the caller's sink (0 when buffering).
    pub sink_bytes: usize,
}

pub(crate) enum OutBody {
    Buffered(Bytes),
    Streamed,
}

/// Drive one full request/response exchange over the transaction.
pub(crate) fn drive(
    tx: &mut Transaction,
    req: &WireRequest,
    body_writer: BodyWriter,
    body: &mut Body,
    expect_100: bool,
    sink: Option<&mut (dyn Write + Send + 'static)>,
    cfg: &DriveConfig,
) -> Result<Outcome, Error> {
    let slot = cfg.cancel.and_then(|c| c.register(tx.conn().socket()));
    let result = drive_inner(tx, req, body_writer, body, expect_100, sink, cfg);

    if let Some(c) = cfg.cancel {
        c.unregister(slot);
        if c.is_canceled() {
            tx.mark_broken();
            return Err(Error::Canceled);
        }
    }

    if result.is_err() {
        tx.mark_broken();
    }
    result
}

fn drive_inner(
    tx: &mut Transaction,
    req: &WireRequest,
    body_writer: BodyWriter,
    body: &mut Body,
    expect_100: bool,
    mut sink: Option<&mut (dyn Write + Send + 'static)>,
    cfg: &DriveConfig,
) -> Result<Outcome, Error> {
    let (mut rh, mut wh) = tx.split();
    let mut send = SendState::new(body_writer);
    let mut exchange = Exchange::new(req, &body_writer, expect_100);
    let mut inbuf = RecvBuffer::new();

    if cfg.verbose >= 1 {
        debug!("> {} {} {:?}", req.method, req.target, req.version);
    }

    send_prelude(&mut send, req, &mut wh, cfg)?;

    // Expect: 100-continue. Pause before the body until the server
    // answers 100 (or anything), or the expect timeout passes.
    if exchange.can_keep_await_100() {
        rh.set_read_timeout(Some(cfg.deadline.cap(cfg.expect_timeout)))?;

        while exchange.can_keep_await_100() {
            match inbuf.fill(&mut rh) {
                Ok(0) => break,
                Ok(_) => {
                    let n = exchange.try_read_100(inbuf.data())?;
                    if n > 0 {
                        inbuf.consume(n);
                        break;
                    }
                }
                Err(e) if is_timeout(&e) => {
                    trace!("no 100-continue within timeout, sending body");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    rh.set_read_timeout(cfg.effective_read_timeout())?;

    let send_body = exchange.should_send_body() && !send.body_ended();
    let mut source = if send_body { Some(body.to_source()) } else { None };

    // Overlap: the writer task streams the body while this thread reads
    // the response. Both halves of the transaction are independently
    // owned; the prelude is already on the wire, so the reader cannot
    // outrun the request head.
    let (recv_result, writer_result) = thread::scope(|scope| {
        let writer = source.as_mut().map(|source| {
            let send = &mut send;
            let wh = &mut wh;
            let verbose = cfg.verbose;
            scope.spawn(move || write_body_loop(send, source, wh, verbose))
        });

        let recv = recv_response(&mut exchange, &mut rh, &mut inbuf, sink.as_deref_mut(), cfg);

        if recv.is_err() {
            // Unblock a writer that may be stalled against a dead peer.
            let _ = tx.conn().socket().shutdown(Shutdown::Both);
        }

        let writer_result = match writer {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "body writer panicked",
                )))
            }),
            None => Ok(()),
        };

        (recv, writer_result)
    });

    drop(rh);
    drop(wh);

    let received = recv_result?;

    let reuse = match writer_result {
        Ok(()) => !exchange.must_close_connection(),
        Err(writer_err) => {
            // RFC 7230 §6.5: the server may reject a large upload with an
            // early response and close. The response wins over the
            // writer's pipe error, but the connection is done.
            let status = received.status;
            if status.as_u16() >= 200 && !status.is_success() {
                debug!(
                    "suppressing body writer error after {} response: {}",
                    status, writer_err
                );
                tx.mark_broken();
                false
            } else {
                return Err(writer_err);
            }
        }
    };

    if let Some(reason) = exchange.close_reason() {
        trace!("connection will close: {}", reason);
    }

    Ok(Outcome {
        status: received.status,
        reason: received.reason,
        version: received.version,
        headers: received.headers,
        body: if received.sink_bytes > 0 {
            OutBody::Streamed
        } else {
            OutBody::Buffered(Bytes::from(received.collected))
        },
        reuse,
        sink_bytes: received.sink_bytes,
    })
}

fn send_prelude(
    send: &mut SendState,
    req: &WireRequest,
    wh: &mut WriteHalf<'_>,
    cfg: &DriveConfig,
) -> Result<(), Error> {
    let mut outbuf = vec![0u8; IO_BUF];

    while !send.prelude_sent() {
        match send.write_prelude(req, &mut outbuf) {
            Ok(n) => {
                if n > 0 {
                    if cfg.verbose >= 2 {
                        log_data("send", &outbuf[..n]);
                    }
                    wh.write_all(&outbuf[..n])?;
                }
            }
            Err(Error::OutputOverflow) if outbuf.len() < MAX_PRELUDE => {
                outbuf.resize(outbuf.len() * 2, 0);
            }
            Err(e) => return Err(e),
        }
    }

    wh.flush()?;
    Ok(())
}

struct Received {
    status: StatusCode,
    reason: Option<String>,
    version: Version,
    headers: HeaderMap,
    collected: Vec<u8>,
    sink_bytes: usize,
}

fn recv_response(
    exchange: &mut Exchange,
    rh: &mut ReadHalf<'_>,
    inbuf: &mut RecvBuffer,
    mut sink: Option<&mut (dyn Write + Send + 'static)>,
    cfg: &DriveConfig,
) -> Result<Received, Error> {
    // Parse the prelude, pulling more input as needed.
    let response = loop {
        let (n, response) = exchange.try_response(inbuf.data())?;
        inbuf.consume(n);
        if let Some(r) = response {
            break r;
        }

        if inbuf.len() > MAX_PRELUDE {
            return Err(Error::Parse(crate::error::ParseError::Prelude(
                "response head too large".into(),
            )));
        }

        match inbuf.fill(rh) {
            Ok(0) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before response",
                )))
            }
            Ok(n) => {
                if cfg.verbose >= 2 {
                    log_data("recv", inbuf.tail(n));
                }
            }
            Err(e) if is_timeout(&e) => {
                return Err(Error::timed_out("no response within read timeout"))
            }
            Err(e) => return Err(Error::Io(e)),
        }

        if cfg.deadline.is_expired() {
            return Err(Error::timed_out("total request timeout"));
        }
        if cfg.cancel.is_some_and(|c| c.is_canceled()) {
            return Err(Error::Canceled);
        }
    };

    if cfg.verbose >= 1 {
        debug!("< {:?} {}", response.version(), response.status());
    }

    let mut received = Received {
        status: response.status(),
        reason: response
            .extensions()
            .get::<ReasonPhrase>()
            .map(|r| r.0.clone()),
        version: response.version(),
        headers: response.into_parts().0.headers,
        collected: Vec::new(),
        sink_bytes: 0,
    };

    // Read the body per the framing fixed by the prelude.
    let mut reader = exchange.take_body_reader();
    let mut decode = vec![0u8; IO_BUF];

    loop {
        while !inbuf.is_empty() && !reader.is_ended() {
            let (i, o) = reader.read(inbuf.data(), &mut decode)?;
            inbuf.consume(i);
            deliver(&decode[..o], &mut sink, &mut received, cfg)?;
            if i == 0 && o == 0 {
                break;
            }
        }

        if reader.is_ended() {
            break;
        }

        match inbuf.fill(rh) {
            Ok(0) => {
                if reader.eof_is_clean() {
                    break;
                }
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "response body truncated",
                )));
            }
            Ok(_) => {}
            Err(e) if is_timeout(&e) => {
                return Err(Error::timed_out("no body byte within read timeout"))
            }
            Err(e) => return Err(Error::Io(e)),
        }

        if cfg.deadline.is_expired() {
            return Err(Error::timed_out("total request timeout"));
        }
        if cfg.cancel.is_some_and(|c| c.is_canceled()) {
            return Err(Error::Canceled);
        }
    }

    Ok(received)
}

/// Body bytes go to the caller's sink in arrival order, or accumulate.
fn deliver(
    data: &[u8],
    sink: &mut Option<&mut (dyn Write + Send + 'static)>,
    received: &mut Received,
    cfg: &DriveConfig,
) -> Result<(), Error> {
    if data.is_empty() {
        return Ok(());
    }
    if cfg.verbose >= 3 {
        log_data("recv", data);
    }
    match sink {
        Some(s) => {
            s.write_all(data)?;
            received.sink_bytes += data.len();
        }
        None => received.collected.extend_from_slice(data),
    }
    Ok(())
}

/// The writer task: pull body chunks from the source, frame them, push
/// them down the write half, then half-close.
fn write_body_loop(
    send: &mut SendState,
    source: &mut BodySource,
    wh: &mut WriteHalf<'_>,
    verbose: u8,
) -> Result<(), Error> {
    let mut chunk = vec![0u8; IO_BUF];
    let mut out = vec![0u8; FRAME_BUF];

    loop {
        let n = source.next_chunk(&mut chunk)?;

        if n == 0 {
            // End of source: emit the chunked terminator, or verify a
            // sized body was fully delivered.
            let (_, o) = send.write_body(&[], &mut out)?;
            if o > 0 {
                if verbose >= 3 {
                    log_data("send", &out[..o]);
                }
                wh.write_all(&out[..o])?;
            }
            if !send.body_ended() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "request body ended before content-length",
                )));
            }
            break;
        }

        let mut offset = 0;
        while offset < n {
            let (i, o) = send.write_body(&chunk[offset..n], &mut out)?;
            if o > 0 {
                if verbose >= 3 {
                    log_data("send", &out[..o]);
                }
                wh.write_all(&out[..o])?;
            }
            offset += i;
            if i == 0 && o == 0 {
                break;
            }
        }

        if send.body_ended() {
            break;
        }
    }

    wh.close_write()?;
    trace!("request body sent");
    Ok(())
}

// //////////////////////////////////////////////////////////////////////// OPEN

/// Raw wire access for `open()` callers.
///
/// The internal reader/writer tasks are suppressed; the callback writes
/// body bytes (still framed per the request headers) and reads decoded
/// response body bytes directly. Whatever the callback leaves undone is
/// completed by the engine afterwards.
pub struct Stream<'a> {
    send: SendState,
    exchange: Exchange,
    rh: ReadHalf<'a>,
    wh: WriteHalf<'a>,
    inbuf: RecvBuffer,
    head: Option<Head>,
    reader: Option<BodyReader>,
    body_read_started: bool,
    verbose: u8,
}

struct Head {
    status: StatusCode,
    reason: Option<String>,
    version: Version,
    headers: HeaderMap,
}

impl<'a> Stream<'a> {
    /// Write request body bytes (framed as negotiated in the headers).
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        let mut out = vec![0u8; FRAME_BUF];
        let mut offset = 0;
        while offset < data.len() {
            let (i, o) = self.send.write_body(&data[offset..], &mut out)?;
            if o > 0 {
                if self.verbose >= 3 {
                    log_data("send", &out[..o]);
                }
                self.wh.write_all(&out[..o])?;
            }
            offset += i;
            if i == 0 && o == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Finish the request body (emits the chunked terminator).
    pub fn close_write(&mut self) -> Result<(), Error> {
        if self.send.body_ended() {
            return Ok(());
        }
        let mut out = vec![0u8; 64];
        let (_, o) = self.send.write_body(&[], &mut out)?;
        if o > 0 {
            self.wh.write_all(&out[..o])?;
        }
        self.wh.close_write()?;
        Ok(())
    }

    /// Block until the response prelude is parsed; returns the status.
    pub fn read_response(&mut self) -> Result<StatusCode, Error> {
        self.ensure_head()?;
        Ok(self.head.as_ref().unwrap().status)
    }

    /// The response headers. Parses the prelude if not done yet.
    pub fn headers(&mut self) -> Result<&HeaderMap, Error> {
        self.ensure_head()?;
        Ok(&self.head.as_ref().unwrap().headers)
    }

    /// Read decoded response body bytes. `Ok(0)` is end of body.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.ensure_head()?;
        self.body_read_started = true;

        let reader = self.reader.as_mut().unwrap();
        loop {
            if reader.is_ended() || buf.is_empty() {
                return Ok(0);
            }

            if !self.inbuf.is_empty() {
                let (i, o) = reader.read(self.inbuf.data(), buf)?;
                self.inbuf.consume(i);
                if o > 0 {
                    return Ok(o);
                }
                if i > 0 {
                    continue;
                }
            }

            match self.inbuf.fill(&mut self.rh) {
                Ok(0) => {
                    if reader.eof_is_clean() {
                        return Ok(0);
                    }
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "response body truncated",
                    )));
                }
                Ok(_) => {}
                Err(e) if is_timeout(&e) => {
                    return Err(Error::timed_out("no body byte within read timeout"))
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn ensure_head(&mut self) -> Result<(), Error> {
        if self.head.is_some() {
            return Ok(());
        }

        let response = loop {
            let (n, response) = self.exchange.try_response(self.inbuf.data())?;
            self.inbuf.consume(n);
            if let Some(r) = response {
                break r;
            }
            if self.inbuf.len() > MAX_PRELUDE {
                return Err(Error::Parse(crate::error::ParseError::Prelude(
                    "response head too large".into(),
                )));
            }
            match self.inbuf.fill(&mut self.rh) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before response",
                    )))
                }
                Ok(_) => {}
                Err(e) if is_timeout(&e) => {
                    return Err(Error::timed_out("no response within read timeout"))
                }
                Err(e) => return Err(Error::Io(e)),
            }
        };

        if self.verbose >= 1 {
            debug!("< {:?} {}", response.version(), response.status());
        }

        self.reader = Some(self.exchange.take_body_reader());
        self.head = Some(Head {
            status: response.status(),
            reason: response
                .extensions()
                .get::<ReasonPhrase>()
                .map(|r| r.0.clone()),
            version: response.version(),
            headers: response.into_parts().0.headers,
        });
        Ok(())
    }
}

/// Drive an `open()` call: prelude and expect-100 as usual, then the
/// callback owns the wire; the engine completes whatever remains.
pub(crate) fn drive_open(
    tx: &mut Transaction,
    req: &WireRequest,
    body_writer: BodyWriter,
    body: &mut Body,
    expect_100: bool,
    cfg: &DriveConfig,
    iofunction: &mut (dyn FnMut(&mut Stream<'_>) -> Result<(), Error> + Send),
) -> Result<Outcome, Error> {
    let slot = cfg.cancel.and_then(|c| c.register(tx.conn().socket()));
    let result = drive_open_inner(tx, req, body_writer, body, expect_100, cfg, iofunction);

    if let Some(c) = cfg.cancel {
        c.unregister(slot);
        if c.is_canceled() {
            tx.mark_broken();
            return Err(Error::Canceled);
        }
    }

    if result.is_err() {
        tx.mark_broken();
    }
    result
}

fn drive_open_inner(
    tx: &mut Transaction,
    req: &WireRequest,
    body_writer: BodyWriter,
    body: &mut Body,
    expect_100: bool,
    cfg: &DriveConfig,
    iofunction: &mut (dyn FnMut(&mut Stream<'_>) -> Result<(), Error> + Send),
) -> Result<Outcome, Error> {
    let (mut rh, mut wh) = tx.split();
    let mut send = SendState::new(body_writer);
    let mut exchange = Exchange::new(req, &body_writer, expect_100);
    let mut inbuf = RecvBuffer::new();

    send_prelude(&mut send, req, &mut wh, cfg)?;

    if exchange.can_keep_await_100() {
        rh.set_read_timeout(Some(cfg.deadline.cap(cfg.expect_timeout)))?;
        while exchange.can_keep_await_100() {
            match inbuf.fill(&mut rh) {
                Ok(0) => break,
                Ok(_) => {
                    let n = exchange.try_read_100(inbuf.data())?;
                    if n > 0 {
                        inbuf.consume(n);
                        break;
                    }
                }
                Err(e) if is_timeout(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }
    }

    rh.set_read_timeout(cfg.effective_read_timeout())?;

    let mut stream = Stream {
        send,
        exchange,
        rh,
        wh,
        inbuf,
        head: None,
        reader: None,
        body_read_started: false,
        verbose: cfg.verbose,
    };

    // A provided body is sent before the callback runs; the callback can
    // then append more bytes or go straight to reading.
    if !body.is_empty() {
        let mut source = body.to_source();
        let mut chunk = vec![0u8; IO_BUF];
        loop {
            let n = source.next_chunk(&mut chunk)?;
            if n == 0 {
                break;
            }
            stream.write(&chunk[..n])?;
        }
    }

    iofunction(&mut stream)?;

    // Complete what the callback left undone.
    stream.close_write()?;
    stream.ensure_head()?;

    let streamed = stream.body_read_started;
    let mut collected = Vec::new();
    let mut buf = vec![0u8; IO_BUF];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if !streamed {
            collected.extend_from_slice(&buf[..n]);
        }
    }

    let must_close = stream.exchange.must_close_connection();
    let head = stream.head.take().unwrap();
    drop(stream);

    Ok(Outcome {
        status: head.status,
        reason: head.reason,
        version: head.version,
        headers: head.headers,
        body: if streamed {
            OutBody::Streamed
        } else {
            OutBody::Buffered(Bytes::from(collected))
        },
        reuse: !must_close,
        sink_bytes: 0,
    })
}

// //////////////////////////////////////////////////////////////////////// BUFFER

/// Growable receive buffer with consumed-prefix accounting.
struct RecvBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl RecvBuffer {
    fn new() -> RecvBuffer {
        RecvBuffer {
            buf: vec![0u8; IO_BUF],
            start: 0,
            end: 0,
        }
    }

    fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    fn len(&self) -> usize {
        self.end - self.start
    }

    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The `n` most recently filled bytes.
    fn tail(&self, n: usize) -> &[u8] {
        &self.buf[self.end - n..self.end]
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        debug_assert!(self.start <= self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Read more bytes from `r` into the free tail, compacting or growing
    /// first when needed. Returns the number of new bytes (0 = EOF).
    fn fill(&mut self, r: &mut ReadHalf<'_>) -> io::Result<usize> {
        if self.start > 0 && self.end == self.buf.len() {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == self.buf.len() {
            self.buf.resize(self.buf.len() * 2, 0);
        }

        let n = r.read(&mut self.buf[self.end..])?;
        self.end += n;
        Ok(n)
    }
}
