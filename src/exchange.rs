//! The sans-IO state machine for one request/response exchange.
//!
//! [`SendState`] serializes the request prelude and frames the body into
//! borrowed buffers; [`Exchange`] interprets server bytes (the 100
//! Continue mechanic, the response prelude, body framing) and accumulates
//! the reasons the connection must close afterwards. Neither touches a
//! socket: the stream driver moves the bytes.
//!
//! The phases match the HTTP/1.1 request lifecycle:
//!
//! ```text
//! write: SendLine ──▶ SendHeaders ──▶ SendTerminator ──▶ SendBody
//! read:  (await 100) ──▶ response prelude ──▶ response body
//! ```
//!
//! The read side may not produce a body reader before the prelude is
//! parsed, and the framing is fixed once it is.

use std::io::Write as _;

use http::{header, HeaderName, HeaderValue, Method, Response, StatusCode, Version};
use log::debug;

use crate::body::{BodyReader, BodyWriter};
use crate::error::{Error, ParseError};
use crate::ext::HeaderIterExt;
use crate::parser::{try_parse_response, MAX_RESPONSE_HEADERS};
use crate::util::{canonical_name, Writer};

/// A request as it goes on the wire: origin-form target, finalized
/// headers in send order.
#[derive(Debug)]
pub(crate) struct WireRequest {
    pub method: Method,
    /// Origin-form target: path + query, no userinfo, no authority.
    pub target: String,
    pub version: Version,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    /// Emit header names in `Canonical-Kebab` casing.
    pub canonicalize: bool,
}

/// Reasons an exchange forbids reusing its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// HTTP/1.0 without an explicit keep-alive.
    Http10,

    /// Client sent `connection: close`.
    ClientConnectionClose,

    /// Server sent `connection: close`.
    ServerConnectionClose,

    /// When doing expect-100 the server sent _some other response_.
    ///
    /// The server either answers `100 Continue` or stays silent until we
    /// send the body anyway. Answering something else means the request
    /// body was never transmitted, so the connection is desynced and must
    /// close.
    Not100Continue,

    /// Response body is close delimited: the socket closing is what ends
    /// the body.
    CloseDelimitedBody,
}

impl CloseReason {
    fn explain(&self) -> &'static str {
        match self {
            CloseReason::Http10 => "version is http1.0",
            CloseReason::ClientConnectionClose => "client sent Connection: close",
            CloseReason::ServerConnectionClose => "server sent Connection: close",
            CloseReason::Not100Continue => "got non-100 response before sending body",
            CloseReason::CloseDelimitedBody => "response body is close delimited",
        }
    }
}

// //////////////////////////////////////////////////////////////////////// SEND

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPhase {
    SendLine,
    SendHeaders(usize),
    SendTerminator,
    SendBody,
}

/// Serializes the request: first row, headers, then framed body bytes.
///
/// Writing is incremental: every call emits as many whole rows as fit the
/// output buffer. The send state is independent of the receive side so
/// the driver can move it into the writer task.
#[derive(Debug)]
pub(crate) struct SendState {
    phase: SendPhase,
    writer: BodyWriter,
}

impl SendState {
    pub fn new(writer: BodyWriter) -> SendState {
        SendState {
            phase: SendPhase::SendLine,
            writer,
        }
    }

    /// Write the request line and headers into `output`.
    ///
    /// Returns the number of output bytes used. Call repeatedly until
    /// [`SendState::prelude_sent`]; each call needs room for at least the
    /// longest remaining row or the result is [`Error::OutputOverflow`].
    pub fn write_prelude(&mut self, req: &WireRequest, output: &mut [u8]) -> Result<usize, Error> {
        let mut w = Writer::new(output);

        loop {
            let progressed = match self.phase {
                SendPhase::SendLine => {
                    let ok = w.try_write(|w| {
                        write!(w, "{} {} {:?}\r\n", req.method, req.target, req.version)
                    });
                    if ok {
                        self.phase = SendPhase::SendHeaders(0);
                    }
                    ok
                }

                SendPhase::SendHeaders(index) => {
                    let mut i = index;
                    for (name, value) in &req.headers[index..] {
                        let ok = w.try_write(|w| {
                            if req.canonicalize {
                                write!(w, "{}: ", canonical_name(name.as_str()))?;
                            } else {
                                write!(w, "{}: ", name)?;
                            }
                            w.write_all(value.as_bytes())?;
                            write!(w, "\r\n")
                        });
                        if !ok {
                            break;
                        }
                        i += 1;
                    }

                    let progressed = i > index;
                    if i == req.headers.len() {
                        self.phase = SendPhase::SendTerminator;
                    } else {
                        self.phase = SendPhase::SendHeaders(i);
                    }
                    progressed || self.phase == SendPhase::SendTerminator
                }

                SendPhase::SendTerminator => {
                    let ok = w.try_write(|w| write!(w, "\r\n"));
                    if ok {
                        self.phase = SendPhase::SendBody;
                    }
                    ok
                }

                SendPhase::SendBody => break,
            };

            if !progressed {
                break;
            }
        }

        if w.len() == 0 && self.phase != SendPhase::SendBody {
            return Err(Error::OutputOverflow);
        }

        Ok(w.len())
    }

    /// Whether the full prelude (line + headers + blank line) is out.
    pub fn prelude_sent(&self) -> bool {
        self.phase == SendPhase::SendBody
    }

    /// Frame body bytes from `input` into `output`.
    ///
    /// The result is `(input consumed, output used)`. An empty `input`
    /// marks the end of the body, which for chunked framing emits the
    /// terminator. Writing after the end or past a declared
    /// `content-length` is an error.
    pub fn write_body(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize), Error> {
        debug_assert!(self.prelude_sent());

        if !input.is_empty() && self.writer.is_ended() {
            return Err(Error::BodyContentAfterFinish);
        }

        if let Some(left) = self.writer.left_to_send() {
            if input.len() as u64 > left {
                return Err(Error::BodyLargerThanContentLength);
            }
        }

        let mut w = Writer::new(output);
        let input_used = self.writer.write(input, &mut w);
        Ok((input_used, w.len()))
    }

    pub fn body_ended(&self) -> bool {
        self.writer.is_ended()
    }
}

// //////////////////////////////////////////////////////////////////////// RECEIVE

/// The receive side and connection verdict of one exchange.
pub(crate) struct Exchange {
    method: Method,
    close_reason: Vec<CloseReason>,
    await_100: bool,
    should_send_body: bool,
    reader: Option<BodyReader>,
}

impl Exchange {
    pub fn new(req: &WireRequest, body_writer: &BodyWriter, await_100: bool) -> Exchange {
        let mut close_reason = Vec::new();

        if req.version == Version::HTTP_10 {
            close_reason.push(CloseReason::Http10);
        }
        if req.headers.iter().map(|(k, v)| (k, v)).has(header::CONNECTION, "close") {
            close_reason.push(CloseReason::ClientConnectionClose);
        }

        Exchange {
            method: req.method.clone(),
            close_reason,
            await_100,
            should_send_body: body_writer.has_body(),
            reader: None,
        }
    }

    /// Whether the body should (still) be sent. Becomes `false` when the
    /// server answers the expect-100 with a final response.
    pub fn should_send_body(&self) -> bool {
        self.should_send_body
    }

    /// Whether waiting for a `100 Continue` still makes sense.
    pub fn can_keep_await_100(&self) -> bool {
        self.await_100
    }

    /// Interpret server bytes while awaiting `100 Continue`.
    ///
    /// * `Ok(n)` with `n > 0`: a `100 Continue` arrived and was consumed.
    /// * `Ok(0)`: nothing conclusive yet, or a non-100 answer. In the
    ///   latter case [`Exchange::should_send_body`] flips to `false`, the
    ///   bytes are left unconsumed for response parsing and the
    ///   connection is marked for close.
    pub fn try_read_100(&mut self, input: &[u8]) -> Result<usize, Error> {
        match try_parse_response::<0>(input) {
            Ok(Some((n, response))) => {
                self.await_100 = false;

                if response.status() == StatusCode::CONTINUE {
                    Ok(n)
                } else {
                    // A non-100 answer to expect-100. The body will never
                    // be sent, so the connection must close afterwards.
                    self.close_reason.push(CloseReason::Not100Continue);
                    self.should_send_body = false;
                    Ok(0)
                }
            }
            Ok(None) => Ok(0),
            Err(ParseError::TooManyHeaders) => {
                // Headers after the status line: the server skipped the
                // 100 and produced a full response before seeing a body.
                self.await_100 = false;
                self.close_reason.push(CloseReason::Not100Continue);
                self.should_send_body = false;
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Try to parse the response prelude from `input`.
    ///
    /// Returns `(input consumed, response)`; the response is `None` while
    /// input is incomplete. A delayed `100 Continue` (one that arrived
    /// after the await phase moved on) is consumed and skipped.
    pub fn try_response(
        &mut self,
        input: &[u8],
    ) -> Result<(usize, Option<Response<()>>), Error> {
        let (input_used, response) = match try_parse_response::<MAX_RESPONSE_HEADERS>(input)? {
            Some(v) => v,
            None => return Ok((0, None)),
        };

        if response.status() == StatusCode::CONTINUE {
            if !response.headers().is_empty() {
                return Err(ParseError::HeadersWith100.into());
            }
            if self.await_100 {
                debug!("discarding delayed 100-continue");
                self.await_100 = false;
            }
            return Ok((input_used, None));
        }

        let headers = response.headers();
        if headers.iter().has(header::CONNECTION, "close") {
            self.close_reason.push(CloseReason::ServerConnectionClose);
        }
        if response.version() == Version::HTTP_10
            && !headers.iter().has(header::CONNECTION, "keep-alive")
        {
            self.close_reason.push(CloseReason::Http10);
        }

        let reader =
            BodyReader::for_response(&self.method, response.status().as_u16(), headers)?;
        if reader.is_close_delimited() {
            self.close_reason.push(CloseReason::CloseDelimitedBody);
        }
        self.reader = Some(reader);

        Ok((input_used, Some(response)))
    }

    /// The body framing decided by the prelude. Panics before
    /// [`Exchange::try_response`] succeeds; the phase order guarantees the
    /// driver never does that.
    pub fn take_body_reader(&mut self) -> BodyReader {
        self.reader.take().unwrap()
    }

    /// Tell if we must close the connection after this exchange.
    pub fn must_close_connection(&self) -> bool {
        self.close_reason().is_some()
    }

    /// If we are closing the connection, give a reason.
    pub fn close_reason(&self) -> Option<&'static str> {
        self.close_reason.first().map(|s| s.explain())
    }
}
