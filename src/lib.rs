//! Client-side HTTP/1.1 request execution engine.
//!
//! `reqflow` takes a method, URL, headers and body, runs the request
//! through a per-call pipeline of layers, leases a pooled transport
//! connection (TCP or TLS), streams the request and response bodies
//! concurrently over it, and returns a fully formed [`Response`], or a
//! classified [`Error`].
//!
//! The pipeline is assembled per call from [`RequestOptions`] in a fixed
//! order; disabled layers are simply absent:
//!
//! ```text
//!  ┌───────────────────────────────────────────────┐
//!  │ Redirect      follow 3xx within a limit       │
//!  │ BasicAuth     authorization from URL userinfo │
//!  │ ContentType   sniff body, set content-type    │
//!  │ Cookie        attach cookie, learn set-cookie │
//!  │ Canonicalize  canonical header casing         │
//!  │ Message       host, user-agent, body framing  │
//!  │ AWS4Auth      SigV4 signature                 │
//!  │ Retry         backoff on recoverable failures │
//!  │ Exception     4xx/5xx becomes Error::Status   │
//!  ├───────────────────────────────────────────────┤
//!  │ ConnectionPool  keyed keep-alive reuse        │
//!  │ Debug           wire-byte logging             │
//!  │ Timeout         idle read deadline            │
//!  │ Stream          the wire state machine        │
//!  └───────────────────────────────────────────────┘
//! ```
//!
//! Below the Message layer the call is a typed request; below the pool it
//! is a leased transaction driving concurrent upload and download on one
//! socket, so a server may reject a large upload with an early response.
//!
//! # Example
//!
//! ```no_run
//! use reqflow::{request, RequestOptions};
//! use reqflow::http::Method;
//!
//! # fn main() -> Result<(), reqflow::Error> {
//! let response = request(
//!     Method::GET,
//!     "http://example.test/a",
//!     &[],
//!     (),
//!     RequestOptions::default(),
//! )?;
//!
//! assert_eq!(response.status(), 200);
//! println!("{}", response.text()?);
//! # Ok(()) }
//! ```
//!
//! # In scope
//!
//! * HTTP/1.1 (and 1.0 responses) with keep-alive pooling
//! * transfer-encoding: chunked, both directions
//! * Redirects, basic auth, AWS SigV4, cookies, retries, timeouts
//! * `Expect: 100-continue`
//!
//! # Out of scope
//!
//! * HTTP/2 and HTTP/3
//! * Response caching and content-coding transforms
//! * Persistent cookie stores
//!
//! # The http crate
//!
//! Based on the [http crate](https://crates.io/crates/http) - a unified
//! HTTP API for Rust. It is re-exported as [`reqflow::http`](http).

pub use http;

mod agent;
mod body;
mod cancel;
mod cookie;
mod error;
mod exchange;
mod ext;
mod layer;
mod options;
mod parser;
mod pool;
mod response;
mod sigv4;
mod stream;
mod transport;
mod util;

/// Hooks for the fuzz targets. Not public API.
#[doc(hidden)]
pub mod fuzzing {
    pub use crate::body::ChunkedDecoder;
    pub use crate::parser::{try_parse_response, MAX_RESPONSE_HEADERS};
}

pub use agent::{close_all, open, request, Agent};
pub use body::Body;
pub use cancel::CancelToken;
pub use cookie::CookieJar;
pub use error::{Error, ParseError};
pub use options::{AgentConfig, Cookies, RequestOptions};
pub use response::{RequestRecord, Response, ResponseBody};
pub use sigv4::AwsCredentials;
pub use stream::Stream;
