//! The request pipeline.
//!
//! A layer receives the call, may transform it, invokes the rest of the
//! stack, may transform the returned response, and returns it. The stack
//! is assembled per call from the options by selective inclusion, in a
//! fixed order:
//!
//! ```text
//! Redirect ─ BasicAuth ─ ContentType ─ Cookie ─ Canonicalize ─ Message
//!   ─ AWS4 ─ Retry ─ Exception ─ [terminal: pool + timeout + debug + stream]
//! ```
//!
//! The fixed order is what makes the semantics composable: Retry sits
//! above the pool so retries acquire fresh connections, Retry wraps
//! Exception so an error status escapes to the caller only once the
//! retry budget is spent, Redirect sits on top so the whole stack
//! re-executes against the new URL.

use std::io;
use std::sync::Arc;

use http::{HeaderMap, Method, Uri};

use crate::agent::AgentInner;
use crate::body::Body;
use crate::cookie::CookieJar;
use crate::error::Error;
use crate::options::{Cookies, RequestOptions};
use crate::response::{RequestRecord, Response};
use crate::stream::Stream;
use crate::util::Deadline;

mod aws4;
mod basic_auth;
mod canonical;
mod content_type;
mod cookie;
mod exception;
mod message;
mod redirect;
mod retry;
mod terminal;

/// Raw-wire callback for `open()` calls.
pub(crate) type IoFunction<'c> = dyn FnMut(&mut Stream<'_>) -> Result<(), Error> + Send + 'c;

/// The state descending through the stack. Layers mutate it in place;
/// the terminal turns it into wire bytes.
pub(crate) struct Call<'c> {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Body,
    pub opts: RequestOptions,
    /// `response_stream`, moved out of the options.
    pub sink: Option<Box<dyn io::Write + Send>>,
    /// Set once response bytes have reached the caller; blocks retries.
    pub sink_touched: bool,
    /// Chain of previous requests (redirect hops, status-retry attempts).
    pub history: Option<Box<RequestRecord>>,
    /// Total-request deadline.
    pub deadline: Deadline,
    /// Emit canonical header casing on the wire.
    pub canonicalize: bool,
    /// When set, the terminal hands the raw stream to this callback
    /// instead of running the internal reader/writer.
    pub iofunction: Option<&'c mut IoFunction<'c>>,
}

impl Call<'_> {
    /// The request as it will be recorded in the response history.
    pub fn record(&mut self) -> RequestRecord {
        RequestRecord::new(
            self.method.clone(),
            self.uri.clone(),
            self.headers.clone(),
            self.history.take(),
        )
    }
}

/// One stage of the pipeline.
pub(crate) trait Layer: Send + Sync {
    fn handle(&self, call: &mut Call<'_>, next: Next<'_>) -> Result<Response, Error>;
}

/// The tail of the stack. `Copy`, so a layer (Retry, Redirect) can invoke
/// it any number of times.
#[derive(Clone, Copy)]
pub(crate) struct Next<'a> {
    layers: &'a [Box<dyn Layer>],
    agent: &'a AgentInner,
}

impl<'a> Next<'a> {
    pub fn new(layers: &'a [Box<dyn Layer>], agent: &'a AgentInner) -> Next<'a> {
        Next { layers, agent }
    }

    /// Descend into the remaining stack; the terminal performs the I/O.
    pub fn run(self, call: &mut Call<'_>) -> Result<Response, Error> {
        match self.layers.split_first() {
            Some((layer, rest)) => layer.handle(
                call,
                Next {
                    layers: rest,
                    agent: self.agent,
                },
            ),
            None => terminal::perform(self.agent, call),
        }
    }
}

/// Assemble the stack for one call. Disabled layers are simply absent, so
/// the pipeline has no overhead for unused features.
pub(crate) fn build_stack(
    opts: &RequestOptions,
    uri: &Uri,
    agent: &AgentInner,
) -> Result<Vec<Box<dyn Layer>>, Error> {
    let mut stack: Vec<Box<dyn Layer>> = Vec::new();

    if opts.redirect {
        stack.push(Box::new(redirect::RedirectLayer {
            limit: opts.redirect_limit,
            forwardheaders: opts.forwardheaders,
        }));
    }

    if opts.basic_authorization {
        stack.push(Box::new(basic_auth::BasicAuthLayer));
    }

    if opts.detect_content_type {
        stack.push(Box::new(content_type::ContentTypeLayer));
    }

    match &opts.cookies {
        Cookies::Off => {}
        Cookies::Shared => {
            stack.push(Box::new(cookie::CookieLayer::new(agent.jar.clone())));
        }
        Cookies::Jar(jar) => {
            stack.push(Box::new(cookie::CookieLayer::new(jar.clone())));
        }
        Cookies::Set(pairs) => {
            let jar = Arc::new(CookieJar::new());
            if let Some(host) = uri.host() {
                for (name, value) in pairs {
                    jar.insert(host, name, value);
                }
            }
            stack.push(Box::new(cookie::CookieLayer::new(jar)));
        }
    }

    if opts.canonicalize_headers {
        stack.push(Box::new(canonical::CanonicalizeLayer));
    }

    stack.push(Box::new(message::MessageLayer {
        user_agent: agent.config.user_agent.clone(),
    }));

    if opts.aws_authorization {
        let creds = opts.aws_credentials.clone().ok_or_else(|| {
            Error::Argument("aws_authorization requires aws_credentials".into())
        })?;
        stack.push(Box::new(aws4::Aws4Layer { creds }));
    }

    if opts.retry && opts.retries > 0 {
        stack.push(Box::new(retry::RetryLayer {
            retries: opts.retries,
            retry_non_idempotent: opts.retry_non_idempotent,
            backoff_base: agent.config.backoff_base,
            backoff_factor: agent.config.backoff_factor,
        }));
    }

    if opts.status_exception {
        stack.push(Box::new(exception::ExceptionLayer));
    }

    Ok(stack)
}
