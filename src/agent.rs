//! The engine instance: configuration, connection pool and cookie jar.

use std::sync::{Arc, OnceLock};

use http::{HeaderMap, HeaderName, HeaderValue, Method};

use crate::body::Body;
use crate::cookie::CookieJar;
use crate::error::Error;
use crate::layer::{build_stack, Call, IoFunction, Next};
use crate::options::{AgentConfig, RequestOptions};
use crate::pool::{Pool, PoolLimits};
use crate::response::Response;
use crate::stream::Stream;
use crate::util::Deadline;

/// An HTTP/1.1 request execution engine.
///
/// An agent owns a connection pool and a cookie jar, shared by every call
/// made through it. Agents are cheap to clone and safe to use from many
/// threads at once.
///
/// Most callers can use the process-wide default agent through the free
/// [`request`] and [`open`] functions.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

pub(crate) struct AgentInner {
    pub config: AgentConfig,
    pub pool: Pool,
    pub jar: Arc<CookieJar>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Agent {
        let pool = Pool::new(PoolLimits {
            connection_limit: config.connection_limit,
            connection_limit_per_host: config.connection_limit_per_host,
            idle_timeout: config.idle_timeout,
            max_requests_per_connection: config.max_requests_per_connection,
        });

        Agent {
            inner: Arc::new(AgentInner {
                config,
                pool,
                jar: Arc::new(CookieJar::new()),
            }),
        }
    }

    /// Execute a request through the layer stack configured by `opts`.
    ///
    /// ```no_run
    /// use reqflow::{Agent, AgentConfig, RequestOptions};
    /// use reqflow::http::Method;
    ///
    /// # fn main() -> Result<(), reqflow::Error> {
    /// let agent = Agent::new(AgentConfig::default());
    /// let response = agent.request(
    ///     Method::GET,
    ///     "http://example.test/data",
    ///     &[("accept", "application/json")],
    ///     (),
    ///     RequestOptions::default(),
    /// )?;
    /// assert_eq!(response.status(), 200);
    /// # Ok(()) }
    /// ```
    pub fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: impl Into<Body>,
        opts: RequestOptions,
    ) -> Result<Response, Error> {
        self.do_call(method, url, headers, body.into(), opts, None)
    }

    /// Like [`Agent::request`], but hands the raw [`Stream`] to
    /// `iofunction` instead of running the internal reader and writer:
    /// the callback writes body bytes and reads the response directly.
    pub fn open<F>(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        opts: RequestOptions,
        mut iofunction: F,
    ) -> Result<Response, Error>
    where
        F: FnMut(&mut Stream<'_>) -> Result<(), Error> + Send,
    {
        let f: &mut IoFunction<'_> = &mut iofunction;
        self.do_call(method, url, headers, Body::Empty, opts, Some(f))
    }

    /// The agent's shared cookie jar.
    pub fn cookie_jar(&self) -> Arc<CookieJar> {
        self.inner.jar.clone()
    }

    /// Close every idle pooled connection. In-flight requests finish
    /// normally. Intended for teardown in tests.
    pub fn close_all(&self) {
        self.inner.pool.close_all();
    }

    fn do_call<'c>(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Body,
        mut opts: RequestOptions,
        iofunction: Option<&'c mut IoFunction<'c>>,
    ) -> Result<Response, Error> {
        let uri: http::Uri = url
            .parse()
            .map_err(|e| Error::Argument(format!("invalid url {:?}: {}", url, e)))?;
        // Fails early on relative URLs and unsupported schemes.
        crate::transport::HostKey::from_uri(&uri)?;

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::try_from(*name)
                .map_err(|e| Error::Argument(format!("bad header name {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Argument(format!("bad header value: {}", e)))?;
            header_map.append(name, value);
        }

        let stack = build_stack(&opts, &uri, &self.inner)?;
        let deadline = Deadline::after(opts.total_timeout);
        let sink = opts.response_stream.take();

        let mut call = Call {
            method,
            uri,
            headers: header_map,
            body,
            opts,
            sink,
            sink_touched: false,
            history: None,
            deadline,
            canonicalize: false,
            iofunction,
        };

        Next::new(&stack, &self.inner).run(&mut call)
    }
}

impl Default for Agent {
    fn default() -> Self {
        Agent::new(AgentConfig::default())
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Agent({:?})", self.inner.config)
    }
}

fn default_agent() -> &'static Agent {
    static DEFAULT: OnceLock<Agent> = OnceLock::new();
    DEFAULT.get_or_init(Agent::default)
}

/// Execute a request on the process-wide default agent.
pub fn request(
    method: Method,
    url: &str,
    headers: &[(&str, &str)],
    body: impl Into<Body>,
    opts: RequestOptions,
) -> Result<Response, Error> {
    default_agent().request(method, url, headers, body, opts)
}

/// Raw-stream variant of [`request`] on the default agent.
pub fn open<F>(
    method: Method,
    url: &str,
    headers: &[(&str, &str)],
    opts: RequestOptions,
    iofunction: F,
) -> Result<Response, Error>
where
    F: FnMut(&mut Stream<'_>) -> Result<(), Error> + Send,
{
    default_agent().open(method, url, headers, opts, iofunction)
}

/// Tear down the default agent's idle connections.
pub fn close_all() {
    default_agent().close_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_inputs_before_io() {
        let agent = Agent::default();

        let r = agent.request(
            Method::GET,
            "not a url",
            &[],
            (),
            RequestOptions::default(),
        );
        assert!(matches!(r, Err(Error::Argument(_))));

        let r = agent.request(
            Method::GET,
            "ftp://h.test/x",
            &[],
            (),
            RequestOptions::default(),
        );
        assert!(matches!(r, Err(Error::Argument(_))));

        let r = agent.request(
            Method::GET,
            "http://h.test/x",
            &[("bad header\0", "v")],
            (),
            RequestOptions::default(),
        );
        assert!(matches!(r, Err(Error::Argument(_))));

        let r = agent.request(
            Method::GET,
            "http://h.test/x",
            &[],
            (),
            RequestOptions {
                aws_authorization: true,
                ..RequestOptions::default()
            },
        );
        assert!(matches!(r, Err(Error::Argument(_))));
    }
}
