//! Per-call and per-agent configuration.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::cookie::CookieJar;
use crate::sigv4::AwsCredentials;

/// The per-call configuration, deciding which layers are active and with
/// what parameters. Built once per call; immutable thereafter.
///
/// Defaults follow the engine's documented behavior: redirects on (limit
/// 3), retry on (4 attempts after the first), status exception on,
/// everything else off.
///
/// ```no_run
/// use reqflow::RequestOptions;
///
/// let opts = RequestOptions {
///     retries: 2,
///     readtimeout: std::time::Duration::from_secs(5),
///     ..RequestOptions::default()
/// };
/// ```
pub struct RequestOptions {
    /// Follow 3xx redirects.
    pub redirect: bool,
    /// Max redirects to follow before failing.
    pub redirect_limit: usize,
    /// Carry caller headers over to redirect targets.
    pub forwardheaders: bool,
    /// Inject `authorization: Basic …` from URL userinfo.
    pub basic_authorization: bool,
    /// Sign the request with AWS Signature V4. Requires `aws_credentials`.
    pub aws_authorization: bool,
    /// Credentials for `aws_authorization`.
    pub aws_credentials: Option<AwsCredentials>,
    /// Cookie handling for this call.
    pub cookies: Cookies,
    /// Emit outgoing header names in `Canonical-Kebab` casing.
    pub canonicalize_headers: bool,
    /// Re-issue the request on recoverable failures.
    pub retry: bool,
    /// Max retry attempts after the first try. 0 disables retry.
    pub retries: u32,
    /// Retry non-idempotent methods (POST, PATCH) too.
    pub retry_non_idempotent: bool,
    /// Turn 4xx/5xx responses into [`Error::Status`][crate::Error::Status].
    pub status_exception: bool,
    /// Fail the call when no response byte arrives for this long.
    /// Zero disables the read timeout.
    pub readtimeout: Duration,
    /// Deadline for acquiring a connection (including DNS/connect/TLS).
    pub connect_timeout: Duration,
    /// Wall-clock budget for the whole call, all retries included.
    pub total_timeout: Option<Duration>,
    /// How long to wait for `100 Continue` before sending the body anyway.
    pub expect_timeout: Duration,
    /// Sniff the body and set `content-type` when absent.
    pub detect_content_type: bool,
    /// Stream the response body into this sink instead of buffering it.
    pub response_stream: Option<Box<dyn io::Write + Send>>,
    /// Wire logging verbosity, 0–3.
    pub verbose: u8,
    /// Verify TLS certificates (on by default).
    pub require_ssl_verification: bool,
    /// Send `connection: close` and do not pool the connection.
    pub connection_close: bool,
    /// Cooperative cancellation handle.
    pub cancel: Option<CancelToken>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            redirect: true,
            redirect_limit: 3,
            forwardheaders: false,
            basic_authorization: false,
            aws_authorization: false,
            aws_credentials: None,
            cookies: Cookies::Off,
            canonicalize_headers: false,
            retry: true,
            retries: 4,
            retry_non_idempotent: false,
            status_exception: true,
            readtimeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            total_timeout: None,
            expect_timeout: Duration::from_secs(1),
            detect_content_type: false,
            response_stream: None,
            verbose: 0,
            require_ssl_verification: true,
            connection_close: false,
            cancel: None,
        }
    }
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("redirect", &self.redirect)
            .field("redirect_limit", &self.redirect_limit)
            .field("retry", &self.retry)
            .field("retries", &self.retries)
            .field("status_exception", &self.status_exception)
            .field("readtimeout", &self.readtimeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

/// Cookie handling for a single call.
#[derive(Default)]
pub enum Cookies {
    /// No cookie layer.
    #[default]
    Off,
    /// Use the agent's shared jar.
    Shared,
    /// Use a caller-provided jar.
    Jar(Arc<CookieJar>),
    /// Seed an ad-hoc jar with these name/value pairs. The jar lives for
    /// the duration of the call (it keeps learning across redirect hops).
    Set(Vec<(String, String)>),
}

impl From<bool> for Cookies {
    fn from(v: bool) -> Self {
        if v {
            Cookies::Shared
        } else {
            Cookies::Off
        }
    }
}

impl std::fmt::Debug for Cookies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cookies::Off => write!(f, "Cookies::Off"),
            Cookies::Shared => write!(f, "Cookies::Shared"),
            Cookies::Jar(_) => write!(f, "Cookies::Jar"),
            Cookies::Set(v) => write!(f, "Cookies::Set({} cookies)", v.len()),
        }
    }
}

/// Engine-level configuration, shared by every call on an
/// [`Agent`][crate::Agent].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Total connections across all hosts.
    pub connection_limit: usize,
    /// Connections per (scheme, host, port).
    pub connection_limit_per_host: usize,
    /// Idle connections older than this are closed by the sweeper.
    pub idle_timeout: Duration,
    /// Max requests served by one connection before it is closed.
    pub max_requests_per_connection: u64,
    /// The `user-agent` header set when the caller provides none.
    pub user_agent: String,
    /// First retry backoff delay.
    pub backoff_base: Duration,
    /// Multiplier between consecutive backoff delays.
    pub backoff_factor: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            connection_limit: 64,
            connection_limit_per_host: 8,
            idle_timeout: Duration::from_secs(30),
            max_requests_per_connection: 1000,
            user_agent: concat!("reqflow/", env!("CARGO_PKG_VERSION")).to_string(),
            backoff_base: Duration::from_secs(1),
            backoff_factor: 10,
        }
    }
}
