//! Transport connections: TCP sockets, optional TLS, and the read/write
//! halves the stream driver uses from two threads at once.
//!
//! A [`Connection`] owns one socket (cloned into a read and a write
//! handle) and, for https, a rustls session behind a mutex. The TLS split
//! never holds the session lock across a blocking socket operation:
//! records are read and written through local buffers, the lock is only
//! taken for the CPU-bound record processing.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use http::uri::Scheme;
use http::Uri;
use log::{debug, trace};
use rustls::ClientConnection;
use rustls_pki_types::ServerName;

use crate::error::Error;
use crate::ext::SchemeExt;
use crate::util::Deadline;

const TLS_RECORD_BUF: usize = 16_384;

/// The pool key: origin triple (scheme, host, port).
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub(crate) struct HostKey {
    pub scheme: HostScheme,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub(crate) enum HostScheme {
    Http,
    Https,
}

impl HostKey {
    pub fn from_uri(uri: &Uri) -> Result<HostKey, Error> {
        let scheme = match uri.scheme() {
            Some(s) if *s == Scheme::HTTP => HostScheme::Http,
            Some(s) if *s == Scheme::HTTPS => HostScheme::Https,
            Some(s) => {
                return Err(Error::Argument(format!("unsupported scheme: {}", s)));
            }
            None => return Err(Error::Argument("url has no scheme".into())),
        };

        let host = uri
            .host()
            .ok_or_else(|| Error::Argument("url has no host".into()))?
            .to_ascii_lowercase();

        let default = match scheme {
            HostScheme::Http => Scheme::HTTP.default_port(),
            HostScheme::Https => Scheme::HTTPS.default_port(),
        };
        let port = uri.port_u16().or(default).unwrap_or(80);

        Ok(HostKey { scheme, host, port })
    }

    pub fn is_https(&self) -> bool {
        self.scheme == HostScheme::Https
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            HostScheme::Http => "http",
            HostScheme::Https => "https",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// A live transport binding to one origin.
pub(crate) struct Connection {
    key: HostKey,
    read_sock: TcpStream,
    write_sock: TcpStream,
    tls: Option<Mutex<ClientConnection>>,
    sequence: u64,
    last_used: Instant,
    broken: bool,
}

impl Connection {
    /// Open a connection to `key`, completing DNS, TCP connect and (for
    /// https) the TLS handshake within `deadline`.
    pub fn connect(key: &HostKey, verify_tls: bool, deadline: Deadline) -> Result<Connection, Error> {
        let sock = connect_tcp(key, deadline)?;
        sock.set_nodelay(true)?;

        let tls = if key.is_https() {
            Some(Mutex::new(handshake(key, verify_tls, &sock, deadline)?))
        } else {
            None
        };

        let write_sock = sock.try_clone()?;
        debug!("connected {}", key);

        Ok(Connection {
            key: key.clone(),
            read_sock: sock,
            write_sock,
            tls,
            sequence: 0,
            last_used: Instant::now(),
            broken: false,
        })
    }

    pub fn key(&self) -> &HostKey {
        &self.key
    }

    /// Requests served over this connection.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn bump_sequence(&mut self) {
        self.sequence += 1;
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn idle_since(&self) -> Instant {
        self.last_used
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// The raw socket, for cancel registration.
    pub fn socket(&self) -> &TcpStream {
        &self.read_sock
    }

    /// Split into independently usable halves. The read half may block in
    /// one thread while the write half is used from another.
    pub fn split(&self) -> (ReadHalf<'_>, WriteHalf<'_>) {
        (
            ReadHalf {
                sock: &self.read_sock,
                tls: self.tls.as_ref(),
            },
            WriteHalf {
                sock: &self.write_sock,
                tls: self.tls.as_ref(),
            },
        )
    }

    /// Non-destructive reuse probe: an idle keep-alive connection must
    /// have nothing to read. Pending bytes or EOF mean the server closed
    /// or desynced it, so it is discarded.
    pub fn probe_healthy(&self) -> bool {
        if self.broken {
            return false;
        }
        if self.read_sock.set_nonblocking(true).is_err() {
            return false;
        }

        let mut byte = [0u8; 1];
        let healthy = match self.read_sock.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        };

        self.read_sock.set_nonblocking(false).is_ok() && healthy
    }

    /// Best-effort immediate close.
    pub fn close(self) {
        trace!("closing {}", self.key);
        let _ = self.read_sock.shutdown(Shutdown::Both);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection({}, seq: {}, broken: {})",
            self.key, self.sequence, self.broken
        )
    }
}

fn connect_tcp(key: &HostKey, deadline: Deadline) -> Result<TcpStream, Error> {
    let addrs: Vec<_> = (key.host.as_str(), key.port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "host resolved to no addresses",
        )));
    }

    let mut last_err: Option<io::Error> = None;
    for addr in addrs {
        let attempt = match deadline.remaining() {
            Some(r) if r.is_zero() => return Err(Error::ConnectTimeout),
            Some(r) => TcpStream::connect_timeout(&addr, r),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                debug!("connect {} via {} failed: {}", key, addr, e);
                last_err = Some(e);
            }
        }
    }

    let e = last_err.expect("at least one address was attempted");
    if e.kind() == io::ErrorKind::TimedOut {
        Err(Error::ConnectTimeout)
    } else {
        Err(Error::Io(e))
    }
}

fn handshake(
    key: &HostKey,
    verify_tls: bool,
    sock: &TcpStream,
    deadline: Deadline,
) -> Result<ClientConnection, Error> {
    let server_name = ServerName::try_from(key.host.clone())
        .map_err(|_| Error::Argument(format!("invalid host for tls: {}", key.host)))?;

    let mut session = ClientConnection::new(tls_config(verify_tls), server_name)
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    // The handshake happens before the halves are split, so plain blocking
    // I/O on the socket is fine here. The deadline bounds each read.
    set_read_timeout(sock, deadline.remaining())?;
    let mut io = sock;
    while session.is_handshaking() {
        session.complete_io(&mut io).map_err(|e| {
            if is_timeout(&e) {
                Error::ConnectTimeout
            } else {
                Error::Io(e)
            }
        })?;
    }
    set_read_timeout(sock, None)?;

    trace!("tls handshake complete for {}", key);
    Ok(session)
}

/// Arm a read timeout on the socket. `None` or zero disables it.
pub(crate) fn set_read_timeout(sock: &TcpStream, timeout: Option<Duration>) -> io::Result<()> {
    let timeout = timeout.filter(|t| !t.is_zero());
    sock.set_read_timeout(timeout)
}

/// Whether an I/O error is a read-timeout expiry. Unix reports
/// `WouldBlock`, windows `TimedOut`.
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn tls_config(verify: bool) -> Arc<rustls::ClientConfig> {
    static VERIFIED: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    static UNVERIFIED: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();

    if verify {
        VERIFIED
            .get_or_init(|| {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                let mut config = rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                config.alpn_protocols = vec![b"http/1.1".to_vec()];
                Arc::new(config)
            })
            .clone()
    } else {
        UNVERIFIED
            .get_or_init(|| {
                let mut config = rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerify))
                    .with_no_client_auth();
                config.alpn_protocols = vec![b"http/1.1".to_vec()];
                Arc::new(config)
            })
            .clone()
    }
}

/// Certificate verifier for `require_ssl_verification = false`.
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// The receive half of a connection.
pub(crate) struct ReadHalf<'a> {
    sock: &'a TcpStream,
    tls: Option<&'a Mutex<ClientConnection>>,
}

impl ReadHalf<'_> {
    /// Arm or disarm the read deadline. Applies to the shared socket.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        set_read_timeout(self.sock, timeout)
    }
}

impl Read for ReadHalf<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.tls {
            None => {
                let mut sock = self.sock;
                sock.read(buf)
            }
            Some(tls) => tls_read(tls, self.sock, buf),
        }
    }
}

fn tls_read(tls: &Mutex<ClientConnection>, sock: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        {
            let mut session = tls.lock().unwrap();
            match session.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No plaintext buffered; fall through to pull records.
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    // Peer closed without close_notify. HTTP framing
                    // decides whether the body was truncated.
                    return Ok(0);
                }
                Err(e) => return Err(e),
            }
        }

        // Blocking record read with the session lock released, so the
        // write half stays usable from its own thread.
        let mut raw = [0u8; TLS_RECORD_BUF];
        let mut raw_sock = sock;
        let n = raw_sock.read(&mut raw)?;
        if n == 0 {
            return Ok(0);
        }

        let mut session = tls.lock().unwrap();
        let mut cursor: &[u8] = &raw[..n];
        while !cursor.is_empty() {
            let fed = session.read_tls(&mut cursor)?;
            if fed == 0 {
                break;
            }
        }
        session
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }
}

/// The send half of a connection.
pub(crate) struct WriteHalf<'a> {
    sock: &'a TcpStream,
    tls: Option<&'a Mutex<ClientConnection>>,
}

impl WriteHalf<'_> {
    /// Half-close after the request body.
    ///
    /// Framing (content-length or the chunked terminator) already
    /// delimits the body, and a TCP FIN would make the connection
    /// unusable for keep-alive, so this only flushes; the half-closed
    /// state is bookkeeping on the stream driver's side.
    pub fn close_write(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl Write for WriteHalf<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.tls {
            None => {
                let mut sock = self.sock;
                sock.write(buf)
            }
            Some(tls) => {
                let mut out = Vec::with_capacity(buf.len() + 1024);
                let n;
                {
                    let mut session = tls.lock().unwrap();
                    n = session.writer().write(buf)?;
                    while session.wants_write() {
                        session.write_tls(&mut out)?;
                    }
                }
                // Socket send happens without the session lock.
                let mut sock = self.sock;
                sock.write_all(&out)?;
                Ok(n)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut sock = self.sock;
        sock.flush()
    }
}
