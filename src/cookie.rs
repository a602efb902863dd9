//! In-memory cookie jar.
//!
//! The jar is keyed `(domain, path, name)` and guarded by its own mutex,
//! so it can be shared between an agent and its callers. `Set-Cookie`
//! parsing and attribute handling is delegated to the `cookie` crate;
//! matching and storage policy live here.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use cookie::Cookie;
use http::uri::Scheme;
use http::{HeaderValue, Uri};
use log::debug;

/// A thread-safe in-memory cookie jar.
///
/// There is no persistence: the jar lives and dies with the process. An
/// agent owns a shared jar; callers can also provide their own via
/// [`Cookies::Jar`][crate::Cookies::Jar].
#[derive(Default)]
pub struct CookieJar {
    cookies: Mutex<HashMap<JarKey, Stored>>,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct JarKey {
    domain: String,
    path: String,
    name: String,
}

#[derive(Debug, Clone)]
struct Stored {
    value: String,
    secure: bool,
    host_only: bool,
    expires: Option<SystemTime>,
}

impl CookieJar {
    pub fn new() -> CookieJar {
        CookieJar::default()
    }

    /// Add a session cookie for a host, as if the host had set it with
    /// default attributes.
    pub fn insert(&self, host: &str, name: &str, value: &str) {
        let key = JarKey {
            domain: host.to_ascii_lowercase(),
            path: "/".to_string(),
            name: name.to_string(),
        };
        let stored = Stored {
            value: value.to_string(),
            secure: false,
            host_only: true,
            expires: None,
        };
        self.cookies.lock().unwrap().insert(key, stored);
    }

    /// Learn one `Set-Cookie` header received for `uri`.
    ///
    /// Unparseable headers are ignored. A cookie whose `Domain` attribute
    /// does not cover the request host is rejected. An expired cookie
    /// removes any stored one with the same key.
    pub(crate) fn learn(&self, uri: &Uri, header: &HeaderValue) {
        let Ok(raw) = header.to_str() else {
            debug!("ignoring non-utf8 set-cookie");
            return;
        };
        let Ok(c) = Cookie::parse(raw) else {
            debug!("ignoring unparseable set-cookie: {}", raw);
            return;
        };
        let Some(host) = uri.host() else {
            return;
        };
        let host = host.to_ascii_lowercase();

        let (domain, host_only) = match c.domain() {
            Some(d) => {
                let d = d.trim_start_matches('.').to_ascii_lowercase();
                if !domain_match(&host, &d) {
                    debug!("rejecting cookie for foreign domain {}", d);
                    return;
                }
                (d, false)
            }
            None => (host, true),
        };

        let path = match c.path() {
            Some(p) if p.starts_with('/') => p.to_string(),
            _ => default_path(uri.path()),
        };

        let expires = cookie_expiry(&c);
        let expired = expires.is_some_and(|t| t <= SystemTime::now());

        let key = JarKey {
            domain,
            path,
            name: c.name().to_string(),
        };

        let mut cookies = self.cookies.lock().unwrap();
        if expired {
            cookies.remove(&key);
        } else {
            let stored = Stored {
                value: c.value().to_string(),
                secure: c.secure().unwrap_or(false),
                host_only,
                expires,
            };
            cookies.insert(key, stored);
        }
    }

    /// Assemble the `cookie` header value for a request to `uri`.
    ///
    /// Matching cookies are ordered longest path first, name second, per
    /// the usual serialization convention. Returns `None` when nothing
    /// matches.
    pub(crate) fn header_for(&self, uri: &Uri) -> Option<String> {
        let host = uri.host()?.to_ascii_lowercase();
        let path = uri.path();
        let https = uri.scheme() == Some(&Scheme::HTTPS);
        let now = SystemTime::now();

        let mut cookies = self.cookies.lock().unwrap();

        // Drop expired entries as we pass them.
        cookies.retain(|_, s| !s.expires.is_some_and(|t| t <= now));

        let mut matched: Vec<(&JarKey, &Stored)> = cookies
            .iter()
            .filter(|(k, s)| {
                let domain_ok = if s.host_only {
                    host == k.domain
                } else {
                    domain_match(&host, &k.domain)
                };
                domain_ok && path_match(path, &k.path) && (https || !s.secure)
            })
            .collect();

        if matched.is_empty() {
            return None;
        }

        matched.sort_by(|a, b| {
            b.0.path
                .len()
                .cmp(&a.0.path.len())
                .then_with(|| a.0.name.cmp(&b.0.name))
        });

        Some(
            matched
                .iter()
                .map(|(k, s)| format!("{}={}", k.name, s.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Remove every cookie.
    pub fn clear(&self) {
        self.cookies.lock().unwrap().clear();
    }

    /// Number of stored cookies (expired ones included until touched).
    pub fn len(&self) -> usize {
        self.cookies.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CookieJar({} cookies)", self.len())
    }
}

/// RFC 6265 domain matching: the host equals the domain, or the domain is
/// a dot-boundary suffix of the host.
fn domain_match(host: &str, domain: &str) -> bool {
    host == domain || (host.len() > domain.len() && host.ends_with(domain) && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

/// RFC 6265 path matching.
fn path_match(request_path: &str, cookie_path: &str) -> bool {
    let request_path = if request_path.is_empty() {
        "/"
    } else {
        request_path
    };

    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/')))
}

/// RFC 6265 default path: the request path up to the rightmost `/`.
fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_string();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => request_path[..i].to_string(),
    }
}

/// `Max-Age` wins over `Expires`.
fn cookie_expiry(c: &Cookie) -> Option<SystemTime> {
    if let Some(max_age) = c.max_age() {
        let secs = max_age.whole_seconds();
        return Some(if secs <= 0 {
            SystemTime::UNIX_EPOCH
        } else {
            SystemTime::now() + Duration::from_secs(secs as u64)
        });
    }
    c.expires_datetime().map(SystemTime::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    fn hv(s: &str) -> HeaderValue {
        HeaderValue::from_str(s).unwrap()
    }

    #[test]
    fn learns_and_sends_back() {
        let jar = CookieJar::new();
        jar.learn(&uri("http://h.test/a"), &hv("sid=abc123"));

        assert_eq!(jar.header_for(&uri("http://h.test/a")), Some("sid=abc123".into()));
        assert_eq!(jar.header_for(&uri("http://h.test/other")), Some("sid=abc123".into()));
        // Host-only: a sibling host never sees it.
        assert_eq!(jar.header_for(&uri("http://x.h.test/a")), None);
        assert_eq!(jar.header_for(&uri("http://other.test/a")), None);
    }

    #[test]
    fn domain_cookie_covers_subdomains() {
        let jar = CookieJar::new();
        jar.learn(&uri("http://h.test/"), &hv("sid=1; Domain=h.test"));

        assert!(jar.header_for(&uri("http://h.test/")).is_some());
        assert!(jar.header_for(&uri("http://sub.h.test/")).is_some());
        assert!(jar.header_for(&uri("http://nothtest.test/")).is_none());
        // Suffix without a dot boundary must not match.
        assert!(jar.header_for(&uri("http://xh.test/")).is_none());
    }

    #[test]
    fn foreign_domain_rejected() {
        let jar = CookieJar::new();
        jar.learn(&uri("http://h.test/"), &hv("sid=1; Domain=evil.test"));
        assert!(jar.is_empty());
    }

    #[test]
    fn path_matching() {
        let jar = CookieJar::new();
        jar.learn(&uri("http://h.test/docs/index"), &hv("a=1"));

        // Default path is /docs.
        assert!(jar.header_for(&uri("http://h.test/docs")).is_some());
        assert!(jar.header_for(&uri("http://h.test/docs/page")).is_some());
        assert!(jar.header_for(&uri("http://h.test/")).is_none());
        assert!(jar.header_for(&uri("http://h.test/docsx")).is_none());
    }

    #[test]
    fn secure_only_on_https() {
        let jar = CookieJar::new();
        jar.learn(&uri("https://h.test/"), &hv("s=1; Secure"));

        assert!(jar.header_for(&uri("http://h.test/")).is_none());
        assert_eq!(jar.header_for(&uri("https://h.test/")), Some("s=1".into()));
    }

    #[test]
    fn max_age_zero_removes() {
        let jar = CookieJar::new();
        jar.learn(&uri("http://h.test/"), &hv("sid=1"));
        assert_eq!(jar.len(), 1);

        jar.learn(&uri("http://h.test/"), &hv("sid=gone; Max-Age=0"));
        assert!(jar.header_for(&uri("http://h.test/")).is_none());
    }

    #[test]
    fn longest_path_first() {
        let jar = CookieJar::new();
        jar.learn(&uri("http://h.test/"), &hv("outer=1; Path=/"));
        jar.learn(&uri("http://h.test/"), &hv("inner=2; Path=/deep/path"));

        assert_eq!(
            jar.header_for(&uri("http://h.test/deep/path/x")),
            Some("inner=2; outer=1".into())
        );
    }

    #[test]
    fn overwrite_same_key() {
        let jar = CookieJar::new();
        jar.learn(&uri("http://h.test/"), &hv("sid=old"));
        jar.learn(&uri("http://h.test/"), &hv("sid=new"));
        assert_eq!(jar.header_for(&uri("http://h.test/")), Some("sid=new".into()));
        assert_eq!(jar.len(), 1);
    }
}
