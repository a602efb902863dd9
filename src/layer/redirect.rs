//! Follow 3xx redirects within a limit.

use http::{header, Method, StatusCode, Uri};
use log::debug;

use crate::body::Body;
use crate::error::Error;
use crate::ext::StatusExt;
use crate::layer::{Call, Layer, Next};
use crate::response::Response;

pub(crate) struct RedirectLayer {
    pub limit: usize,
    pub forwardheaders: bool,
}

impl Layer for RedirectLayer {
    fn handle(&self, call: &mut Call<'_>, next: Next<'_>) -> Result<Response, Error> {
        // The caller's headers, before any lower layer added to them.
        // Every hop starts over from this set.
        let base_headers = call.headers.clone();
        let mut visited = vec![call.uri.clone()];

        loop {
            let response = next.run(call)?;
            let status = response.status();

            if !status.is_followable_redirect() {
                return Ok(response);
            }

            let Some(location) = response.header("location").map(str::to_string) else {
                // A redirect without a target is returned as-is.
                return Ok(response);
            };

            if visited.len() > self.limit {
                let mut history = visited;
                history.dedup();
                return Err(Error::TooManyRedirects { history });
            }

            let target = resolve_location(&call.uri, &location)?;
            debug!("following {} to {}", status, target);

            // 303 rewrites to a bodyless GET (HEAD stays HEAD); 301, 302,
            // 307 and 308 preserve method and body. A body that has
            // already been streamed away cannot be replayed.
            if status == StatusCode::SEE_OTHER {
                if call.method != Method::HEAD {
                    call.method = Method::GET;
                }
                call.body = Body::Empty;
            } else if !call.body.is_replayable() {
                debug!("not following {}: request body already streamed", status);
                return Ok(response);
            }

            let cross_origin = !same_origin(&call.uri, &target);

            let mut headers = if self.forwardheaders {
                base_headers.clone()
            } else {
                http::HeaderMap::new()
            };
            // Hop-specific headers are recomputed by the message layer.
            headers.remove(header::HOST);
            headers.remove(header::CONTENT_LENGTH);
            headers.remove(header::TRANSFER_ENCODING);
            if cross_origin {
                // Never leak credentials to another origin.
                headers.remove(header::AUTHORIZATION);
                headers.remove(header::COOKIE);
                headers.remove(header::PROXY_AUTHORIZATION);
            }
            call.headers = headers;

            call.history = Some(Box::new(response.take_request()));
            call.uri = target.clone();
            visited.push(target);
        }
    }
}

fn same_origin(a: &Uri, b: &Uri) -> bool {
    use crate::transport::HostKey;
    match (HostKey::from_uri(a), HostKey::from_uri(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Resolve a `Location` header against the current URI (RFC 3986 §5).
pub(crate) fn resolve_location(base: &Uri, location: &str) -> Result<Uri, Error> {
    let bad = |l: &str| Error::Argument(format!("bad location header: {}", l));

    if location.is_empty() {
        return Err(bad(location));
    }

    // Absolute URI with its own scheme.
    if let Ok(uri) = location.parse::<Uri>() {
        if uri.scheme().is_some() {
            return Ok(uri);
        }
    }

    let scheme = base.scheme_str().ok_or_else(|| bad(location))?;
    let authority = base.authority().ok_or_else(|| bad(location))?.as_str();

    let combined = if let Some(rest) = location.strip_prefix("//") {
        // Protocol-relative: keep the scheme only.
        format!("{}://{}", scheme, rest)
    } else if location.starts_with('/') {
        format!("{}://{}{}", scheme, authority, location)
    } else {
        // Relative path: resolve against the base path's directory.
        let base_path = base.path();
        let dir = match base_path.rfind('/') {
            Some(i) => &base_path[..=i],
            None => "/",
        };
        format!("{}://{}{}{}", scheme, authority, dir, location)
    };

    combined.parse::<Uri>().map_err(|_| bad(location))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn resolve_absolute() {
        let u = resolve_location(&base("http://a.test/x"), "https://b.test/y").unwrap();
        assert_eq!(u.to_string(), "https://b.test/y");
    }

    #[test]
    fn resolve_absolute_path() {
        let u = resolve_location(&base("http://a.test/x/y?q=1"), "/z").unwrap();
        assert_eq!(u.to_string(), "http://a.test/z");
    }

    #[test]
    fn resolve_relative_path() {
        let u = resolve_location(&base("http://a.test/dir/page"), "other").unwrap();
        assert_eq!(u.to_string(), "http://a.test/dir/other");

        let u = resolve_location(&base("http://a.test/page"), "other?x=2").unwrap();
        assert_eq!(u.to_string(), "http://a.test/other?x=2");
    }

    #[test]
    fn resolve_protocol_relative() {
        let u = resolve_location(&base("https://a.test/x"), "//b.test/y").unwrap();
        assert_eq!(u.to_string(), "https://b.test/y");
    }

    #[test]
    fn resolve_preserves_port() {
        let u = resolve_location(&base("http://a.test:8080/x"), "/y").unwrap();
        assert_eq!(u.to_string(), "http://a.test:8080/y");
    }

    #[test]
    fn resolve_bad_location() {
        assert!(resolve_location(&base("http://a.test/x"), "").is_err());
    }

    #[test]
    fn origin_comparison() {
        assert!(same_origin(
            &base("http://a.test/x"),
            &base("http://a.test:80/y")
        ));
        assert!(!same_origin(
            &base("http://a.test/x"),
            &base("https://a.test/x")
        ));
        assert!(!same_origin(
            &base("http://a.test/x"),
            &base("http://b.test/x")
        ));
    }
}
