//! Finalize the request message: host, user-agent, accept, body framing.

use http::uri::Scheme;
use http::{header, HeaderValue};

use crate::error::Error;
use crate::ext::{MethodExt, SchemeExt};
use crate::layer::{Call, Layer, Next};
use crate::response::Response;

pub(crate) struct MessageLayer {
    pub user_agent: String,
}

impl Layer for MessageLayer {
    fn handle(&self, call: &mut Call<'_>, next: Next<'_>) -> Result<Response, Error> {
        if call.headers.get_all(header::HOST).iter().count() > 1 {
            return Err(Error::Argument("more than one host header".into()));
        }

        if !call.headers.contains_key(header::HOST) {
            let host = call
                .uri
                .host()
                .ok_or_else(|| Error::Argument("url has no host".into()))?;
            call.headers.insert(header::HOST, host_value(host, &call.uri)?);
        }

        if !call.headers.contains_key(header::USER_AGENT) {
            if let Ok(v) = HeaderValue::from_str(&self.user_agent) {
                call.headers.insert(header::USER_AGENT, v);
            }
        }

        if !call.headers.contains_key(header::ACCEPT) {
            call.headers
                .insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        }

        // Body framing: a known size is content-length, a streaming
        // source of unknown length is chunked. Caller-set framing headers
        // are respected.
        let has_framing = call.headers.contains_key(header::CONTENT_LENGTH)
            || call.headers.contains_key(header::TRANSFER_ENCODING);
        if !has_framing {
            match call.body.size() {
                Some(0) => {
                    if call.method.need_request_body() {
                        call.headers
                            .insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
                    }
                }
                Some(n) => {
                    call.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(n));
                }
                None => {
                    call.headers.insert(
                        header::TRANSFER_ENCODING,
                        HeaderValue::from_static("chunked"),
                    );
                }
            }
        }

        if call.opts.connection_close && !call.headers.contains_key(header::CONNECTION) {
            call.headers
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        next.run(call)
    }
}

/// Host header value, with the port appended when it differs from the
/// scheme default.
fn host_value(host: &str, uri: &http::Uri) -> Result<HeaderValue, Error> {
    let from_str =
        |s: &str| HeaderValue::from_str(s).map_err(|e| Error::Argument(format!("bad host: {}", e)));

    if let Some(port) = uri.port_u16() {
        let scheme = uri.scheme().unwrap_or(&Scheme::HTTP);
        if scheme.default_port() != Some(port) {
            // This allocates, so only when the port is non-default.
            return from_str(&format!("{}:{}", host, port));
        }
    }

    from_str(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Uri;

    #[test]
    fn host_with_default_port_is_bare() {
        let uri: Uri = "http://f.test:80/x".parse().unwrap();
        assert_eq!(host_value("f.test", &uri).unwrap(), "f.test");

        let uri: Uri = "https://f.test:443/x".parse().unwrap();
        assert_eq!(host_value("f.test", &uri).unwrap(), "f.test");
    }

    #[test]
    fn host_with_custom_port_keeps_it() {
        let uri: Uri = "http://f.test:8080/x".parse().unwrap();
        assert_eq!(host_value("f.test", &uri).unwrap(), "f.test:8080");
    }
}
