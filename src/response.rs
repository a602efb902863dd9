//! The response type and the request history chain.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};

use crate::error::Error;

/// A fully received HTTP response.
///
/// Headers preserve order and repetition. The body is either buffered or
/// was streamed into the caller-provided sink while it arrived, in which
/// case only the sentinel remains here.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    reason: Option<String>,
    version: Version,
    headers: HeaderMap,
    body: ResponseBody,
    request: RequestRecord,
}

/// Where the response body ended up.
#[derive(Debug)]
pub enum ResponseBody {
    /// The body was accumulated in memory.
    Buffered(Bytes),
    /// The body was streamed into the caller's sink (or read directly by
    /// an `open()` callback) as it arrived.
    Streamed,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        reason: Option<String>,
        version: Version,
        headers: HeaderMap,
        body: ResponseBody,
        request: RequestRecord,
    ) -> Response {
        Response {
            status,
            reason,
            version,
            headers,
            body,
            request,
        }
    }

    /// The response status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The reason phrase from the status line, when the server sent one.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// The HTTP version of the response.
    pub fn version(&self) -> Version {
        self.version
    }

    /// All response headers, in arrival order.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of the named header, as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The buffered body bytes. Empty when the body was streamed away.
    pub fn body(&self) -> &[u8] {
        match &self.body {
            ResponseBody::Buffered(b) => b,
            ResponseBody::Streamed => &[],
        }
    }

    /// Whether the body went to a caller sink instead of this response.
    pub fn body_was_streamed(&self) -> bool {
        matches!(self.body, ResponseBody::Streamed)
    }

    /// Consume into the buffered body.
    pub fn into_body(self) -> Bytes {
        match self.body {
            ResponseBody::Buffered(b) => b,
            ResponseBody::Streamed => Bytes::new(),
        }
    }

    /// The buffered body as UTF-8 text.
    pub fn text(&self) -> Result<&str, Error> {
        std::str::from_utf8(self.body())
            .map_err(|_| Error::Argument("response body is not utf-8".into()))
    }

    /// The request that produced this response. Follow
    /// [`RequestRecord::parent`] for the redirect/retry history.
    pub fn request(&self) -> &RequestRecord {
        &self.request
    }

    pub(crate) fn take_request(self) -> RequestRecord {
        self.request
    }
}

/// A record of a request as it went on the wire, forming a history chain
/// through `parent` when the call was redirected or retried.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    parent: Option<Box<RequestRecord>>,
}

impl RequestRecord {
    pub(crate) fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        parent: Option<Box<RequestRecord>>,
    ) -> RequestRecord {
        RequestRecord {
            method,
            uri,
            headers,
            parent,
        }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The absolute URI the request targeted.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The headers as sent.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The previous request in the chain, when this one was produced by a
    /// redirect or retry.
    pub fn parent(&self) -> Option<&RequestRecord> {
        self.parent.as_deref()
    }

    /// Number of ancestors in the chain.
    pub fn depth(&self) -> usize {
        let mut n = 0;
        let mut cur = self.parent();
        while let Some(p) = cur {
            n += 1;
            cur = p.parent();
        }
        n
    }

    /// Every URI in the chain, oldest first.
    pub fn uri_history(&self) -> Vec<Uri> {
        let mut v = Vec::with_capacity(self.depth() + 1);
        let mut cur = Some(self);
        while let Some(r) = cur {
            v.push(r.uri.clone());
            cur = r.parent();
        }
        v.reverse();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(uri: &str, parent: Option<Box<RequestRecord>>) -> RequestRecord {
        RequestRecord::new(
            Method::GET,
            uri.parse().unwrap(),
            HeaderMap::new(),
            parent,
        )
    }

    #[test]
    fn history_chain() {
        let first = record("http://a.test/1", None);
        let second = record("http://a.test/2", Some(Box::new(first)));
        let third = record("http://b.test/3", Some(Box::new(second)));

        assert_eq!(third.depth(), 2);
        let uris: Vec<String> = third.uri_history().iter().map(|u| u.to_string()).collect();
        assert_eq!(
            uris,
            ["http://a.test/1", "http://a.test/2", "http://b.test/3"]
        );
    }

    #[test]
    fn buffered_body_access() {
        let r = Response::new(
            StatusCode::OK,
            Some("OK".into()),
            Version::HTTP_11,
            HeaderMap::new(),
            ResponseBody::Buffered(Bytes::from_static(b"hello")),
            record("http://a.test/", None),
        );

        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(r.body(), b"hello");
        assert_eq!(r.text().unwrap(), "hello");
        assert!(!r.body_was_streamed());
    }
}
