//! Response prelude parsing on top of `httparse`.
//!
//! The parser is incomplete-tolerant: it is called repeatedly with a
//! growing input buffer until a full status line + header block is
//! present.

use http::{HeaderName, HeaderValue, Response, StatusCode, Version};

use crate::error::ParseError;

/// Max number of headers to parse from an HTTP response.
pub const MAX_RESPONSE_HEADERS: usize = 128;

/// The reason phrase of the status line, kept out-of-band in the response
/// extensions since `http::Response` does not model it.
#[derive(Debug, Clone)]
pub(crate) struct ReasonPhrase(pub String);

/// Try to parse a complete response prelude from `input`.
///
/// Returns `None` when more input is needed. On success returns the number
/// of input bytes consumed together with the parsed response head.
///
/// The const parameter bounds the number of headers; parsing a response
/// with more fails with [`ParseError::TooManyHeaders`]. `N = 0` is used to
/// parse a bare `100 Continue` status line, where any header is an error.
pub fn try_parse_response<const N: usize>(
    input: &[u8],
) -> Result<Option<(usize, Response<()>)>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; N];
    let mut res = httparse::Response::new(&mut headers);

    let n = match res.parse(input) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let version = match res.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        Some(_) => return Err(ParseError::UnsupportedVersion),
        None => return Err(ParseError::MissingVersion),
    };

    let code = res.code.ok_or(ParseError::InvalidStatus)?;
    if !(100..=599).contains(&code) {
        return Err(ParseError::InvalidStatus);
    }
    let status = StatusCode::from_u16(code).map_err(|_| ParseError::InvalidStatus)?;

    let mut builder = Response::builder().version(version).status(status);

    for h in res.headers.iter() {
        let name =
            HeaderName::from_bytes(h.name.as_bytes()).map_err(|e| ParseError::Prelude(e.to_string()))?;
        let value =
            HeaderValue::from_bytes(h.value).map_err(|e| ParseError::Prelude(e.to_string()))?;
        builder = builder.header(name, value);
    }

    let mut response = builder
        .body(())
        .map_err(|e| ParseError::Prelude(e.to_string()))?;

    if let Some(reason) = res.reason {
        if !reason.is_empty() {
            response
                .extensions_mut()
                .insert(ReasonPhrase(reason.to_string()));
        }
    }

    Ok(Some((n, response)))
}
