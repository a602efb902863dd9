//! Basic auth from URL userinfo.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use http::{header, HeaderValue};

use crate::error::Error;
use crate::ext::AuthorityExt;
use crate::layer::{Call, Layer, Next};
use crate::response::Response;

pub(crate) struct BasicAuthLayer;

impl Layer for BasicAuthLayer {
    fn handle(&self, call: &mut Call<'_>, next: Next<'_>) -> Result<Response, Error> {
        // An explicit authorization header always wins over the URL.
        if !call.headers.contains_key(header::AUTHORIZATION) {
            if let Some(auth) = call.uri.authority() {
                if auth.userinfo().is_some() {
                    let user = auth.username().unwrap_or_default();
                    let pass = auth.password().unwrap_or_default();
                    let creds = BASE64_STANDARD.encode(format!("{}:{}", user, pass));
                    let value = HeaderValue::from_str(&format!("Basic {}", creds))
                        .map_err(|e| Error::Argument(format!("bad userinfo: {}", e)))?;
                    call.headers.insert(header::AUTHORIZATION, value);
                }
            }
        }

        next.run(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The header value matches what the userinfo encodes to; the wire
    // tests in `exchange` assert the serialized form.
    #[test]
    fn encodes_userinfo() {
        let creds = BASE64_STANDARD.encode("martin:secret");
        assert_eq!(creds, "bWFydGluOnNlY3JldA==");

        let creds = BASE64_STANDARD.encode("martin:");
        assert_eq!(creds, "bWFydGluOg==");

        let creds = BASE64_STANDARD.encode(":secret");
        assert_eq!(creds, "OnNlY3JldA==");
    }
}
