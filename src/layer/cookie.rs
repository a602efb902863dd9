//! Attach `cookie`, learn `set-cookie`.

use std::sync::Arc;

use http::{header, HeaderValue};
use log::debug;

use crate::cookie::CookieJar;
use crate::error::Error;
use crate::layer::{Call, Layer, Next};
use crate::response::Response;

pub(crate) struct CookieLayer {
    jar: Arc<CookieJar>,
}

impl CookieLayer {
    pub fn new(jar: Arc<CookieJar>) -> CookieLayer {
        CookieLayer { jar }
    }

    fn learn_from(&self, call: &Call<'_>, response: &Response) {
        for set_cookie in response.headers().get_all(header::SET_COOKIE) {
            self.jar.learn(&call.uri, set_cookie);
        }
    }
}

impl Layer for CookieLayer {
    fn handle(&self, call: &mut Call<'_>, next: Next<'_>) -> Result<Response, Error> {
        // A caller-provided cookie header wins over the jar.
        if !call.headers.contains_key(header::COOKIE) {
            if let Some(value) = self.jar.header_for(&call.uri) {
                match HeaderValue::from_str(&value) {
                    Ok(v) => {
                        call.headers.insert(header::COOKIE, v);
                    }
                    Err(_) => debug!("jar produced an unsendable cookie header"),
                }
            }
        }

        // Set-cookie is learned from error-status responses too.
        match next.run(call) {
            Ok(response) => {
                self.learn_from(call, &response);
                Ok(response)
            }
            Err(Error::Status { status, response }) => {
                self.learn_from(call, &response);
                Err(Error::Status { status, response })
            }
            Err(e) => Err(e),
        }
    }
}
