//! Canonical header casing.
//!
//! `http::HeaderName` stores names lowercased, so casing cannot live in
//! the header map. This layer flags the call and the wire serializer
//! emits `Canonical-Kebab` names.

use crate::error::Error;
use crate::layer::{Call, Layer, Next};
use crate::response::Response;

pub(crate) struct CanonicalizeLayer;

impl Layer for CanonicalizeLayer {
    fn handle(&self, call: &mut Call<'_>, next: Next<'_>) -> Result<Response, Error> {
        call.canonicalize = true;
        next.run(call)
    }
}
