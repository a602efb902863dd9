//! AWS Signature V4 signing.
//!
//! Runs after the message layer (headers are final) and above the pool
//! (no transport state is involved). On redirects and retries the layer
//! re-runs, so every attempt carries a fresh signature.

use chrono::Utc;
use http::HeaderValue;

use crate::error::Error;
use crate::layer::{Call, Layer, Next};
use crate::response::Response;
use crate::sigv4::{self, AwsCredentials};

pub(crate) struct Aws4Layer {
    pub creds: AwsCredentials,
}

impl Layer for Aws4Layer {
    fn handle(&self, call: &mut Call<'_>, next: Next<'_>) -> Result<Response, Error> {
        // A previous attempt (retry, redirect hop) may have left its
        // signature behind; it must not feed into the new one.
        call.headers.remove("authorization");
        call.headers.remove("x-amz-date");
        call.headers.remove("x-amz-content-sha256");
        call.headers.remove("x-amz-security-token");

        // Buffered bodies are hashed; a streaming body cannot be read
        // ahead of sending, so it signs as unsigned payload.
        let payload_hash = match call.body.as_bytes() {
            Some(data) => sigv4::hash_payload(data),
            None => sigv4::UNSIGNED_PAYLOAD.to_string(),
        };

        let signature = sigv4::sign_request(
            &self.creds,
            &call.method,
            &call.uri,
            &call.headers,
            &payload_hash,
            Utc::now(),
        );

        let insert = |headers: &mut http::HeaderMap, name: &'static str, value: &str| {
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Argument(format!("bad {} header: {}", name, e)))?;
            headers.insert(name, value);
            Ok::<_, Error>(())
        };

        insert(&mut call.headers, "x-amz-date", &signature.amz_date)?;
        insert(
            &mut call.headers,
            "x-amz-content-sha256",
            &signature.content_sha256,
        )?;
        if let Some(token) = &self.creds.session_token {
            insert(&mut call.headers, "x-amz-security-token", token)?;
        }
        insert(&mut call.headers, "authorization", &signature.authorization)?;

        next.run(call)
    }
}
