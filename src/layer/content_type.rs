//! Content-type sniffing for buffered request bodies.

use http::{header, HeaderValue};

use crate::error::Error;
use crate::layer::{Call, Layer, Next};
use crate::response::Response;

pub(crate) struct ContentTypeLayer;

impl Layer for ContentTypeLayer {
    fn handle(&self, call: &mut Call<'_>, next: Next<'_>) -> Result<Response, Error> {
        if !call.headers.contains_key(header::CONTENT_TYPE) {
            if let Some(data) = call.body.as_bytes() {
                if !data.is_empty() {
                    call.headers
                        .insert(header::CONTENT_TYPE, HeaderValue::from_static(sniff(data)));
                }
            }
        }

        next.run(call)
    }
}

/// Best-effort detection from magic bytes and syntax. Streaming bodies
/// are never sniffed.
fn sniff(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        return "image/png";
    }
    if data.starts_with(b"\xff\xd8\xff") {
        return "image/jpeg";
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if data.starts_with(b"%PDF-") {
        return "application/pdf";
    }

    let trimmed = trim_ascii_start(data);
    if trimmed.starts_with(b"<?xml") {
        return "application/xml";
    }
    if starts_with_ignore_case(trimmed, b"<!doctype html") || starts_with_ignore_case(trimmed, b"<html") {
        return "text/html; charset=utf-8";
    }
    if trimmed.starts_with(b"{") || trimmed.starts_with(b"[") {
        return "application/json";
    }

    if std::str::from_utf8(data).is_ok() && !data.contains(&0) {
        return "text/plain; charset=utf-8";
    }

    "application/octet-stream"
}

fn trim_ascii_start(data: &[u8]) -> &[u8] {
    let mut d = data;
    while let [first, rest @ ..] = d {
        if first.is_ascii_whitespace() {
            d = rest;
        } else {
            break;
        }
    }
    d
}

fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len() && data[..prefix.len()].eq_ignore_ascii_case(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_common_formats() {
        assert_eq!(sniff(b"{\"a\": 1}"), "application/json");
        assert_eq!(sniff(b"  [1, 2]"), "application/json");
        assert_eq!(sniff(b"<?xml version=\"1.0\"?><a/>"), "application/xml");
        assert_eq!(sniff(b"<!DOCTYPE HTML><html>"), "text/html; charset=utf-8");
        assert_eq!(sniff(b"<html><body>"), "text/html; charset=utf-8");
        assert_eq!(sniff(b"plain words"), "text/plain; charset=utf-8");
        assert_eq!(sniff(b"\x89PNG\r\n\x1a\nrest"), "image/png");
        assert_eq!(sniff(b"\x00\x01\x02"), "application/octet-stream");
    }
}
