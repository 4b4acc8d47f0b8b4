// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response-related helpers

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::Response;
pub use hyper::StatusCode;

/// Type-erased HTTP response
///
/// Streaming relay bodies and fixed diagnostic bodies both erase to this.
pub type GenericResponse = Response<BoxBody<Bytes, anyhow::Error>>;

/// Return a [`GenericResponse`] with known content.
pub fn full(
    status: StatusCode,
    content_type: &'static str,
    content: impl ToString,
) -> GenericResponse {
    let body = Full::new(Bytes::from(content.to_string()))
        .map_err(anyhow::Error::from)
        .boxed();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(body)
        .unwrap()
}

/// Return a plain text response with known content.
pub fn text(status: StatusCode, content: impl ToString) -> GenericResponse {
    let content_type = "text/plain; charset=utf-8";
    full(status, content_type, content)
}

/// Return an HTML response with known content.
pub fn html(status: StatusCode, content: impl ToString) -> GenericResponse {
    let content_type = "text/html; charset=utf-8";
    full(status, content_type, content)
}
