// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request classification and the reserved endpoints
//!
//! Reserved paths (the index page and `/version`) are answered here; every
//! other path is a relay path whose role comes from the method: POST/PUT
//! send, GET receives.

use bytes::Bytes;
use hyper::body::Body;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Uri};
use http_body_util::BodyExt;
use tracing::info;

use crate::registry::Registry;
use crate::response::{self, GenericResponse, StatusCode};
use crate::slot::{Reject, SenderParts};
use crate::version::get_version;

const INDEX_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Piping Server</title></head>
<body>
<h1>Piping Server</h1>
<p>Stream data from one HTTP client to another through a shared path.</p>
<pre>
# send
curl -T myfile http://localhost:8080/mypath

# receive
curl http://localhost:8080/mypath &gt; myfile
</pre>
</body>
</html>
"#;

fn is_reserved(path: &str) -> bool {
    matches!(path, "" | "/" | "/version")
}

/// Answer one request.
///
/// Does not resolve until the response is fully decided: relay requests park
/// in the registry until their transfer starts (or they are rejected).
pub async fn route<B>(registry: &Registry, request: Request<B>) -> GenericResponse
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let path = request.uri().path();
    if is_reserved(path) {
        return match (request.method(), path) {
            (&Method::GET, "/version") => {
                response::text(StatusCode::OK, format_args!("{}\n", get_version()))
            }
            (&Method::GET, _) => response::html(StatusCode::OK, INDEX_PAGE),
            _ => {
                info!(path, method = %request.method(), "rejecting non-GET on reserved path");
                Reject::ReservedPath.into_response()
            }
        };
    }

    match *request.method() {
        Method::POST | Method::PUT => relay_send(registry, request).await,
        Method::GET => registry.receive(path).await,
        _ => {
            info!(path, method = %request.method(), "rejecting unsupported relay method");
            Reject::UnsupportedMethod.into_response()
        }
    }
}

async fn relay_send<B>(registry: &Registry, request: Request<B>) -> GenericResponse
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let capacity = match receiver_count(request.uri()) {
        Ok(capacity) => capacity,
        Err(reject) => {
            info!(path = request.uri().path(), "rejecting sender: invalid receiver count");
            return reject.into_response();
        }
    };
    let path = request.uri().path().to_owned();
    let (head, body) = request.into_parts();
    let parts = SenderParts {
        body: body.map_err(anyhow::Error::from).boxed(),
        content_length: head.headers.get(CONTENT_LENGTH).cloned(),
        content_type: head.headers.get(CONTENT_TYPE).cloned(),
    };
    registry.send(&path, capacity, parts).await
}

/// Parse the `?n=` receiver count. Absent means one receiver; anything that
/// is not a positive integer is a rejection.
fn receiver_count(uri: &Uri) -> Result<usize, Reject> {
    let Some(query) = uri.query() else {
        return Ok(1);
    };
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if key == "n" {
            return match value.parse::<usize>() {
                Ok(count) if count > 0 => Ok(count),
                _ => Err(Reject::InvalidCapacity),
            };
        }
    }
    Ok(1)
}
