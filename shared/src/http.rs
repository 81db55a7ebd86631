// Plumbing shared by the public and admin listeners: the hyper accept
// loop, hop-by-hop header hygiene, and canned error responses. Header
// helpers are applied in both directions, client to upstream and back.

use http::Version;
use http::header::{
    CONNECTION, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::StatusCode;
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Accept loop for one listening endpoint. The listener is bound by the
/// caller so a bad port is a startup error, not a background one. Each
/// accepted socket gets its own task; hyper auto-detects h1/h2.
pub async fn serve<S, B>(listener: TcpListener, service: S) -> std::io::Result<()>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = Infallible>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let service = Arc::new(service);

    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service.clone();

        tokio::spawn(async move {
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!(error = %err, "connection closed with error");
            }
        });
    }
}

static HOP_BY_HOP: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

fn is_http1(v: Version) -> bool {
    matches!(v, Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11)
}

// HTTP/1.x only: the standard hop-by-hop set, anything named in the
// Connection header, and keep-alive on 0.9/1.0. HTTP/2+ has no
// hop-by-hop headers, so the map passes through untouched.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, version: Version) {
    if !is_http1(version) {
        return;
    }

    let mut listed = Vec::new();
    if let Some(connection) = headers.get(CONNECTION)
        && let Ok(s) = connection.to_str()
    {
        for token in s.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
                listed.push(name);
            }
        }
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    for name in listed {
        headers.remove(&name);
    }
    if matches!(version, Version::HTTP_09 | Version::HTTP_10) {
        headers.remove(HeaderName::from_static("keep-alive"));
    }
}

/// Appends this proxy to the Via chain so loops are diagnosable from
/// either side of it.
pub fn append_via(headers: &mut HeaderMap, version: Version) {
    let version_str = match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => {
            tracing::warn!(?version, "unknown HTTP version, skipping Via header");
            return;
        }
    };

    let entry = format!("{version_str} queryward");
    let value = match headers.get(VIA).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {entry}"),
        None => entry,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(VIA, value);
    }
}

/// Plain-text response with the given status and body. Used for every
/// error the pipeline surfaces to callers.
pub fn plain_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Boxed variant for services whose happy path streams an upstream body.
pub fn boxed_plain_response<E>(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, E>>
where
    E: 'static,
{
    plain_response(status, body).map(|b| b.map_err(|never| match never {}).boxed())
}
