//! The admin listener: health and metrics, no authentication, mounted
//! on its own port so it is never reachable through the public surface.

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use shared::http::plain_response;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

pub struct AdminService {
    prometheus: PrometheusHandle,
}

impl AdminService {
    pub fn new(prometheus: PrometheusHandle) -> Self {
        Self { prometheus }
    }
}

impl<B> Service<Request<B>> for AdminService {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let response = match req.uri().path() {
            "/health" => plain_response(StatusCode::OK, "Ok"),
            "/metrics" => plain_response(StatusCode::OK, self.prometheus.render()),
            _ => plain_response(StatusCode::NOT_FOUND, "not found"),
        };
        Box::pin(async move { Ok(response) })
    }
}
