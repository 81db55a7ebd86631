//! The public listener's service: one request walks
//! authenticate → resolve tenants → rewrite → forward, short-circuiting
//! to the taxonomy's status codes. Each request works against the
//! snapshot it grabbed on arrival; a concurrent config reload never
//! changes a request mid-flight.

use crate::auth::Identity;
use crate::errors::PipelineError;
use crate::metrics_defs::{REQUESTS_TOTAL, REWRITE_DURATION, TENANT_FAILURES, TOKEN_FAILURES};
use crate::rewrite;
use crate::router::{self, RouteMatch};
use crate::state::{AppState, Snapshot};
use bytes::Bytes;
use enforcer::TenantSet;
use http::HeaderValue;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, HeaderMap};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::service::Service;
use hyper::{Request, Response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct ProxyService {
    state: AppState,
}

impl ProxyService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

impl<B> Service<Request<B>> for ProxyService
where
    B: BodyExt<Data = Bytes> + Send + Sync + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response<BoxBody<Bytes, hyper::Error>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let snapshot = self.state.snapshot();

        Box::pin(async move {
            let start = Instant::now();
            let method = req.method().clone();
            let path = req.uri().path().to_string();
            let route = router::resolve(&path);
            let route_label = route.map(|m| m.route.pattern).unwrap_or("unmatched");

            let response = match handle(snapshot, route, req).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(
                        route = route_label,
                        kind = err.kind(),
                        detail = err.detail().unwrap_or(""),
                        "request rejected"
                    );
                    err.into_response()
                }
            };

            let status = response.status();
            metrics::counter!(
                REQUESTS_TOTAL.name,
                "route" => route_label,
                "status" => status.as_u16().to_string(),
            )
            .increment(1);
            tracing::info!(
                method = %method,
                path = %path,
                status = status.as_u16(),
                duration_ms = start.elapsed().as_millis() as u64,
                "request"
            );
            Ok(response)
        })
    }
}

async fn handle<B>(
    snapshot: Arc<Snapshot>,
    route: Option<RouteMatch>,
    req: Request<B>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PipelineError>
where
    B: BodyExt<Data = Bytes> + Send + Sync + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let route = route.ok_or(PipelineError::NotFound)?;

    let bearer = bearer_token(req.headers())
        .ok_or(PipelineError::MissingAuthorization)?
        .to_string();
    let identity = snapshot.verifier.verify(&bearer).await.map_err(|err| {
        metrics::counter!(TOKEN_FAILURES.name).increment(1);
        PipelineError::InvalidToken(err)
    })?;

    let tenants = snapshot.provider.resolve(&identity).await.map_err(|err| {
        metrics::counter!(TENANT_FAILURES.name).increment(1);
        PipelineError::Internal {
            detail: err.to_string(),
        }
    })?;
    if tenants.is_empty() {
        metrics::counter!(TENANT_FAILURES.name).increment(1);
        tracing::warn!(user = %identity.preferred_username, "user resolves to no tenants");
        return Err(PipelineError::NoTenants);
    }

    handle_authorized(&snapshot, route, &identity, &tenants, req).await
}

/// The post-auth tail of the pipeline: rewrite the query payload and
/// forward to the route's upstream.
async fn handle_authorized<B>(
    snapshot: &Snapshot,
    route: RouteMatch,
    identity: &Identity,
    tenants: &TenantSet,
    req: Request<B>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PipelineError>
where
    B: BodyExt<Data = Bytes> + Send + Sync + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|_| PipelineError::MalformedQuery("failed to read request body".to_string()))?
        .to_bytes();

    let rewrite_start = Instant::now();
    let outcome = rewrite::apply(
        &parts,
        body,
        route,
        &snapshot.config.proxy.tenant_label,
        tenants,
    )
    .map_err(|err| {
        let err = PipelineError::from(err);
        tracing::warn!(
            user = %identity.preferred_username,
            route = route.route.pattern,
            upstream = route.backend.as_str(),
            kind = err.kind(),
            "query rejected"
        );
        err
    })?;
    metrics::histogram!(REWRITE_DURATION.name, "route" => route.route.pattern)
        .record(rewrite_start.elapsed().as_secs_f64());

    let body_len = outcome.body.len();
    let body_rewritten = outcome.body_rewritten;
    let mut outgoing = Request::builder()
        .method(parts.method.clone())
        .uri(&outcome.path_and_query)
        .body(Full::new(outcome.body))
        .map_err(|e| PipelineError::Internal {
            detail: format!("failed to rebuild request: {e}"),
        })?;
    *outgoing.headers_mut() = parts.headers.clone();
    if body_rewritten {
        outgoing
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(body_len as u64));
    }

    let upstream = snapshot.upstreams.get(route.backend);
    let deadline = Duration::from_secs(snapshot.config.web.request_timeout_seconds);
    upstream
        .forward(outgoing, &snapshot.service_token, deadline)
        .await
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenVerifier;
    use crate::config::*;
    use crate::tenants::TenantProvider;
    use crate::upstreams::Upstreams;
    use http::StatusCode;
    use http::header::CONTENT_TYPE;
    use hyper::service::service_fn;
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use std::collections::HashMap;
    use tokio::net::TcpListener;
    use url::form_urlencoded;

    // Upstream double echoing the request target, body, and the
    // Authorization header it saw, separated by newlines.
    async fn reflect(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let uri = req.uri().to_string();
        let auth = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = req.into_body().collect().await.unwrap().to_bytes();
        let reply = format!("{uri}\n{auth}\n{}", String::from_utf8_lossy(&body));
        Ok(Response::new(Full::new(Bytes::from(reply))))
    }

    async fn start_reflector() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service_fn(reflect))
                        .await;
                });
            }
        });
        port
    }

    fn test_snapshot(upstream_port: u16) -> Snapshot {
        let config = Config {
            web: WebConfig {
                jwks_cert_url: "http://127.0.0.1:1/certs".into(),
                token_issuer: None,
                insecure_skip_verify: false,
                trusted_root_ca_path: None,
                proxy_port: 8080,
                metrics_port: 8081,
                request_timeout_seconds: 5,
            },
            proxy: ProxySettings {
                tenant_label: "namespace".into(),
                admin_group: Some("ops-admin".into()),
            },
            tenant_provider: TenantProviderKind::Configmap,
            loki: UpstreamConfig {
                url: format!("http://127.0.0.1:{upstream_port}"),
                cert: None,
                key: None,
                use_mutual_tls: false,
            },
            thanos: UpstreamConfig {
                url: format!("http://127.0.0.1:{upstream_port}"),
                cert: None,
                key: None,
                use_mutual_tls: false,
            },
            db: None,
            dev: DevConfig::default(),
            log: LogConfig::default(),
        };

        let labels = LabelsConfig {
            users: HashMap::from([("alice".to_string(), vec!["team-a".to_string()])]),
            groups: HashMap::new(),
        };

        Snapshot {
            upstreams: Upstreams::try_new(&config).expect("upstreams"),
            provider: TenantProvider::configmap(labels, config.proxy.admin_group.clone()),
            verifier: TokenVerifier::new(config.web.jwks_cert_url.clone(), None),
            service_token: "service-token".to_string(),
            config,
        }
    }

    fn alice() -> Identity {
        Identity {
            preferred_username: "alice".into(),
            email: String::new(),
            groups: vec![],
        }
    }

    fn empty_request(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    /// Splits the reflector's reply into (target, authorization, body).
    async fn read_reply(
        response: Response<BoxBody<Bytes, hyper::Error>>,
    ) -> (String, String, String) {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let mut lines = text.splitn(3, '\n');
        (
            lines.next().unwrap_or("").to_string(),
            lines.next().unwrap_or("").to_string(),
            lines.next().unwrap_or("").to_string(),
        )
    }

    fn decoded_query(target: &str) -> Vec<(String, String)> {
        let qs = target.split_once('?').map(|(_, qs)| qs).unwrap_or("");
        form_urlencoded::parse(qs.as_bytes()).into_owned().collect()
    }

    #[tokio::test]
    async fn rewritten_query_reaches_the_upstream_with_the_service_bearer() {
        let port = start_reflector().await;
        let snapshot = test_snapshot(port);
        let route = router::resolve("/api/v1/query").unwrap();

        let response = handle_authorized(
            &snapshot,
            route,
            &alice(),
            &TenantSet::names(["team-a"]),
            empty_request("/api/v1/query?query=up"),
        )
        .await
        .expect("forward");

        let (target, auth, _) = read_reply(response).await;
        assert_eq!(auth, "Bearer service-token");
        assert!(decoded_query(&target)
            .contains(&("query".into(), r#"up{namespace="team-a"}"#.into())));
    }

    #[tokio::test]
    async fn loki_routes_rewrite_the_stream_selector() {
        let port = start_reflector().await;
        let snapshot = test_snapshot(port);
        let route = router::resolve("/loki/api/v1/query_range").unwrap();

        let response = handle_authorized(
            &snapshot,
            route,
            &alice(),
            &TenantSet::names(["team-a"]),
            empty_request("/loki/api/v1/query_range?query=%7Bapp%3D%22nginx%22%7D"),
        )
        .await
        .expect("forward");

        let (target, _, _) = read_reply(response).await;
        assert!(decoded_query(&target).contains(&(
            "query".into(),
            r#"{app="nginx", namespace="team-a"}"#.into()
        )));
    }

    #[tokio::test]
    async fn form_bodies_are_rewritten_with_a_fresh_content_length() {
        let port = start_reflector().await;
        let snapshot = test_snapshot(port);
        let route = router::resolve("/api/v1/query").unwrap();

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/query")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from_static(b"query=up")))
            .unwrap();

        let response = handle_authorized(
            &snapshot,
            route,
            &alice(),
            &TenantSet::names(["team-a"]),
            request,
        )
        .await
        .expect("forward");

        let (_, _, body) = read_reply(response).await;
        let pairs: Vec<(String, String)> = form_urlencoded::parse(body.as_bytes())
            .into_owned()
            .collect();
        assert!(pairs.contains(&("query".into(), r#"up{namespace="team-a"}"#.into())));
    }

    #[tokio::test]
    async fn forbidden_tenants_never_reach_the_upstream() {
        let port = start_reflector().await;
        let snapshot = test_snapshot(port);
        let route = router::resolve("/api/v1/query").unwrap();

        let err = handle_authorized(
            &snapshot,
            route,
            &alice(),
            &TenantSet::names(["team-a"]),
            empty_request("/api/v1/query?query=up%7Bnamespace%3D%22team-b%22%7D"),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.to_string(), "forbidden tenant: team-b");
    }

    #[tokio::test]
    async fn admin_callers_forward_untouched() {
        let port = start_reflector().await;
        let snapshot = test_snapshot(port);
        let route = router::resolve("/api/v1/query").unwrap();

        let response = handle_authorized(
            &snapshot,
            route,
            &alice(),
            &TenantSet::all(),
            empty_request("/api/v1/query?query=up%7Bnamespace%3D%22anything%22%7D"),
        )
        .await
        .expect("forward");

        let (target, _, _) = read_reply(response).await;
        assert!(decoded_query(&target)
            .contains(&("query".into(), r#"up{namespace="anything"}"#.into())));
    }

    #[tokio::test]
    async fn unlisted_paths_are_not_found() {
        let port = start_reflector().await;
        let service = ProxyService::new(AppState::new(test_snapshot(port)));

        let response = service
            .call(empty_request("/api/v1/admin/tsdb/snapshot"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_authorization_is_rejected_before_anything_else() {
        let port = start_reflector().await;
        let service = ProxyService::new(AppState::new(test_snapshot(port)));

        let response = service.call(empty_request("/api/v1/query?query=up")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"missing authorization");
    }

    #[tokio::test]
    async fn garbage_bearer_is_an_invalid_token() {
        let port = start_reflector().await;
        let service = ProxyService::new(AppState::new(test_snapshot(port)));

        let request = Request::builder()
            .uri("/api/v1/query?query=up")
            .header(AUTHORIZATION, "Bearer not-a-jwt")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = service.call(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"invalid token");
    }

    #[test]
    fn bearer_extraction_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
    }
}
