//! Forwarding to the two query backends. Each upstream owns a hyper
//! client over its own TLS connector, so the metrics and logs backends
//! can present different client certificates.

use crate::config::{Config, UpstreamConfig};
use crate::errors::PipelineError;
use crate::metrics_defs::UPSTREAM_DURATION;
use crate::router::Backend;
use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{HeaderValue, Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::RootCertStore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use shared::http::{append_via, strip_hop_by_hop};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;
use url::Url;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("invalid upstream url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("could not read certificate material: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream {0} requires mutual TLS but has no cert/key configured")]
    MissingKeyPair(&'static str),
}

pub struct Upstreams {
    metrics: Upstream,
    logs: Upstream,
}

impl Upstreams {
    pub fn try_new(config: &Config) -> Result<Self, UpstreamError> {
        let roots = build_root_store(config.web.trusted_root_ca_path.as_deref())?;
        Ok(Upstreams {
            metrics: Upstream::try_new(
                Backend::Metrics.as_str(),
                &config.thanos,
                &roots,
                config.web.insecure_skip_verify,
            )?,
            logs: Upstream::try_new(
                Backend::Logs.as_str(),
                &config.loki,
                &roots,
                config.web.insecure_skip_verify,
            )?,
        })
    }

    pub fn get(&self, backend: Backend) -> &Upstream {
        match backend {
            Backend::Metrics => &self.metrics,
            Backend::Logs => &self.logs,
        }
    }
}

#[derive(Debug)]
pub struct Upstream {
    name: &'static str,
    url: Url,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl Upstream {
    pub fn try_new(
        name: &'static str,
        config: &UpstreamConfig,
        roots: &RootCertStore,
        insecure_skip_verify: bool,
    ) -> Result<Self, UpstreamError> {
        // Pin the process-wide provider so builder() cannot be ambiguous
        // about which crypto backend the dependency graph brought in.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let url = Url::parse(&config.url)?;

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots.clone());
        let mut tls = if config.use_mutual_tls {
            let (cert, key) = match (&config.cert, &config.key) {
                (Some(cert), Some(key)) => (cert, key),
                _ => return Err(UpstreamError::MissingKeyPair(name)),
            };
            let (chain, key) = load_keypair(cert, key)?;
            builder.with_client_auth_cert(chain, key)?
        } else {
            builder.with_no_client_auth()
        };
        if insecure_skip_verify {
            tls.dangerous()
                .set_certificate_verifier(Arc::new(DisabledVerifier));
        }

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_all_versions()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Upstream { name, url, client })
    }

    /// Sends the rewritten request to this upstream and streams the
    /// response back untouched. The caller's Authorization is replaced
    /// with the service-account bearer before anything leaves here.
    pub async fn forward(
        &self,
        request: Request<Full<Bytes>>,
        service_token: &str,
        deadline: Duration,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PipelineError> {
        let (mut parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let mut target = self.url.clone();
        match path_and_query.split_once('?') {
            Some((path, query)) => {
                target.set_path(path);
                target.set_query(Some(query));
            }
            None => {
                target.set_path(path_and_query);
                target.set_query(None);
            }
        }

        let version = parts.version;
        strip_hop_by_hop(&mut parts.headers, version);
        append_via(&mut parts.headers, version);
        let bearer = HeaderValue::from_str(&format!("Bearer {service_token}"))
            .map_err(|_| PipelineError::Internal {
                detail: "service account token is not a valid header value".to_string(),
            })?;
        parts.headers.insert(AUTHORIZATION, bearer);

        let mut outgoing = Request::builder()
            .method(parts.method.clone())
            .uri(target.as_str())
            .body(body)
            .map_err(|e| PipelineError::Internal {
                detail: format!("failed to build upstream request: {e}"),
            })?;
        *outgoing.headers_mut() = parts.headers;

        let start = Instant::now();
        let result = timeout(deadline, self.client.request(outgoing)).await;
        let status_tag = match &result {
            Ok(Ok(response)) => response.status().as_u16().to_string(),
            Ok(Err(_)) => "error".to_string(),
            Err(_) => "timeout".to_string(),
        };
        metrics::histogram!(
            UPSTREAM_DURATION.name,
            "upstream" => self.name,
            "status" => status_tag,
        )
        .record(start.elapsed().as_secs_f64());

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return Err(PipelineError::UpstreamUnreachable {
                    detail: format!("{}: {err}", self.name),
                });
            }
            Err(_) => return Err(PipelineError::UpstreamTimeout),
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers, parts.version);
        append_via(&mut parts.headers, parts.version);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// System roots plus any PEMs found under the trusted-CA directory.
/// Subdirectories and suspicious names are skipped, unreadable files
/// are logged and skipped.
fn build_root_store(trusted_dir: Option<&Path>) -> Result<RootCertStore, UpstreamError> {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::warn!(error = %err, "skipping unreadable system root");
    }
    for cert in native.certs {
        let _ = roots.add(cert);
    }

    if let Some(dir) = trusted_dir {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || path.to_string_lossy().contains("..") {
                continue;
            }
            let mut reader = BufReader::new(File::open(&path)?);
            for cert in rustls_pemfile::certs(&mut reader) {
                match cert {
                    Ok(cert) => {
                        let _ = roots.add(cert);
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping bad PEM");
                    }
                }
            }
            tracing::debug!(path = %path.display(), "added trusted roots");
        }
    }

    Ok(roots)
}

fn load_keypair(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), UpstreamError> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let chain = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
        UpstreamError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("no private key in {}", key_path.display()),
        ))
    })?;

    Ok((chain, key))
}

/// Accepts any server certificate. Only reachable through
/// `web.insecure_skip_verify`.
#[derive(Debug)]
struct DisabledVerifier;

impl ServerCertVerifier for DisabledVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use http::header::HOST;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    // Upstream double that reports what it received: method, target,
    // and the Authorization header it saw.
    async fn reflect(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let auth = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = format!("{} {} auth={auth}", req.method(), req.uri(), auth = auth);
        Ok(Response::new(Full::new(Bytes::from(body))))
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

    fn plain_upstream(port: u16) -> Upstream {
        let config = UpstreamConfig {
            url: format!("http://127.0.0.1:{port}"),
            cert: None,
            key: None,
            use_mutual_tls: false,
        };
        Upstream::try_new("thanos", &config, &RootCertStore::empty(), false).expect("upstream")
    }

    #[tokio::test]
    async fn forwards_with_service_account_bearer() {
        let port = start_reflector().await;
        let upstream = plain_upstream(port);

        let request = Request::builder()
            .uri("/api/v1/query?query=up")
            .header(HOST, "grafana.example.com")
            .header(AUTHORIZATION, "Bearer caller-token")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = upstream
            .forward(request, "service-token", Duration::from_secs(5))
            .await
            .expect("forward");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = std::str::from_utf8(&body).unwrap();
        assert!(body.contains("/api/v1/query?query=up"));
        assert!(body.contains("auth=Bearer service-token"));
        assert!(!body.contains("caller-token"));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_bad_gateway() {
        let upstream = plain_upstream(1);

        let request = Request::builder()
            .uri("/api/v1/query")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let err = upstream
            .forward(request, "t", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamUnreachable { .. }));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn slow_upstream_is_a_gateway_timeout() {
        // Reserved TEST-NET address, nothing answers.
        let config = UpstreamConfig {
            url: "http://192.0.2.1:9999".to_string(),
            cert: None,
            key: None,
            use_mutual_tls: false,
        };
        let upstream =
            Upstream::try_new("thanos", &config, &RootCertStore::empty(), false).unwrap();

        let request = Request::builder()
            .uri("/api/v1/query")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let err = upstream
            .forward(request, "t", Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamTimeout));
    }

    #[test]
    fn mutual_tls_without_a_keypair_is_a_config_error() {
        let config = UpstreamConfig {
            url: "https://loki.example.com".to_string(),
            cert: None,
            key: None,
            use_mutual_tls: true,
        };
        let err =
            Upstream::try_new("loki", &config, &RootCertStore::empty(), false).unwrap_err();
        assert!(matches!(err, UpstreamError::MissingKeyPair("loki")));
    }
}
