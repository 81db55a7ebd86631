//! Locates the query text inside a request, runs it through the right
//! enforcer, and writes the result back where it came from. The query
//! may live in the URI query string, in a POST form body, or in both
//! (Prometheus clients do send `query` in either position).

use crate::router::{Backend, Payload, RouteMatch};
use bytes::Bytes;
use enforcer::{EnforceError, TenantSet, logql, promql};
use http::header::CONTENT_TYPE;
use http::request::Parts;
use url::form_urlencoded;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// The rewritten request target and body. `body_rewritten` tells the
/// caller whether content-length needs recomputing.
#[derive(Debug)]
pub struct RewriteOutcome {
    pub path_and_query: String,
    pub body: Bytes,
    pub body_rewritten: bool,
}

/// Dispatches one query text to the enforcer the backend speaks.
pub fn enforce_text(
    backend: Backend,
    query: &str,
    tenant_label: &str,
    tenants: &TenantSet,
) -> Result<String, EnforceError> {
    match backend {
        Backend::Metrics => promql::enforce(query, tenant_label, tenants),
        Backend::Logs => logql::enforce(query, tenant_label, tenants),
    }
}

/// Rewrites a request in place. Any enforcement failure aborts the
/// whole request; a partially rewritten request never leaves here.
pub fn apply(
    parts: &Parts,
    body: Bytes,
    route: RouteMatch,
    tenant_label: &str,
    tenants: &TenantSet,
) -> Result<RewriteOutcome, EnforceError> {
    let payload = route.route.payload;
    let path = parts.uri.path();

    let query_string = match parts.uri.query() {
        Some(encoded) => Some(rewrite_pairs(
            encoded,
            payload,
            route.backend,
            tenant_label,
            tenants,
        )?),
        None => None,
    };

    let is_form = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim_start().starts_with(FORM_CONTENT_TYPE));

    let (body, body_rewritten) = if is_form && !body.is_empty() {
        let encoded = std::str::from_utf8(&body)
            .map_err(|_| EnforceError::Malformed("form body is not valid UTF-8".to_string()))?;
        let rewritten = rewrite_pairs(encoded, payload, route.backend, tenant_label, tenants)?;
        (Bytes::from(rewritten), true)
    } else {
        (body, false)
    };

    let path_and_query = match &query_string {
        Some(qs) => format!("{path}?{qs}"),
        None => path.to_string(),
    };

    Ok(RewriteOutcome {
        path_and_query,
        body,
        body_rewritten,
    })
}

/// Rewrites every occurrence of the payload parameter inside a
/// urlencoded pair list; all other parameters pass through.
fn rewrite_pairs(
    encoded: &str,
    payload: Payload,
    backend: Backend,
    tenant_label: &str,
    tenants: &TenantSet,
) -> Result<String, EnforceError> {
    let target = match payload {
        Payload::Query => "query",
        Payload::Matches => "match[]",
    };

    let mut out = form_urlencoded::Serializer::new(String::new());
    for (name, value) in form_urlencoded::parse(encoded.as_bytes()) {
        if name == target {
            let rewritten = enforce_text(backend, &value, tenant_label, tenants)?;
            out.append_pair(&name, &rewritten);
        } else {
            out.append_pair(&name, &value);
        }
    }
    Ok(out.finish())
}
