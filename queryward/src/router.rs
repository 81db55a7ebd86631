//! The closed route table. Every query endpoint the upstreams expose is
//! listed here with the parameter that carries its query text; anything
//! else is a 404. The same table is served under `/loki` (LogQL, logs
//! upstream) and at the root (PromQL, metrics upstream).

/// Where a route's query text lives in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// A `query` parameter. Routes that never carry one (buildinfo,
    /// index stats) forward with only the tenant check applied.
    Query,
    /// Zero or more `match[]` parameters, each rewritten independently.
    Matches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Metrics,
    Logs,
}

impl Backend {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Backend::Metrics => "thanos",
            Backend::Logs => "loki",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Route {
    pub pattern: &'static str,
    pub payload: Payload,
}

pub static QUERY_ROUTES: &[Route] = &[
    Route {
        pattern: "/api/v1/query",
        payload: Payload::Query,
    },
    Route {
        pattern: "/api/v1/query_range",
        payload: Payload::Query,
    },
    Route {
        pattern: "/api/v1/query_exemplars",
        payload: Payload::Query,
    },
    Route {
        pattern: "/api/v1/format_query",
        payload: Payload::Query,
    },
    Route {
        pattern: "/api/v1/series",
        payload: Payload::Matches,
    },
    Route {
        pattern: "/api/v1/labels",
        payload: Payload::Matches,
    },
    Route {
        pattern: "/api/v1/label/{name}/values",
        payload: Payload::Matches,
    },
    Route {
        pattern: "/api/v1/tail",
        payload: Payload::Query,
    },
    Route {
        pattern: "/api/v1/index/stats",
        payload: Payload::Query,
    },
    Route {
        pattern: "/api/v1/status/buildinfo",
        payload: Payload::Query,
    },
];

#[derive(Debug, Clone, Copy)]
pub struct RouteMatch {
    pub route: &'static Route,
    pub backend: Backend,
}

/// Resolves a request path against the table. `/loki`-rooted paths go
/// to the logs backend, everything else to metrics.
pub fn resolve(path: &str) -> Option<RouteMatch> {
    let (backend, rest) = match path.strip_prefix("/loki") {
        Some(rest) if rest.starts_with('/') => (Backend::Logs, rest),
        _ => (Backend::Metrics, path),
    };

    QUERY_ROUTES
        .iter()
        .find(|route| pattern_matches(route.pattern, rest))
        .map(|route| RouteMatch { route, backend })
}

/// Segment-wise comparison; a `{name}` segment matches any single
/// non-empty segment.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let mut expected = pattern.split('/');
    let mut actual = path.split('/');
    loop {
        match (expected.next(), actual.next()) {
            (None, None) => return true,
            (Some(e), Some(a)) => {
                let wildcard = e.starts_with('{') && e.ends_with('}');
                let ok = if wildcard { !a.is_empty() } else { e == a };
                if !ok {
                    return false;
                }
            }
            _ => return false,
        }
    }
}
