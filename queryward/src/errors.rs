use crate::auth::AuthError;
use bytes::Bytes;
use enforcer::EnforceError;
use http_body_util::combinators::BoxBody;
use hyper::{Response, StatusCode};
use shared::http::boxed_plain_response;
use thiserror::Error;

/// Everything that can terminate the request pipeline early. The
/// `Display` text is the user-visible body; anything the caller must
/// not see (upstream addresses, driver errors) stays in `detail`.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("missing authorization")]
    MissingAuthorization,

    #[error("invalid token")]
    InvalidToken(#[source] AuthError),

    #[error("no tenants")]
    NoTenants,

    #[error("forbidden tenant: {0}")]
    ForbiddenTenant(String),

    /// Query parser error; the message is safe to return to the caller.
    #[error("{0}")]
    MalformedQuery(String),

    #[error("not found")]
    NotFound,

    #[error("upstream error")]
    UpstreamUnreachable { detail: String },

    #[error("upstream timeout")]
    UpstreamTimeout,

    #[error("internal error")]
    Internal { detail: String },
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::MissingAuthorization | PipelineError::InvalidToken(_) => {
                StatusCode::UNAUTHORIZED
            }
            PipelineError::NoTenants | PipelineError::ForbiddenTenant(_) => StatusCode::FORBIDDEN,
            PipelineError::MalformedQuery(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound => StatusCode::NOT_FOUND,
            PipelineError::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            PipelineError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable kind tag for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MissingAuthorization => "missing-authorization",
            PipelineError::InvalidToken(_) => "invalid-token",
            PipelineError::NoTenants => "no-tenants-for-user",
            PipelineError::ForbiddenTenant(_) => "forbidden-tenant",
            PipelineError::MalformedQuery(_) => "malformed-query",
            PipelineError::NotFound => "not-found",
            PipelineError::UpstreamUnreachable { .. } => "upstream-unreachable",
            PipelineError::UpstreamTimeout => "upstream-timeout",
            PipelineError::Internal { .. } => "internal",
        }
    }

    /// Operator-facing detail that must not reach the caller.
    pub fn detail(&self) -> Option<&str> {
        match self {
            PipelineError::UpstreamUnreachable { detail }
            | PipelineError::Internal { detail } => Some(detail),
            _ => None,
        }
    }

    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        boxed_plain_response(self.status(), self.to_string())
    }
}

impl From<EnforceError> for PipelineError {
    fn from(err: EnforceError) -> Self {
        match err {
            EnforceError::Malformed(msg) => PipelineError::MalformedQuery(msg),
            EnforceError::ForbiddenTenant(tenant) => PipelineError::ForbiddenTenant(tenant),
            EnforceError::EmptyTenantSet => PipelineError::NoTenants,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            PipelineError::MissingAuthorization.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(PipelineError::NoTenants.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            PipelineError::ForbiddenTenant("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            PipelineError::MalformedQuery("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PipelineError::UpstreamTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn upstream_detail_never_reaches_the_body() {
        let err = PipelineError::UpstreamUnreachable {
            detail: "tcp connect to 10.0.0.9:9091 refused".into(),
        };
        assert_eq!(err.to_string(), "upstream error");
        assert!(err.detail().unwrap().contains("10.0.0.9"));
    }

    #[test]
    fn forbidden_tenant_names_the_offender() {
        let err = PipelineError::from(EnforceError::ForbiddenTenant("team-x".into()));
        assert_eq!(err.to_string(), "forbidden tenant: team-x");
    }
}
