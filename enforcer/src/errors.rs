use thiserror::Error;

/// Why an expression could not be enforced. The proxy maps these onto
/// HTTP statuses: `Malformed` is the caller's 400, the other two are 403.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnforceError {
    #[error("{0}")]
    Malformed(String),

    /// The inbound query constrains the tenant label to a value outside
    /// the caller's set. Carries the first offending tenant.
    #[error("forbidden tenant: {0}")]
    ForbiddenTenant(String),

    #[error("no tenants")]
    EmptyTenantSet,
}
