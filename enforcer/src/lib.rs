//! Tenant-label enforcement for PromQL and LogQL query expressions.
//!
//! Both enforcers take a query, the configured tenant label, and the
//! caller's [`TenantSet`], and return an equivalent query whose tenant
//! label is constrained to an authorised subset. A query that already
//! constrains the tenant label to something outside the set is rejected,
//! never narrowed.

pub mod logql;
pub mod promql;

mod errors;
mod tenants;

pub use errors::EnforceError;
pub use tenants::{LabelMatch, TenantSet};
