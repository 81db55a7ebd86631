use crate::errors::EnforceError;
use std::collections::BTreeSet;

/// The set of tenants a caller may query. `All` is the admin sentinel:
/// enforcement is skipped and the query forwarded untouched.
///
/// Named tenants are kept ordered so regex alternations come out
/// deterministic without a sort at emission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantSet {
    All,
    Names(BTreeSet<String>),
}

/// The matcher an enforcement pass must impose on the tenant label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelMatch {
    /// Exactly one tenant: an `=` matcher.
    Equality(String),
    /// Several tenants: an `=~` matcher over a `|` alternation.
    Regex(String),
}

impl TenantSet {
    pub fn all() -> Self {
        TenantSet::All
    }

    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TenantSet::Names(names.into_iter().map(Into::into).collect())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, TenantSet::All)
    }

    /// True when the caller has access to nothing. The admin sentinel is
    /// never empty.
    pub fn is_empty(&self) -> bool {
        match self {
            TenantSet::All => false,
            TenantSet::Names(names) => names.is_empty(),
        }
    }

    pub fn contains(&self, tenant: &str) -> bool {
        match self {
            TenantSet::All => true,
            TenantSet::Names(names) => names.contains(tenant),
        }
    }

    /// Computes the matcher to impose, given the value of any tenant
    /// matcher already present in the inbound query.
    ///
    /// An inbound value is split on `|`; every member must be in this
    /// set or the whole request is rejected with the first offender.
    /// With no inbound constraint the full set applies. Returns `None`
    /// for the admin sentinel.
    pub fn constrain(&self, inbound: Option<&str>) -> Result<Option<LabelMatch>, EnforceError> {
        let names = match self {
            TenantSet::All => return Ok(None),
            TenantSet::Names(names) => names,
        };
        if names.is_empty() {
            return Err(EnforceError::EmptyTenantSet);
        }

        let effective: BTreeSet<&str> = match inbound {
            Some(value) => {
                let requested: Vec<&str> = value.split('|').collect();
                if let Some(denied) = requested.iter().find(|q| !names.contains(**q)) {
                    return Err(EnforceError::ForbiddenTenant(denied.to_string()));
                }
                requested.into_iter().collect()
            }
            None => names.iter().map(String::as_str).collect(),
        };

        let mut iter = effective.iter();
        let first = iter.next().expect("effective set is never empty");
        Ok(Some(if iter.next().is_none() {
            LabelMatch::Equality(first.to_string())
        } else {
            LabelMatch::Regex(
                effective
                    .iter()
                    .copied()
                    .collect::<Vec<_>>()
                    .join("|"),
            )
        }))
    }
}

impl<S: Into<String>> FromIterator<S> for TenantSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        TenantSet::names(iter)
    }
}
