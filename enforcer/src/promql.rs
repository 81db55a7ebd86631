//! PromQL enforcement pass.
//!
//! The grammar is the parser library's problem; this module only walks
//! the AST, treats vector selectors as leaves, and rewrites their
//! matcher lists. Everything else is carried through and re-emitted.

use crate::errors::EnforceError;
use crate::tenants::{LabelMatch, TenantSet};
use promql_parser::label::{MatchOp, Matcher};
use promql_parser::parser::{self, Expr, VectorSelector};
use regex::Regex;

/// Rewrites `query` so every vector selector constrains `tenant_label`
/// to a subset of `tenants`. Admin callers get the input back unchanged.
pub fn enforce(
    query: &str,
    tenant_label: &str,
    tenants: &TenantSet,
) -> Result<String, EnforceError> {
    if tenants.is_all() {
        return Ok(query.to_string());
    }

    let mut expr = parser::parse(query).map_err(EnforceError::Malformed)?;

    let inbound = tenant_value(&mut expr, tenant_label);
    let matched = tenants
        .constrain(inbound.as_deref())?
        .expect("non-admin set always yields a matcher");
    let matcher = build_matcher(tenant_label, &matched)?;

    for_each_selector(&mut expr, &mut |vs| {
        impose(&mut vs.matchers.matchers, tenant_label, &matcher);
    });

    Ok(expr.to_string())
}

/// The value of the last tenant-label matcher seen across all selectors,
/// if any. Later selectors win, matching the flat-map semantics of the
/// collection step.
fn tenant_value(expr: &mut Expr, tenant_label: &str) -> Option<String> {
    let mut value = None;
    for_each_selector(expr, &mut |vs| {
        for m in &vs.matchers.matchers {
            if m.name == tenant_label {
                value = Some(m.value.clone());
            }
        }
    });
    value
}

fn build_matcher(tenant_label: &str, matched: &LabelMatch) -> Result<Matcher, EnforceError> {
    let (op, value) = match matched {
        LabelMatch::Equality(value) => (MatchOp::Equal, value.clone()),
        LabelMatch::Regex(value) => {
            let re = Regex::new(value)
                .map_err(|e| EnforceError::Malformed(format!("invalid tenant alternation: {e}")))?;
            (MatchOp::Re(re), value.clone())
        }
    };
    Ok(Matcher {
        op,
        name: tenant_label.to_string(),
        value,
    })
}

/// Replaces the first tenant matcher in place (dropping any duplicates)
/// or appends one. Non-tenant matchers keep their order.
fn impose(matchers: &mut Vec<Matcher>, tenant_label: &str, matcher: &Matcher) {
    let mut replaced = false;
    matchers.retain_mut(|m| {
        if m.name == tenant_label {
            if replaced {
                return false;
            }
            *m = matcher.clone();
            replaced = true;
        }
        true
    });
    if !replaced {
        matchers.push(matcher.clone());
    }
}

/// Visits every vector selector in the expression, including those
/// buried in matrix selectors, subqueries, function arguments, and
/// aggregation parameters.
fn for_each_selector<F>(expr: &mut Expr, visit: &mut F)
where
    F: FnMut(&mut VectorSelector),
{
    match expr {
        Expr::VectorSelector(vs) => visit(vs),
        Expr::MatrixSelector(ms) => visit(&mut ms.vs),
        Expr::Aggregate(agg) => {
            if let Some(param) = agg.param.as_mut() {
                for_each_selector(param, visit);
            }
            for_each_selector(&mut agg.expr, visit);
        }
        Expr::Unary(unary) => for_each_selector(&mut unary.expr, visit),
        Expr::Binary(binary) => {
            for_each_selector(&mut binary.lhs, visit);
            for_each_selector(&mut binary.rhs, visit);
        }
        Expr::Paren(paren) => for_each_selector(&mut paren.expr, visit),
        Expr::Subquery(subquery) => for_each_selector(&mut subquery.expr, visit),
        Expr::Call(call) => {
            for arg in call.args.args.iter_mut() {
                for_each_selector(arg, visit);
            }
        }
        // Literals carry no selectors.
        _ => {}
    }
}
