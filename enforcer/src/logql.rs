//! LogQL enforcement pass.
//!
//! Only the `{...}` stream selectors are parsed; the line filters,
//! parser stages, and label filters around them are preserved
//! byte-for-byte. Brace groups inside string literals (a line filter
//! matching `"{"` for instance) are not selectors and are left alone.

use crate::errors::EnforceError;
use crate::tenants::{LabelMatch, TenantSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Eq,
    Neq,
    Re,
    NotRe,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchType::Eq => "=",
            MatchType::Neq => "!=",
            MatchType::Re => "=~",
            MatchType::NotRe => "!~",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatchType,
    pub value: String,
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}\"{}\"", self.name, self.op, escape(&self.value))
    }
}

/// One stream selector found in the query: the byte range it occupies
/// (including both braces) and its parsed matcher list.
#[derive(Debug)]
struct Selector {
    start: usize,
    end: usize,
    matchers: Vec<LabelMatcher>,
}

/// Rewrites every stream selector in `query` so `tenant_label` is
/// constrained to a subset of `tenants`. Admin callers get the input
/// back unchanged.
pub fn enforce(
    query: &str,
    tenant_label: &str,
    tenants: &TenantSet,
) -> Result<String, EnforceError> {
    if tenants.is_all() {
        return Ok(query.to_string());
    }

    let selectors = find_selectors(query)?;
    if selectors.is_empty() {
        return Err(EnforceError::Malformed(
            "query has no stream selector".to_string(),
        ));
    }

    let inbound = selectors
        .iter()
        .flat_map(|s| &s.matchers)
        .filter(|m| m.name == tenant_label)
        .next_back()
        .map(|m| m.value.clone());
    let matched = tenants
        .constrain(inbound.as_deref())?
        .expect("non-admin set always yields a matcher");
    let matcher = match matched {
        LabelMatch::Equality(value) => LabelMatcher {
            name: tenant_label.to_string(),
            op: MatchType::Eq,
            value,
        },
        LabelMatch::Regex(value) => LabelMatcher {
            name: tenant_label.to_string(),
            op: MatchType::Re,
            value,
        },
    };

    let mut out = String::with_capacity(query.len() + 32);
    let mut cursor = 0;
    for selector in selectors {
        out.push_str(&query[cursor..selector.start]);
        let mut matchers = selector.matchers;
        impose(&mut matchers, tenant_label, &matcher);
        out.push('{');
        for (i, m) in matchers.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&m.to_string());
        }
        out.push('}');
        cursor = selector.end;
    }
    out.push_str(&query[cursor..]);
    Ok(out)
}

/// Replaces the first tenant matcher in place (dropping duplicates) or
/// appends one. Non-tenant matchers keep their order.
fn impose(matchers: &mut Vec<LabelMatcher>, tenant_label: &str, matcher: &LabelMatcher) {
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

/// Scans the query for top-level brace groups, skipping string literals,
/// and parses each group as a matcher list.
fn find_selectors(query: &str) -> Result<Vec<Selector>, EnforceError> {
    let bytes = query.as_bytes();
    let mut selectors = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => i = skip_quoted(bytes, i)?,
            b'`' => i = skip_raw(bytes, i)?,
            b'{' => {
                let (matchers, end) = parse_selector(query, i)?;
                selectors.push(Selector {
                    start: i,
                    end,
                    matchers,
                });
                i = end;
            }
            _ => i += 1,
        }
    }
    Ok(selectors)
}

/// Parses the matcher list starting at the `{` at `open`. Returns the
/// matchers and the index just past the closing `}`.
fn parse_selector(query: &str, open: usize) -> Result<(Vec<LabelMatcher>, usize), EnforceError> {
    let mut lexer = Lexer {
        bytes: query.as_bytes(),
        pos: open + 1,
    };
    let mut matchers = Vec::new();

    loop {
        lexer.skip_whitespace();
        if lexer.eat(b'}') {
            return Ok((matchers, lexer.pos));
        }
        let name = lexer.ident()?;
        lexer.skip_whitespace();
        let op = lexer.match_op()?;
        lexer.skip_whitespace();
        let value = lexer.string_value()?;
        matchers.push(LabelMatcher { name, op, value });
        lexer.skip_whitespace();
        if lexer.eat(b',') {
            continue;
        }
        if lexer.eat(b'}') {
            return Ok((matchers, lexer.pos));
        }
        return Err(lexer.error("expected ',' or '}' in stream selector"));
    }
}

struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Lexer<'_> {
    fn skip_whitespace(&mut self) {
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.bytes.get(self.pos) == Some(&b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<String, EnforceError> {
        let start = self.pos;
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected label name in stream selector"));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn match_op(&mut self) -> Result<MatchType, EnforceError> {
        if self.eat(b'=') {
            if self.eat(b'~') {
                return Ok(MatchType::Re);
            }
            return Ok(MatchType::Eq);
        }
        if self.eat(b'!') {
            if self.eat(b'=') {
                return Ok(MatchType::Neq);
            }
            if self.eat(b'~') {
                return Ok(MatchType::NotRe);
            }
        }
        Err(self.error("expected one of '=', '!=', '=~', '!~'"))
    }

    fn string_value(&mut self) -> Result<String, EnforceError> {
        match self.bytes.get(self.pos) {
            Some(b'"') => {
                let end = skip_quoted(self.bytes, self.pos)?;
                let raw = &self.bytes[self.pos + 1..end - 1];
                self.pos = end;
                Ok(unescape(&String::from_utf8_lossy(raw)))
            }
            Some(b'`') => {
                let end = skip_raw(self.bytes, self.pos)?;
                let raw = &self.bytes[self.pos + 1..end - 1];
                self.pos = end;
                Ok(String::from_utf8_lossy(raw).into_owned())
            }
            _ => Err(self.error("expected quoted label value")),
        }
    }

    fn error(&self, message: &str) -> EnforceError {
        EnforceError::Malformed(format!("{message} at offset {}", self.pos))
    }
}

/// Index just past the closing quote of the double-quoted string
/// starting at `start`.
fn skip_quoted(bytes: &[u8], start: usize) -> Result<usize, EnforceError> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Ok(i + 1),
            _ => i += 1,
        }
    }
    Err(EnforceError::Malformed(
        "unterminated string literal".to_string(),
    ))
}

/// Same for a backtick raw string, which has no escapes.
fn skip_raw(bytes: &[u8], start: usize) -> Result<usize, EnforceError> {
    match bytes[start + 1..].iter().position(|b| *b == b'`') {
        Some(offset) => Ok(start + 1 + offset + 1),
        None => Err(EnforceError::Malformed(
            "unterminated raw string literal".to_string(),
        )),
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}
