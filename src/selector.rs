//! Label selectors for querying the watch caches.
//!
//! Selectors are [kube::core::Selector] values; this module only adds parsing of the
//! textual form used in list queries, e.g. `app=web,env in (dev,staging),!legacy`.

use std::collections::BTreeSet;

pub use kube::core::Expression;
pub use kube::core::Selector;
pub use kube::core::SelectorExt;

use crate::error::Error;
use crate::error::Result;

/// Parses a comma separated label selector. The empty string selects everything.
pub fn parse(selector: &str) -> Result<Selector> {
    let invalid = |reason: &str| Error::InvalidSelector {
        selector: selector.to_owned(),
        reason: reason.to_owned(),
    };

    split_terms(selector)
        .map_err(invalid)?
        .into_iter()
        .map(|term| parse_term(term).map_err(invalid))
        .collect()
}

/// Splits on top-level commas; commas inside a value set belong to that set.
fn split_terms(selector: &str) -> std::result::Result<Vec<&str>, &'static str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (index, ch) in selector.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or("unbalanced ')'")?,
            ',' if depth == 0 => {
                terms.push(&selector[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unbalanced '('");
    }
    terms.push(&selector[start..]);

    if terms.len() == 1 && terms[0].trim().is_empty() {
        return Ok(Vec::new());
    }
    if terms.iter().any(|term| term.trim().is_empty()) {
        return Err("empty requirement");
    }
    Ok(terms)
}

fn parse_term(term: &str) -> std::result::Result<Expression, &'static str> {
    let term = term.trim();

    if let Some(key) = term.strip_prefix('!') {
        return Ok(Expression::DoesNotExist(parse_key(key)?));
    }

    if let Some(open) = term.find('(') {
        let (head, set) = term.split_at(open);
        let mut words = head.split_whitespace();
        let key = parse_key(words.next().ok_or("missing key")?)?;
        let operator = words.next().ok_or("missing set operator")?;
        if words.next().is_some() {
            return Err("unexpected token before '('");
        }
        let values = parse_set(set)?;
        return match operator {
            "in" => Ok(Expression::In(key, values)),
            "notin" => Ok(Expression::NotIn(key, values)),
            _ => Err("expected 'in' or 'notin'"),
        };
    }

    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Expression::NotEqual(parse_key(key)?, parse_value(value)?));
    }
    if let Some((key, value)) = term.split_once("==") {
        return Ok(Expression::Equal(parse_key(key)?, parse_value(value)?));
    }
    if let Some((key, value)) = term.split_once('=') {
        return Ok(Expression::Equal(parse_key(key)?, parse_value(value)?));
    }

    Ok(Expression::Exists(parse_key(term)?))
}

fn parse_set(set: &str) -> std::result::Result<BTreeSet<String>, &'static str> {
    let inner = set
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or("expected '(values)'")?;
    inner.split(',').map(parse_value).collect()
}

fn parse_key(key: &str) -> std::result::Result<String, &'static str> {
    let key = key.trim();
    if key.is_empty() {
        return Err("missing key");
    }
    if key.chars().any(|c| c.is_whitespace() || "!=(),".contains(c)) {
        return Err("invalid character in key");
    }
    Ok(key.to_owned())
}

fn parse_value(value: &str) -> std::result::Result<String, &'static str> {
    let value = value.trim();
    if value.chars().any(|c| c.is_whitespace() || "!=(),".contains(c)) {
        return Err("invalid character in value");
    }
    Ok(value.to_owned())
}
