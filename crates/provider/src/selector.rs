//! Equality- and set-based label selectors.
//!
//! Supports the selector shapes the metric consumers actually use:
//! `k=v`, `k==v`, `k!=v`, `k in (a,b)`, `k notin (a,b)`, `k` (exists) and
//! `!k` (not exists), joined by commas.

use std::collections::HashMap;

use thiserror::Error;

/// The selector string could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid label selector: {0}")]
pub struct SelectorError(String);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Eq(String, String),
    NotEq(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    fn matches(&self, labels: &HashMap<String, String>) -> bool {
        match self {
            Requirement::Eq(key, value) => labels.get(key) == Some(value),
            Requirement::NotEq(key, value) => labels.get(key) != Some(value),
            Requirement::In(key, values) => {
                labels.get(key).is_some_and(|v| values.contains(v))
            }
            Requirement::NotIn(key, values) => {
                !labels.get(key).is_some_and(|v| values.contains(v))
            }
            Requirement::Exists(key) => labels.contains_key(key),
            Requirement::NotExists(key) => !labels.contains_key(key),
        }
    }
}

/// A parsed label selector; matches when every requirement holds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// The selector that matches every label set.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Parses a comma-joined requirement list. An empty string selects
    /// everything.
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let mut requirements = Vec::new();
        for part in split_requirements(input) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(part)?);
        }
        Ok(Self { requirements })
    }

    /// Whether `labels` satisfies every requirement.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

/// Splits on commas at parenthesis depth zero, so `k in (a,b)` stays whole.
fn split_requirements(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (index, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&input[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn parse_requirement(part: &str) -> Result<Requirement, SelectorError> {
    if let Some(key) = part.strip_prefix('!') {
        let key = key.trim();
        if key.is_empty() {
            return Err(SelectorError(part.to_owned()));
        }
        return Ok(Requirement::NotExists(key.to_owned()));
    }

    if let Some((key, value)) = part.split_once("!=") {
        return Ok(Requirement::NotEq(
            nonempty_key(key, part)?,
            value.trim().to_owned(),
        ));
    }

    // " notin " before " in ", since the former contains the latter.
    if let Some((key, values)) = split_set_op(part, " notin ") {
        return Ok(Requirement::NotIn(
            nonempty_key(key, part)?,
            parse_values(values, part)?,
        ));
    }
    if let Some((key, values)) = split_set_op(part, " in ") {
        return Ok(Requirement::In(
            nonempty_key(key, part)?,
            parse_values(values, part)?,
        ));
    }

    if let Some((key, value)) = part.split_once("==").or_else(|| part.split_once('=')) {
        return Ok(Requirement::Eq(
            nonempty_key(key, part)?,
            value.trim().to_owned(),
        ));
    }

    // Bare key: existence requirement.
    if part.contains(char::is_whitespace) {
        return Err(SelectorError(part.to_owned()));
    }
    Ok(Requirement::Exists(part.to_owned()))
}

fn split_set_op<'a>(part: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let index = part.find(op)?;
    Some((&part[..index], &part[index + op.len()..]))
}

fn nonempty_key(key: &str, part: &str) -> Result<String, SelectorError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(SelectorError(part.to_owned()));
    }
    Ok(key.to_owned())
}

fn parse_values(values: &str, part: &str) -> Result<Vec<String>, SelectorError> {
    let values = values.trim();
    let inner = values
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(|| SelectorError(part.to_owned()))?;
    Ok(inner
        .split(',')
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect())
}
