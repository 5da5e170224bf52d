use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
    sync::Arc,
};

/// Provenance labels attached to a rule.
///
/// Labels never leave the process; they only scope which observed rules a
/// reconcile pass may revoke.
#[derive(Clone, Debug, Eq, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Expression {
    key: String,
    operator: Operator,
    #[serde(default)]
    values: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects the observed rules a reconcile pass is allowed to remove.
///
/// The default selector matches everything.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty requirement in selector")]
    EmptyRequirement,

    #[error("invalid label key {0:?}")]
    InvalidKey(String),

    #[error("missing value list for `{0}`")]
    MissingValues(String),

    #[error("unbalanced parentheses in selector")]
    Unbalanced,
}

// === Selector ===

impl Selector {
    /// A selector that matches every label set.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn is_everything(&self) -> bool {
        self.match_labels.as_ref().map_or(true, Map::is_empty)
            && self.match_expressions.as_ref().map_or(true, Vec::is_empty)
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels.iter() {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }

    fn push(&mut self, expr: Expression) {
        self.match_expressions.get_or_insert_with(Vec::new).push(expr);
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

/// Parses the Kubernetes label selector syntax, e.g.
/// `app=web,tier in (a, b),!legacy`.
impl FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut selector = Selector::default();
        if s.trim().is_empty() {
            return Ok(selector);
        }

        for requirement in split_requirements(s)? {
            let requirement = requirement.trim();
            if requirement.is_empty() {
                return Err(ParseError::EmptyRequirement);
            }

            if let Some(key) = requirement.strip_prefix('!') {
                selector.push(Expression::new(key.trim(), Operator::DoesNotExist, None)?);
            } else if let Some((key, value)) = requirement.split_once("!=") {
                selector.push(Expression::new(
                    key.trim(),
                    Operator::NotIn,
                    Some(value.trim().to_string()),
                )?);
            } else if let Some((key, value)) = requirement
                .split_once("==")
                .or_else(|| requirement.split_once('='))
            {
                let key = validate_key(key.trim())?;
                let value = value.trim().to_string();
                let labels = selector.match_labels.get_or_insert_with(Map::new);
                match labels.get(&key).map(|existing| *existing == value) {
                    None => {
                        labels.insert(key, value);
                    }
                    // Every equality requirement must hold, so a second value
                    // for the same key is kept as its own requirement.
                    Some(false) => {
                        selector.push(Expression::new(&key, Operator::In, Some(value))?);
                    }
                    Some(true) => {}
                }
            } else if let Some((key, values)) = split_set_operator(requirement, " notin ") {
                selector.push(Expression::with_values(key, Operator::NotIn, values)?);
            } else if let Some((key, values)) = split_set_operator(requirement, " in ") {
                selector.push(Expression::with_values(key, Operator::In, values)?);
            } else {
                selector.push(Expression::new(requirement, Operator::Exists, None)?);
            }
        }

        Ok(selector)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| {
            if !std::mem::take(&mut first) {
                f.write_str(",")?;
            }
            Ok::<_, fmt::Error>(())
        };

        for (k, v) in self.match_labels.iter().flatten() {
            sep(f)?;
            write!(f, "{k}={v}")?;
        }
        for expr in self.match_expressions.iter().flatten() {
            sep(f)?;
            fmt::Display::fmt(expr, f)?;
        }
        Ok(())
    }
}

/// Splits a selector on the commas that are not inside a value list.
fn split_requirements(s: &str) -> Result<Vec<&str>, ParseError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or(ParseError::Unbalanced)?,
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ParseError::Unbalanced);
    }
    parts.push(&s[start..]);
    Ok(parts)
}

fn split_set_operator<'r>(requirement: &'r str, op: &str) -> Option<(&'r str, &'r str)> {
    requirement
        .split_once(op)
        .map(|(key, values)| (key.trim(), values.trim()))
}

fn validate_key(key: &str) -> Result<String, ParseError> {
    let valid = !key.is_empty()
        && key.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
        });
    if valid {
        Ok(key.to_string())
    } else {
        Err(ParseError::InvalidKey(key.to_string()))
    }
}

// === Labels ===

impl Labels {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === Expression ===

impl Expression {
    fn new(key: &str, operator: Operator, value: Option<String>) -> Result<Self, ParseError> {
        Ok(Self {
            key: validate_key(key)?,
            operator,
            values: value.into_iter().collect(),
        })
    }

    fn with_values(key: &str, operator: Operator, values: &str) -> Result<Self, ParseError> {
        let values = values
            .strip_prefix('(')
            .and_then(|v| v.strip_suffix(')'))
            .ok_or_else(|| ParseError::MissingValues(key.to_string()))?;
        Ok(Self {
            key: validate_key(key)?,
            operator,
            values: values
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .map_or(false, |v| self.values.contains(v)),
            Operator::NotIn => labels
                .get(&self.key)
                .map_or(true, |v| !self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::In => write!(f, "{} in ({})", self.key, values()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, values()),
            Operator::Exists => f.write_str(&self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}
