use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A label selector in its string form, e.g. `app=web,tier in (a,b),!canary`.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    expressions: Expressions,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid label selector {0:?}")]
pub struct InvalidSelector(pub String);

// === Selector ===

impl Selector {
    pub fn from_expressions(expressions: Expressions) -> Self {
        Self { expressions }
    }

    pub fn from_map(map: Map) -> Self {
        map.into_iter()
            .map(|(k, v)| Expression::new(k, Operator::In, Some(v)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    /// An empty selector matches everything.
    pub fn matches(&self, labels: &Map) -> bool {
        self.expressions.iter().all(|expr| expr.matches(labels))
    }
}

impl FromStr for Selector {
    type Err = InvalidSelector;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidSelector(s.to_string());
        let mut expressions = Vec::new();
        for req in split_requirements(s) {
            let req = req.trim();
            if req.is_empty() {
                continue;
            }

            if let Some(key) = req.strip_prefix('!') {
                let key = valid_key(key).ok_or_else(invalid)?;
                expressions.push(Expression::new(key, Operator::DoesNotExist, None::<&str>));
            } else if let Some(open) = req.find('(') {
                let close = req.rfind(')').filter(|c| *c > open).ok_or_else(invalid)?;
                let mut head = req[..open].split_whitespace();
                let key = head.next().and_then(valid_key).ok_or_else(invalid)?;
                let operator = match head.next() {
                    Some("in") => Operator::In,
                    Some("notin") => Operator::NotIn,
                    _ => return Err(invalid()),
                };
                let values = req[open + 1..close]
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(String::from);
                expressions.push(Expression::new(key, operator, values));
            } else if let Some((key, value)) = req.split_once("!=") {
                let key = valid_key(key).ok_or_else(invalid)?;
                expressions.push(Expression::new(key, Operator::NotIn, Some(value.trim())));
            } else if let Some((key, value)) = req.split_once('=') {
                let key = valid_key(key).ok_or_else(invalid)?;
                let value = value.strip_prefix('=').unwrap_or(value).trim();
                expressions.push(Expression::new(key, Operator::In, Some(value)));
            } else {
                let key = valid_key(req).ok_or_else(invalid)?;
                expressions.push(Expression::new(key, Operator::Exists, None::<&str>));
            }
        }
        Ok(Self { expressions })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, expr) in self.expressions.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            fmt::Display::fmt(expr, f)?;
        }
        Ok(())
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

/// Splits on commas that are not inside a parenthesized value set.
fn split_requirements(s: &str) -> Vec<&str> {
    let mut reqs = Vec::new();
    let (mut depth, mut start) = (0usize, 0usize);
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                reqs.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    reqs.push(&s[start..]);
    reqs
}

fn valid_key(key: &str) -> Option<&str> {
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some(key)
}

// === Expression ===

impl Expression {
    pub fn new<V: Into<String>>(
        key: impl Into<String>,
        operator: Operator,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => labels.get(&self.key).is_some_and(|v| self.values.contains(v)),
            Operator::NotIn => !labels.get(&self.key).is_some_and(|v| self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match (self.operator, self.values.len()) {
            (Operator::In, 1) => write!(f, "{}={}", self.key, values()),
            (Operator::In, _) => write!(f, "{} in ({})", self.key, values()),
            (Operator::NotIn, 1) => write!(f, "{}!={}", self.key, values()),
            (Operator::NotIn, _) => write!(f, "{} notin ({})", self.key, values()),
            (Operator::Exists, _) => f.write_str(&self.key),
            (Operator::DoesNotExist, _) => write!(f, "!{}", self.key),
        }
    }
}
