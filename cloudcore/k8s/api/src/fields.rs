use std::{collections::BTreeMap, fmt, str::FromStr};

/// Field values an object exposes to field selectors, e.g. `metadata.name`.
pub type Fields = BTreeMap<String, String>;

/// A conjunction of `field=value` / `field!=value` terms.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    terms: Vec<Term>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Term {
    field: String,
    equals: bool,
    value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid field selector {0:?}")]
pub struct InvalidSelector(pub String);

// === impl Selector ===

impl Selector {
    pub fn one_term_equal(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            terms: vec![Term {
                field: field.into(),
                equals: true,
                value: value.into(),
            }],
        }
    }

    /// Adds `field=value` unless an identical term is already present.
    pub fn and_equal(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        let term = Term {
            field: field.into(),
            equals: true,
            value: value.into(),
        };
        if !self.terms.contains(&term) {
            self.terms.push(term);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Missing fields compare as empty strings.
    pub fn matches(&self, fields: &Fields) -> bool {
        self.terms.iter().all(|t| {
            let v = fields.get(&t.field).map(String::as_str).unwrap_or("");
            (v == t.value) == t.equals
        })
    }

    /// Returns the value this selector requires for `field`, if any.
    pub fn required_value(&self, field: &str) -> Option<&str> {
        self.terms
            .iter()
            .find(|t| t.equals && t.field == field)
            .map(|t| t.value.as_str())
    }
}

impl FromStr for Selector {
    type Err = InvalidSelector;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut terms = Vec::new();
        for req in s.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            let (field, equals, value) = if let Some((f, v)) = req.split_once("!=") {
                (f, false, v)
            } else if let Some((f, v)) = req.split_once("==") {
                (f, true, v)
            } else if let Some((f, v)) = req.split_once('=') {
                (f, true, v)
            } else {
                return Err(InvalidSelector(s.to_string()));
            };
            let field = field.trim();
            if field.is_empty() {
                return Err(InvalidSelector(s.to_string()));
            }
            terms.push(Term {
                field: field.to_string(),
                equals,
                value: value.trim().to_string(),
            });
        }
        Ok(Self { terms })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, t) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            let op = if t.equals { "=" } else { "!=" };
            write!(f, "{}{}{}", t.field, op, t.value)?;
        }
        Ok(())
    }
}
