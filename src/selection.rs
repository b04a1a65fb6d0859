//! Which registers to bridge.
//!
//! A selection is a disjunction of terms separated by whitespace or `|`:
//!
//! * `circuit:message` or `circuit:message:field` selects a single register. `field` is either
//!   the index of the field (ignored fields not counted) or its name and defaults to `0`;
//! * a term containing `*`, `?` or `[` is a glob;
//! * a term enclosed in slashes (`/…/`) is a regular expression and may not contain whitespace.
//!   A regular expression that contains `|` itself must be a whole whitespace-separated token.
//!
//! Globs and regular expressions are matched case-insensitively against both
//! `circuit:message:index` and `circuit:message:name` of every field ebusd knows about.
use std::fmt;
use std::sync::Arc;

use crate::schema::canonical_key;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{1}` is not a valid regular expression")]
    Regex(#[source] regex::Error, String),
    #[error("`{1}` is not a valid glob pattern")]
    Glob(#[source] glob::PatternError, String),
}

/// Decides whether a `circuit:message:field` key is selected.
pub trait RegisterMatcher: fmt::Debug + Send + Sync {
    fn matches(&self, key: &str) -> bool;
}

/// Case-insensitive comparison against a fixed list of keys.
#[derive(Debug, Default)]
pub struct ExactMatcher(Vec<String>);

impl ExactMatcher {
    pub fn new(keys: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self(keys.into_iter().map(|k| k.as_ref().to_lowercase()).collect())
    }
}

impl RegisterMatcher for ExactMatcher {
    fn matches(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.0.iter().any(|k| *k == key)
    }
}

#[derive(Debug)]
pub struct GlobMatcher(glob::Pattern);

impl GlobMatcher {
    pub fn new(pattern: &str) -> Result<Self, Error> {
        glob::Pattern::new(pattern)
            .map(Self)
            .map_err(|e| Error::Glob(e, pattern.to_string()))
    }
}

impl RegisterMatcher for GlobMatcher {
    fn matches(&self, key: &str) -> bool {
        let options = glob::MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        self.0.matches_with(key, options)
    }
}

#[derive(Debug)]
pub struct RegexMatcher(regex::Regex);

impl RegexMatcher {
    pub fn new(pattern: &str) -> Result<Self, Error> {
        regex::RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map(Self)
            .map_err(|e| Error::Regex(e, pattern.to_string()))
    }
}

impl RegisterMatcher for RegexMatcher {
    fn matches(&self, key: &str) -> bool {
        self.0.is_match(key)
    }
}

#[derive(Debug)]
struct Everything;

impl RegisterMatcher for Everything {
    fn matches(&self, _: &str) -> bool {
        true
    }
}

/// How a literal term refers to its field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldRef {
    Index(usize),
    /// Canonical (lower-case) field name.
    Name(String),
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldRef::Index(i) => write!(f, "{i}"),
            FieldRef::Name(n) => f.write_str(n),
        }
    }
}

/// A literal `circuit:message[:field]` term, normalized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterPath {
    pub circuit: String,
    pub message: String,
    pub field: FieldRef,
}

impl RegisterPath {
    /// Parse a literal term. `None` if it doesn't have two or three non-empty segments.
    pub fn parse(term: &str) -> Option<RegisterPath> {
        let segments = term.split(':').map(canonical_key).collect::<Vec<_>>();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        let field = match segments.get(2) {
            None => FieldRef::Index(0),
            Some(field) => match field.parse::<usize>() {
                Ok(index) => FieldRef::Index(index),
                Err(_) => FieldRef::Name(field.clone()),
            },
        };
        match segments.as_slice() {
            [circuit, message] | [circuit, message, _] => Some(RegisterPath {
                circuit: circuit.clone(),
                message: message.clone(),
                field,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for RegisterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.circuit, self.message, self.field)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Literal {
    Path(RegisterPath),
    /// Kept as written, so that the problem can be reported against it.
    Malformed(String),
}

#[derive(Clone, Debug, Default)]
pub struct Selection {
    pub literals: Vec<Literal>,
    exact: Arc<ExactMatcher>,
    patterns: Vec<Arc<dyn RegisterMatcher>>,
}

impl Selection {
    pub fn parse(expression: &str) -> Result<Selection, Error> {
        let mut literals = Vec::new();
        let mut patterns = Vec::<Arc<dyn RegisterMatcher>>::new();
        for token in expression.split_whitespace() {
            if let Some(regex) = token.strip_prefix('/').and_then(|t| t.strip_suffix('/')) {
                patterns.push(Arc::new(RegexMatcher::new(regex)?));
                continue;
            }
            for term in token.split('|').filter(|t| !t.is_empty()) {
                if let Some(regex) = term.strip_prefix('/').and_then(|t| t.strip_suffix('/')) {
                    patterns.push(Arc::new(RegexMatcher::new(regex)?));
                } else if term.contains(['*', '?', '[']) {
                    patterns.push(Arc::new(GlobMatcher::new(term)?));
                } else {
                    literals.push(match RegisterPath::parse(term) {
                        Some(path) => Literal::Path(path),
                        None => Literal::Malformed(term.to_string()),
                    });
                }
            }
        }
        let exact = ExactMatcher::new(literals.iter().filter_map(|l| match l {
            Literal::Path(p) => Some(p.to_string()),
            Literal::Malformed(_) => None,
        }));
        Ok(Selection { literals, exact: Arc::new(exact), patterns })
    }

    /// Select everything.
    pub fn all() -> Selection {
        Selection {
            literals: Vec::new(),
            exact: Default::default(),
            patterns: vec![Arc::new(Everything) as Arc<dyn RegisterMatcher>],
        }
    }

    pub fn has_patterns(&self) -> bool {
        !self.patterns.is_empty()
    }

    /// Whether a pattern term selects this key.
    pub fn pattern_matches(&self, key: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(key))
    }
}

impl RegisterMatcher for Selection {
    fn matches(&self, key: &str) -> bool {
        self.exact.matches(key) || self.pattern_matches(key)
    }
}
