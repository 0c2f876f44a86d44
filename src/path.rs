//! Parser for heap path expressions.
//!
//! ```text
//! path     := step ('.' step)*
//! step     := target? ('?' view)? ('[' selector ']')? ('(' '+'? pattern ')')?
//! target   := identifier | '*'
//! selector := '*' | integer | subpath '=' literal
//! ```
//!
//! A step without a target applies to the current element, so `[*]` or
//! `?entrySet` may open a path.

use std::fmt;
use std::str::FromStr;

use crate::error::{QueryError, QueryResult};
use crate::pattern::ClassPattern;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Current,
    Field(String),
    AnyField,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Index(i64),
    Match { key: Vec<String>, literal: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeFilter {
    pub pattern: ClassPattern,
    /// Keep candidates that can reach a matching instance, not only
    /// candidates that match themselves.
    pub reachable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub text: String,
    pub target: Target,
    pub view: Option<String>,
    pub selector: Option<Selector>,
    pub filter: Option<TypeFilter>,
}

/// A parsed path, reusable across any number of evaluations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapPath {
    source: String,
    steps: Vec<Step>,
}

impl HeapPath {
    pub fn parse(source: &str) -> QueryResult<Self> {
        Parser::new(source).path()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

impl FromStr for HeapPath {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for HeapPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

struct Parser<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            pos: 0,
        }
    }

    fn error(&self, position: usize, message: impl Into<String>) -> QueryError {
        QueryError::Syntax {
            path: self.source.to_string(),
            position,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|(i, _)| *i)
            .unwrap_or(self.source.len())
    }

    fn path(mut self) -> QueryResult<HeapPath> {
        if self.source.trim().is_empty() {
            return Err(self.error(0, "empty path"));
        }
        let mut steps = Vec::new();
        loop {
            steps.push(self.step()?);
            match self.peek() {
                None => break,
                Some('.') => {
                    self.pos += 1;
                    if self.peek().is_none() {
                        return Err(self.error(self.offset(), "path ends with '.'"));
                    }
                }
                Some(c) => {
                    return Err(self.error(self.offset(), format!("unexpected character '{c}'")));
                }
            }
        }
        Ok(HeapPath {
            source: self.source.to_string(),
            steps,
        })
    }

    fn identifier(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek().filter(|c| is_ident_char(*c)) {
            out.push(c);
            self.pos += 1;
        }
        out
    }

    /// Reads up to the matching `close`, honoring quotes; returns the inner
    /// text and its starting offset.
    fn delimited(&mut self, close: char) -> QueryResult<(String, usize)> {
        let open_at = self.offset();
        self.pos += 1;
        let start = self.offset();
        let mut quote: Option<char> = None;
        while let Some(c) = self.peek() {
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (None, '\'' | '"') => quote = Some(c),
                (None, c) if c == close => {
                    let inner = self.source[start..self.offset()].to_string();
                    self.pos += 1;
                    return Ok((inner, start));
                }
                _ => {}
            }
            self.pos += 1;
        }
        Err(self.error(open_at, format!("missing '{close}'")))
    }

    fn step(&mut self) -> QueryResult<Step> {
        let start = self.offset();

        let target = match self.peek() {
            Some('*') => {
                self.pos += 1;
                Target::AnyField
            }
            Some(c) if is_ident_char(c) => Target::Field(self.identifier()),
            _ => Target::Current,
        };

        let mut view = None;
        if self.peek() == Some('?') {
            self.pos += 1;
            let at = self.offset();
            let name = self.identifier();
            if name.is_empty() {
                return Err(self.error(at, "view name expected after '?'"));
            }
            view = Some(name);
        }

        let mut selector = None;
        if self.peek() == Some('[') {
            let (inner, at) = self.delimited(']')?;
            selector = Some(self.selector(&inner, at)?);
        }

        let mut filter = None;
        if self.peek() == Some('(') {
            let (inner, at) = self.delimited(')')?;
            filter = Some(self.filter(&inner, at)?);
        }

        let end = self.offset();
        if end == start {
            let message = match self.peek() {
                Some(c) => format!("step expected, found '{c}'"),
                None => "step expected".to_string(),
            };
            return Err(self.error(start, message));
        }

        Ok(Step {
            text: self.source[start..end].to_string(),
            target,
            view,
            selector,
            filter,
        })
    }

    fn selector(&self, inner: &str, at: usize) -> QueryResult<Selector> {
        let trimmed = inner.trim();
        if trimmed == "*" {
            return Ok(Selector::All);
        }
        if let Ok(index) = trimmed.parse::<i64>() {
            return Ok(Selector::Index(index));
        }
        let Some((key, literal)) = trimmed.split_once('=') else {
            return Err(self.error(at, format!("invalid selector '[{inner}]'")));
        };
        let key: Vec<String> = key.trim().split('.').map(str::to_string).collect();
        if key
            .iter()
            .any(|k| k.is_empty() || !k.chars().all(is_ident_char))
        {
            return Err(self.error(at, format!("invalid selector key in '[{inner}]'")));
        }
        Ok(Selector::Match {
            key,
            literal: unquote(literal.trim()).to_string(),
        })
    }

    fn filter(&self, inner: &str, at: usize) -> QueryResult<TypeFilter> {
        let trimmed = inner.trim();
        let (reachable, pattern) = match trimmed.strip_prefix('+') {
            Some(rest) => (true, rest.trim()),
            None => (false, trimmed),
        };
        let valid = |c: char| is_ident_char(c) || matches!(c, '.' | '*' | '[' | ']');
        if pattern.is_empty()
            || !pattern.chars().all(valid)
            || pattern.split('.').any(str::is_empty)
        {
            return Err(self.error(at, format!("invalid class pattern '({inner})'")));
        }
        Ok(TypeFilter {
            pattern: ClassPattern::compile(pattern),
            reachable,
        })
    }
}

fn unquote(literal: &str) -> &str {
    for q in ['\'', '"'] {
        if literal.len() >= 2 && literal.starts_with(q) && literal.ends_with(q) {
            return &literal[1..literal.len() - 1];
        }
    }
    literal
}
