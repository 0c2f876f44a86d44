//! Dot-segment glob matching for class names.
//!
//! `**` matches any number of whole segments (including none), `*` alone
//! matches exactly one segment, and `*` inside a segment matches any run of
//! characters within that segment.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    AnySegments,
    AnySegment,
    Glob(Vec<String>),
    Literal(String),
}

impl Segment {
    fn parse(raw: &str) -> Self {
        match raw {
            "**" => Segment::AnySegments,
            "*" => Segment::AnySegment,
            s if s.contains('*') => Segment::Glob(s.split('*').map(str::to_string).collect()),
            s => Segment::Literal(s.to_string()),
        }
    }

    fn matches_one(&self, segment: &str) -> bool {
        match self {
            Segment::AnySegments | Segment::AnySegment => true,
            Segment::Literal(lit) => lit == segment,
            Segment::Glob(parts) => glob_match(parts, segment),
        }
    }
}

/// `parts` are the literal pieces between `*` wildcards.
fn glob_match(parts: &[String], text: &str) -> bool {
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return text.is_empty(),
    };
    let Some(mut remaining) = text.strip_prefix(first.as_str()) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };
    for part in middle {
        match remaining.find(part.as_str()) {
            Some(pos) => remaining = &remaining[pos + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last.as_str())
}

/// A compiled class-name pattern such as `**.DummyA` or `java.util.*Map`.
#[derive(Clone, PartialEq, Eq)]
pub struct ClassPattern {
    source: String,
    segments: Vec<Segment>,
}

impl ClassPattern {
    pub fn compile(pattern: &str) -> Self {
        Self {
            source: pattern.to_string(),
            segments: pattern.split('.').map(Segment::parse).collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, class_name: &str) -> bool {
        let names: Vec<&str> = class_name.split('.').collect();
        match_segments(&self.segments, &names)
    }
}

fn match_segments(pattern: &[Segment], names: &[&str]) -> bool {
    match pattern.split_first() {
        None => names.is_empty(),
        Some((Segment::AnySegments, rest)) => {
            (0..=names.len()).any(|skip| match_segments(rest, &names[skip..]))
        }
        Some((segment, rest)) => match names.split_first() {
            Some((name, tail)) => segment.matches_one(name) && match_segments(rest, tail),
            None => false,
        },
    }
}

impl fmt::Debug for ClassPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassPattern({})", self.source)
    }
}

impl fmt::Display for ClassPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
