//! FHIR element paths.
//!
//! A field's element path says where its value lives in the resource document:
//!
//! ```text
//! code.text                                        nested object member
//! name[]                                           one array entry per value
//! identifier[system=http://fdasis.nlm.nih.gov].value
//!                                                  array entry carrying a fixed key
//! ```
//!
//! Segments are separated by `.` outside brackets, so discriminator values may contain dots.

use crate::{IdmpError, IdmpResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// How a segment maps onto JSON.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Repeat {
    /// A plain object member.
    Single,
    /// An array; each value gets its own entry.
    Repeated,
    /// An array whose entries for this field carry `key: value`.
    Discriminated { key: String, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub repeat: Repeat,
}

impl Segment {
    pub fn is_repeated(&self) -> bool {
        !matches!(self.repeat, Repeat::Single)
    }

    /// The fixed `(key, value)` pair, for discriminated segments.
    pub fn discriminator(&self) -> Option<(&str, &str)> {
        match &self.repeat {
            Repeat::Discriminated { key, value } => Some((key, value)),
            _ => None,
        }
    }
}

/// A parsed element path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementPath {
    segments: Vec<Segment>,
}

impl ElementPath {
    /// Parse a path.
    ///
    /// # Errors
    ///
    /// Returns [`IdmpError::InvalidInput`] for empty segments, names with characters other
    /// than ASCII letters, digits or `_`, unbalanced brackets and discriminators without `=`.
    pub fn parse(input: &str) -> IdmpResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(invalid(input, "path is empty"));
        }

        let mut segments = Vec::new();
        for raw in split_outside_brackets(input).map_err(|reason| invalid(input, reason))? {
            segments.push(parse_segment(raw).map_err(|reason| invalid(input, reason))?);
        }
        Ok(Self { segments })
    }

    /// The single-segment path naming a top-level member.
    pub fn member(name: &str) -> Self {
        Self {
            segments: vec![Segment {
                name: name.to_owned(),
                repeat: Repeat::Single,
            }],
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Index of the first repeated segment, if any.
    pub fn first_repeated(&self) -> Option<usize> {
        self.segments.iter().position(Segment::is_repeated)
    }

    /// The top-level document member this path starts at.
    pub fn root(&self) -> &str {
        // A parsed path always has at least one segment.
        self.segments.first().map(|s| s.name.as_str()).unwrap_or("")
    }

    pub fn leaf(&self) -> &Segment {
        // Non-empty by construction; see `parse`.
        &self.segments[self.segments.len() - 1]
    }

    /// True when `self` and `other` address the same members, ignoring discriminators.
    pub(crate) fn same_shape(&self, other: &ElementPath) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| a.name == b.name)
    }
}

impl fmt::Display for ElementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(&segment.name)?;
            match &segment.repeat {
                Repeat::Single => {}
                Repeat::Repeated => f.write_str("[]")?,
                Repeat::Discriminated { key, value } => write!(f, "[{key}={value}]")?,
            }
        }
        Ok(())
    }
}

impl FromStr for ElementPath {
    type Err = IdmpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ElementPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ElementPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn invalid(input: &str, reason: &str) -> IdmpError {
    IdmpError::InvalidInput(format!("invalid element path '{input}': {reason}"))
}

fn split_outside_brackets(input: &str) -> Result<Vec<&str>, &'static str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '[' => {
                if depth > 0 {
                    return Err("nested brackets");
                }
                depth += 1;
            }
            ']' => {
                if depth == 0 {
                    return Err("unbalanced ']'");
                }
                depth -= 1;
            }
            '.' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err("unclosed '['");
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn parse_segment(raw: &str) -> Result<Segment, &'static str> {
    let (name, repeat) = match raw.find('[') {
        None => (raw, Repeat::Single),
        Some(open) => {
            if !raw.ends_with(']') {
                return Err("text after ']'");
            }
            let inner = &raw[open + 1..raw.len() - 1];
            let repeat = if inner.is_empty() {
                Repeat::Repeated
            } else {
                let (key, value) = inner
                    .split_once('=')
                    .ok_or("discriminator must be key=value")?;
                if !is_name(key) || value.is_empty() {
                    return Err("discriminator must be key=value");
                }
                Repeat::Discriminated {
                    key: key.to_owned(),
                    value: value.to_owned(),
                }
            };
            (&raw[..open], repeat)
        }
    };

    if !is_name(name) {
        return Err("segment names must be non-empty ASCII identifiers");
    }
    Ok(Segment {
        name: name.to_owned(),
        repeat,
    })
}

fn is_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
