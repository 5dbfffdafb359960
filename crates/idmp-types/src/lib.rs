//! Validated text primitives shared across the IDMP registry crates.
//!
//! Every type here is checked once at construction so downstream code can rely on its shape:
//! - [`NonEmptyText`] for titles, names and free text that must carry content
//! - [`ResourceKey`] for the human key of a stored resource (one path segment)
//! - [`Location`] for the parent folder path a resource lives under

use std::fmt;

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,

    /// The input text is not a valid resource key
    #[error("invalid resource key '{0}': keys are a single path segment")]
    InvalidKey(String),

    /// The input text is not a valid location path
    #[error("invalid location '{0}': {1}")]
    InvalidLocation(String, &'static str),
}

/// A string type that guarantees non-empty content.
///
/// This type wraps a `String` and ensures it contains at least one non-whitespace character.
/// The input is automatically trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// The input is trimmed of leading and trailing whitespace. If the trimmed
    /// result is empty, an error is returned.
    ///
    /// # Errors
    ///
    /// Returns `Err(TextError::Empty)` if the input is empty or contains only whitespace.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The human key of a stored resource, unique within its parent location.
///
/// Keys are a single path segment: trimmed, non-empty, and free of `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Validates and wraps a resource key.
    ///
    /// # Errors
    ///
    /// Returns [`TextError::Empty`] for blank input and [`TextError::InvalidKey`] when the key
    /// contains a `/` or is one of the relative segments `.` and `..`.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        if trimmed.contains('/') || trimmed == "." || trimmed == ".." {
            return Err(TextError::InvalidKey(trimmed.to_owned()));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An absolute folder path such as `/IDMP/Substances`.
///
/// Construction normalises the input: a leading `/` is required, a trailing `/` is dropped and
/// empty or relative segments are rejected. The root location is `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location(String);

impl Location {
    /// Validates and normalises a location path.
    ///
    /// # Errors
    ///
    /// Returns [`TextError::InvalidLocation`] if the path is not absolute or contains empty,
    /// `.` or `..` segments.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let raw = input.as_ref().trim();
        if raw.is_empty() {
            return Err(TextError::Empty);
        }
        if !raw.starts_with('/') {
            return Err(TextError::InvalidLocation(
                raw.to_owned(),
                "must start with '/'",
            ));
        }
        if raw == "/" {
            return Ok(Self::root());
        }

        let body = raw.trim_end_matches('/');
        for segment in body[1..].split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(TextError::InvalidLocation(
                    raw.to_owned(),
                    "contains an empty or relative segment",
                ));
            }
        }
        Ok(Self(body.to_owned()))
    }

    /// The root location `/`.
    pub fn root() -> Self {
        Self("/".to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full path of `key` inside this location.
    pub fn path_of(&self, key: &ResourceKey) -> String {
        if self.0 == "/" {
            format!("/{}", key.as_str())
        } else {
            format!("{}/{}", self.0, key.as_str())
        }
    }

    /// Splits a full resource path into its parent location and key.
    ///
    /// # Errors
    ///
    /// Returns a [`TextError`] if either half is invalid.
    pub fn split_path(path: &str) -> Result<(Location, ResourceKey), TextError> {
        let trimmed = path.trim().trim_end_matches('/');
        let (parent, key) = trimmed.rsplit_once('/').ok_or_else(|| {
            TextError::InvalidLocation(path.to_owned(), "must start with '/'")
        })?;
        let parent = if parent.is_empty() {
            Location::root()
        } else {
            Location::new(parent)?
        };
        Ok((parent, ResourceKey::new(key)?))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_serde {
    ($ty:ident) => {
        impl serde::Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                $ty::new(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(NonEmptyText);
string_serde!(ResourceKey);
string_serde!(Location);
