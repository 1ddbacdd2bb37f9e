use std::fmt;

use chrono::NaiveDateTime;

/// `_YYYYMMDD_HHMMSS`
const SUFFIX_LEN: usize = 16;
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("instance name must be non-empty")]
    EmptyName,
    #[error("invalid instance name: {0:?} (allowed: ASCII letters, digits, '-', '_', '.')")]
    InvalidName(String),
    #[error("malformed instance id: {0:?}")]
    Malformed(String),
}

/// Logical, user-chosen name an instance runs under.
///
/// Names double as directory-name prefixes, so they are restricted to a
/// filesystem-safe alphabet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceName(String);

impl InstanceName {
    /// The name is taken verbatim: surrounding whitespace is rejected rather
    /// than trimmed, so every command resolves the same spelling.
    pub fn new(raw: &str) -> Result<Self, IdError> {
        if raw.is_empty() {
            return Err(IdError::EmptyName);
        }
        if raw == "." || raw == ".." {
            return Err(IdError::InvalidName(raw.to_string()));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(IdError::InvalidName(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one run: `<name>_<YYYYMMDD>_<HHMMSS>` in local time.
///
/// For a fixed name, string order is chronological order. Two starts of the
/// same name within one second mint the same id.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct InstanceId(pub String);

/// An id split back into its owner name and start second.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInstanceId {
    pub name: String,
    pub started: NaiveDateTime,
}

impl InstanceId {
    pub fn mint(name: &InstanceName, now: NaiveDateTime) -> Self {
        Self(format!("{}_{}", name.as_str(), now.format(TIMESTAMP_FORMAT)))
    }

    /// Strict parse: the id must end in `_` + 8 digits + `_` + 6 digits that
    /// form a real calendar timestamp, preceded by a non-empty name.
    pub fn parse(raw: &str) -> Result<ParsedInstanceId, IdError> {
        let malformed = || IdError::Malformed(raw.to_string());

        let bytes = raw.as_bytes();
        if bytes.len() <= SUFFIX_LEN {
            return Err(malformed());
        }
        let split = bytes.len() - SUFFIX_LEN;
        let suffix = &bytes[split..];
        let shape_ok = suffix.iter().enumerate().all(|(i, b)| match i {
            0 | 9 => *b == b'_',
            _ => b.is_ascii_digit(),
        });
        if !shape_ok {
            return Err(malformed());
        }

        // The suffix is pure ASCII, so `split` is a char boundary.
        let (name, stamp) = raw.split_at(split);
        let started =
            NaiveDateTime::parse_from_str(&stamp[1..], TIMESTAMP_FORMAT).map_err(|_| malformed())?;

        Ok(ParsedInstanceId {
            name: name.to_string(),
            started,
        })
    }

    pub fn owner_name(&self) -> Option<String> {
        Self::parse(&self.0).ok().map(|p| p.name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
