use serde::{Deserialize, Serialize, de};
use thiserror::Error;

/// The longest target name that will be accepted.
const MAX_LENGTH: usize = 128;

/// The name of a container or network to back up. Only accepts
/// `[a-zA-Z0-9_.-]` and must start with an alphanumeric character.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetName {
    name: String,
}

impl TargetName {
    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Consume the name, returning the inner string.
    pub fn into_string(self) -> String {
        self.name
    }
}

impl TryFrom<&str> for TargetName {
    type Error = TargetNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let Some(first) = value.chars().next() else {
            return Err(Self::Error::Empty);
        };

        // Check length
        if value.len() > MAX_LENGTH {
            return Err(Self::Error::TooLong(value.len(), MAX_LENGTH));
        }

        if !first.is_ascii_alphanumeric() {
            return Err(Self::Error::Invalid(0, first));
        }

        // All characters must be valid
        if let Some((index, character)) = value
            .chars()
            .enumerate()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(Self::Error::Invalid(index, character));
        }

        Ok(Self {
            name: value.to_string(),
        })
    }
}

impl TryFrom<String> for TargetName {
    type Error = TargetNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl core::str::FromStr for TargetName {
    type Err = TargetNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

impl AsRef<str> for TargetName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl core::fmt::Debug for TargetName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("TargetName").field(&self.name).finish()
    }
}

impl core::fmt::Display for TargetName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for TargetName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let string: String = Deserialize::deserialize(deserializer)?;
        Self::try_from(string).map_err(de::Error::custom)
    }
}

impl Serialize for TargetName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.name)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetNameError {
    /// `length, limit`
    #[error("Target name was too long {0} > {1}")]
    TooLong(usize, usize),

    #[error("Target name was empty")]
    Empty,

    /// `index, char`
    #[error("Invalid character at index {0}: '{1}', may only contain [a-zA-Z0-9_.-]")]
    Invalid(usize, char),
}
