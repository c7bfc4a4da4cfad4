//! Hierarchical node identifiers
//!
//! An identifier is a `/`-separated path such as `/intelcpu/0/temperature/2`.
//! Tokens may not contain spaces or `/`. Ordering is plain ordinal string
//! comparison of the rendered path, which is what the derived `Ord` on the
//! inner string gives us.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CorewatchError, Result};

const SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

fn check_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(CorewatchError::InvalidIdentifier {
            token: token.to_string(),
            reason: "empty token",
        });
    }
    if token.contains(' ') {
        return Err(CorewatchError::InvalidIdentifier {
            token: token.to_string(),
            reason: "contains a space",
        });
    }
    if token.contains(SEPARATOR) {
        return Err(CorewatchError::InvalidIdentifier {
            token: token.to_string(),
            reason: "contains the separator",
        });
    }
    Ok(())
}

impl Identifier {
    /// Build an identifier from tokens, rejecting any that are not path-safe.
    pub fn new<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = String::new();
        for token in tokens {
            let token = token.as_ref();
            check_token(token)?;
            path.push(SEPARATOR);
            path.push_str(token);
        }
        Ok(Identifier(path))
    }

    /// Append tokens to this identifier.
    pub fn extend<I, S>(&self, tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let suffix = Identifier::new(tokens)?;
        Ok(Identifier(format!("{}{}", self.0, suffix.0)))
    }

    /// Append one token built from internal names.
    ///
    /// Callers pass type names and indices, which never carry spaces or
    /// separators; anything else is replaced with `_`.
    pub(crate) fn child(&self, token: impl fmt::Display) -> Self {
        let token: String = token
            .to_string()
            .chars()
            .map(|c| if c == ' ' || c == SEPARATOR { '_' } else { c })
            .collect();
        debug_assert!(!token.is_empty());
        Identifier(format!("{}{}{}", self.0, SEPARATOR, token))
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR).skip(1)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identifier {
    type Err = CorewatchError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Identifier(String::new()));
        }
        let rest = s.strip_prefix(SEPARATOR).ok_or_else(|| CorewatchError::InvalidIdentifier {
            token: s.to_string(),
            reason: "must start with the separator",
        })?;
        Identifier::new(rest.split(SEPARATOR))
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
