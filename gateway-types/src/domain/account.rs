//! Account identifiers.
//!
//! Account identifiers can be card or bank account numbers, so formatting
//! never reveals more than the last four characters. The full value is only
//! reachable through [`AccountId::expose`], which persistence and processor
//! adapters call explicitly.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DomainError;

const MAX_ACCOUNT_ID_LEN: usize = 64;

/// Identifier of a ledger account.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    /// Creates an AccountId, validating its shape.
    ///
    /// # Validation
    /// - Cannot be empty or longer than 64 characters
    /// - Cannot contain whitespace or control characters
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.is_empty() || value.len() > MAX_ACCOUNT_ID_LEN {
            return Err(DomainError::ValidationError(
                "Account identifier must be 1-64 characters".into(),
            ));
        }
        if value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(DomainError::ValidationError(
                "Account identifier contains invalid characters".into(),
            ));
        }
        Ok(Self(value))
    }

    /// Returns the full identifier. Never pass the result to a log macro.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns the identifier with everything but the last four characters hidden.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let visible = chars.len().min(4);
        let tail: String = chars[chars.len() - visible..].iter().collect();
        format!("****{}", tail)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.masked())
    }
}

impl std::str::FromStr for AccountId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AccountId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AccountId> for String {
    fn from(value: AccountId) -> Self {
        value.0
    }
}
