//! Common types for vaultflow-core
//!
//! Operations, destinations and results shared by the engine, the HTTP
//! client and the bulk delete controller.

use crate::error::ItemError;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A wrapper around `SecretString` for bearer tokens and other credentials.
///
/// Redacted in `Debug`, `Display` and serialized output; use
/// [`SensitiveString::expose_secret`] only where the real value is needed.
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Create a new sensitive string from any string-like value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// Where an operation is sent: vault, table and column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub vault_id: String,
    pub table: String,
    pub column: String,
}

impl Destination {
    pub fn new(
        vault_id: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            vault_id: vault_id.into(),
            table: table.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.vault_id, self.table, self.column)
    }
}

/// The kind of remote call an operation maps onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Tokenize,
    Detokenize,
    FetchIds,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tokenize => "tokenize",
            Self::Detokenize => "detokenize",
            Self::FetchIds => "fetch_ids",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation input. The variant determines the [`OperationKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Plaintext value to tokenize
    Value(String),
    /// Token to detokenize
    Token(String),
    /// Page of record identifiers to fetch
    Page { offset: u64, limit: u64 },
    /// Record identifier to delete
    Identifier(String),
}

impl Payload {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Value(_) => OperationKind::Tokenize,
            Self::Token(_) => OperationKind::Detokenize,
            Self::Page { .. } => OperationKind::FetchIds,
            Self::Identifier(_) => OperationKind::Delete,
        }
    }

    /// String carried by item-level payloads; `None` for pages
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Value(s) | Self::Token(s) | Self::Identifier(s) => Some(s),
            Self::Page { .. } => None,
        }
    }
}

/// One logical unit of work, addressed by its position in the caller's input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub index: usize,
    pub payload: Payload,
    pub destination: Destination,
}

impl Operation {
    pub fn new(index: usize, payload: Payload, destination: Destination) -> Self {
        Self {
            index,
            payload,
            destination,
        }
    }

    pub fn tokenize(index: usize, value: impl Into<String>, destination: Destination) -> Self {
        Self::new(index, Payload::Value(value.into()), destination)
    }

    pub fn detokenize(index: usize, token: impl Into<String>, destination: Destination) -> Self {
        Self::new(index, Payload::Token(token.into()), destination)
    }

    pub fn fetch_ids(index: usize, offset: u64, limit: u64, destination: Destination) -> Self {
        Self::new(index, Payload::Page { offset, limit }, destination)
    }

    pub fn delete(index: usize, id: impl Into<String>, destination: Destination) -> Self {
        Self::new(index, Payload::Identifier(id.into()), destination)
    }

    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }
}

/// Successful value of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationValue {
    /// Token, plaintext or deleted identifier
    Single(String),
    /// Identifiers returned by a page fetch
    Identifiers(Vec<String>),
}

impl OperationValue {
    pub fn as_single(&self) -> Option<&str> {
        match self {
            Self::Single(s) => Some(s),
            Self::Identifiers(_) => None,
        }
    }
}

/// Outcome for one record of a batch, by position
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Value(OperationValue),
    /// Per-record error message returned by the API
    Rejected(String),
}

impl RecordOutcome {
    pub fn value(value: impl Into<String>) -> Self {
        Self::Value(OperationValue::Single(value.into()))
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }
}

/// Result for one submitted operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub index: usize,
    pub outcome: Result<OperationValue, ItemError>,
}

impl OperationResult {
    pub fn success(index: usize, value: OperationValue) -> Self {
        Self {
            index,
            outcome: Ok(value),
        }
    }

    pub fn failure(index: usize, error: ItemError) -> Self {
        Self {
            index,
            outcome: Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The single string value, if this is an item-level success
    pub fn value(&self) -> Option<&str> {
        self.outcome.as_ref().ok().and_then(OperationValue::as_single)
    }

    pub fn error(&self) -> Option<&ItemError> {
        self.outcome.as_ref().err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_string_redacted() {
        let secret = SensitiveString::new("bearer-token");
        assert_eq!(format!("{:?}", secret), "[REDACTED]");
        assert_eq!(format!("{}", secret), "[REDACTED]");
        assert_eq!(secret.expose_secret(), "bearer-token");
    }

    #[test]
    fn test_sensitive_string_serde() {
        let secret: SensitiveString = serde_json::from_str("\"bearer-token\"").unwrap();
        assert_eq!(secret.expose_secret(), "bearer-token");
        let serialized = serde_json::to_string(&secret).unwrap();
        assert_eq!(serialized, "\"***REDACTED***\"");
    }

    #[test]
    fn test_payload_kind() {
        let dest = Destination::new("v1", "persons", "email");
        assert_eq!(
            Operation::tokenize(0, "a@b.c", dest.clone()).kind(),
            OperationKind::Tokenize
        );
        assert_eq!(
            Operation::detokenize(1, "tok", dest.clone()).kind(),
            OperationKind::Detokenize
        );
        assert_eq!(
            Operation::fetch_ids(2, 0, 25, dest.clone()).kind(),
            OperationKind::FetchIds
        );
        assert_eq!(Operation::delete(3, "id-1", dest).kind(), OperationKind::Delete);
    }

    #[test]
    fn test_result_accessors() {
        let ok = OperationResult::success(0, OperationValue::Single("tok".into()));
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some("tok"));
        assert!(ok.error().is_none());

        let err = OperationResult::failure(1, ItemError::rejected("duplicate"));
        assert!(!err.is_success());
        assert_eq!(err.value(), None);
        assert_eq!(err.error().map(|e| e.kind), Some(crate::error::ErrorKind::Rejected));
    }
}
