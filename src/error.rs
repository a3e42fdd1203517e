//! Failure Taxonomy
//!
//! Every failure that ends a pipeline run is classified by a [`FailureKind`].
//! The kind is written as a `[Kind]` prefix on the failure's log entry, which
//! is how status queries later explain why a pipeline stopped.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Why a step or pipeline failed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The submission itself was invalid; nothing was attempted.
    ConfigurationError,
    /// A referenced catalog resource does not exist.
    MissingResource,
    /// A referenced earlier step has not completed.
    UnresolvedDependency,
    /// A referenced earlier step completed without the named result field.
    MissingResultField,
    /// The step executor reported failure (or could not be found).
    ExecutorError,
    /// The run was cancelled by a caller.
    Cancelled,
    /// The step ran past its configured deadline.
    DeadlineExceeded,
    /// A database write kept failing after retries.
    PersistenceError,
}

impl FailureKind {
    pub const ALL: [FailureKind; 8] = [
        FailureKind::ConfigurationError,
        FailureKind::MissingResource,
        FailureKind::UnresolvedDependency,
        FailureKind::MissingResultField,
        FailureKind::ExecutorError,
        FailureKind::Cancelled,
        FailureKind::DeadlineExceeded,
        FailureKind::PersistenceError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ConfigurationError => "ConfigurationError",
            FailureKind::MissingResource => "MissingResource",
            FailureKind::UnresolvedDependency => "UnresolvedDependency",
            FailureKind::MissingResultField => "MissingResultField",
            FailureKind::ExecutorError => "ExecutorError",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::DeadlineExceeded => "DeadlineExceeded",
            FailureKind::PersistenceError => "PersistenceError",
        }
    }

    /// Formats a log entry for this failure: `[Kind] message`.
    pub fn log_entry(&self, message: impl fmt::Display) -> String {
        format!("[{}] {}", self.as_str(), message)
    }

    /// Splits a `[Kind] message` log entry back into its parts.
    pub fn parse_log_entry(text: &str) -> Option<(FailureKind, &str)> {
        let rest = text.strip_prefix('[')?;
        let (kind, message) = rest.split_once(']')?;
        let kind = kind.parse().ok()?;
        Some((kind, message.trim_start()))
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown failure kind '{}'", s))
    }
}
