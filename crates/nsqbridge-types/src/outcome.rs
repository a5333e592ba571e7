//! Publish outcome types
//!
//! A publish either reaches every targeted connection, reaches some of them,
//! or fails outright. The first two are [`PublishOutcome`] values; total
//! failure is [`crate::Error::PublishFailed`].

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A single connection that rejected a publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConnectionFailure {
    /// Broker node address
    pub address: String,
    /// Error message reported by the connection
    pub reason: String,
}

impl ConnectionFailure {
    /// Create a new failure record
    pub fn new(address: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result of a publish that reached at least one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PublishOutcome {
    /// Every targeted connection accepted the message
    Delivered {
        /// Addresses that accepted the message
        connections: Vec<String>,
    },
    /// Some targeted connections failed
    Partial {
        /// Addresses that accepted the message
        delivered: Vec<String>,
        /// Addresses that rejected it
        failures: Vec<ConnectionFailure>,
    },
}

impl PublishOutcome {
    /// Build an outcome from per-connection results
    ///
    /// Returns `None` when nothing was delivered.
    pub fn from_results(delivered: Vec<String>, failures: Vec<ConnectionFailure>) -> Option<Self> {
        if delivered.is_empty() {
            return None;
        }
        if failures.is_empty() {
            Some(Self::Delivered {
                connections: delivered,
            })
        } else {
            Some(Self::Partial {
                delivered,
                failures,
            })
        }
    }

    /// Whether some targets failed
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial { .. })
    }

    /// Addresses that accepted the message
    pub fn delivered(&self) -> &[String] {
        match self {
            Self::Delivered { connections } => connections,
            Self::Partial { delivered, .. } => delivered,
        }
    }

    /// Addresses that rejected the message
    pub fn failures(&self) -> &[ConnectionFailure] {
        match self {
            Self::Delivered { .. } => &[],
            Self::Partial { failures, .. } => failures,
        }
    }
}
