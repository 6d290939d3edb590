//! Strongly-typed identifiers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one logical resilient connection.
///
/// Stable across reconnects; attached to log lines so churn on a single
/// logical connection can be followed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }
}
