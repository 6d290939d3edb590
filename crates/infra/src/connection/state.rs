//! Connection state machine states.

use std::time::{Duration, Instant};

use keyline_core::Endpoint;

/// Where a resilient connection is in its lifecycle.
///
/// ```text
/// Disconnected ──► Resolving ──► Connecting ──► Connected
///                     ▲  │            │             │
///                     │  ▼            ▼             ▼
///                     └─ BackoffWait ◄──────────────┘
///
/// any non-terminal ──close()──► Closed
/// BackoffWait (budget spent) ──► Failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created; the supervisor has not started resolving yet.
    Disconnected,
    /// Asking discovery agents for the primary.
    Resolving,
    /// Opening a store connection to `addr`.
    Connecting { addr: Endpoint },
    /// Serving commands over a live connection to `addr`.
    Connected { addr: Endpoint },
    /// Waiting out a reconnect delay.
    BackoffWait { until: Instant, delay: Duration },
    /// Closed by its owner. Terminal.
    Closed,
    /// Retry budget exhausted. Terminal.
    Failed { total: Duration },
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Resolving => "resolving",
            ConnectionState::Connecting { .. } => "connecting",
            ConnectionState::Connected { .. } => "connected",
            ConnectionState::BackoffWait { .. } => "backoff_wait",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed { .. } => "failed",
        }
    }
}

impl core::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConnectionState::Connecting { addr } | ConnectionState::Connected { addr } => {
                write!(f, "{} ({addr})", self.name())
            }
            ConnectionState::BackoffWait { delay, .. } => {
                write!(f, "{} ({} ms)", self.name(), delay.as_millis())
            }
            _ => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(
            ConnectionState::Failed {
                total: Duration::from_secs(1)
            }
            .is_terminal()
        );
        assert!(!ConnectionState::Resolving.is_terminal());
        assert!(
            !ConnectionState::BackoffWait {
                until: Instant::now(),
                delay: Duration::from_millis(170)
            }
            .is_terminal()
        );
    }

    #[test]
    fn displays_address_when_known() {
        let state = ConnectionState::Connected {
            addr: Endpoint::new("10.0.0.1", 6379),
        };
        assert_eq!(state.to_string(), "connected (10.0.0.1:6379)");
        assert!(state.is_connected());
    }
}
