//! Connection state machine

use crate::{Error, Result};

/// Wire connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open, nothing sent
    Initial,

    /// SSLRequest sent, awaiting S/N
    NegotiatingTls,

    /// StartupMessage sent, awaiting authentication request
    AwaitingAuth,

    /// Authentication exchange in progress
    Authenticating,

    /// Ready for a query
    Idle,

    /// Query sent, row description not yet received
    QueryInProgress,

    /// Rows are being read (or were abandoned by the caller and must be drained)
    ReadingResults,

    /// I/O or protocol failure; the socket cannot be reused
    Broken,

    /// Terminated
    Closed,
}

impl ConnectionState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Initial, NegotiatingTls)
                | (Initial, AwaitingAuth)
                | (NegotiatingTls, AwaitingAuth)
                | (AwaitingAuth, Authenticating)
                | (Authenticating, Idle)
                | (Idle, QueryInProgress)
                | (QueryInProgress, ReadingResults)
                | (QueryInProgress, Idle)
                | (ReadingResults, Idle)
                | (Initial | NegotiatingTls | AwaitingAuth | Authenticating, Broken)
                | (Idle | QueryInProgress | ReadingResults, Broken)
                | (_, Closed)
        )
    }

    /// Transition to new state
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("valid transition from {}", self),
                actual: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// Whether the socket may still carry traffic
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Broken | Self::Closed)
    }

    /// Whether a previous result set must be drained before the next query
    pub fn has_pending_results(&self) -> bool {
        matches!(self, Self::QueryInProgress | Self::ReadingResults)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::NegotiatingTls => write!(f, "negotiating_tls"),
            Self::AwaitingAuth => write!(f, "awaiting_auth"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Idle => write!(f, "idle"),
            Self::QueryInProgress => write!(f, "query_in_progress"),
            Self::ReadingResults => write!(f, "reading_results"),
            Self::Broken => write!(f, "broken"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_transitions() {
        let mut state = ConnectionState::Initial;
        assert!(state.transition(ConnectionState::NegotiatingTls).is_ok());
        assert!(state.transition(ConnectionState::AwaitingAuth).is_ok());
        assert!(state.transition(ConnectionState::Authenticating).is_ok());
        assert!(state.transition(ConnectionState::Idle).is_ok());
    }

    #[test]
    fn test_query_cycle() {
        let mut state = ConnectionState::Idle;
        assert!(state.transition(ConnectionState::QueryInProgress).is_ok());
        assert!(state.has_pending_results());
        assert!(state.transition(ConnectionState::ReadingResults).is_ok());
        assert!(state.has_pending_results());
        assert!(state.transition(ConnectionState::Idle).is_ok());
        assert!(!state.has_pending_results());
    }

    #[test]
    fn test_query_error_returns_to_idle() {
        let mut state = ConnectionState::QueryInProgress;
        assert!(state.transition(ConnectionState::Idle).is_ok());
    }

    #[test]
    fn test_invalid_transition() {
        let mut state = ConnectionState::Initial;
        assert!(state.transition(ConnectionState::Idle).is_err());

        let mut state = ConnectionState::Idle;
        assert!(state.transition(ConnectionState::NegotiatingTls).is_err());
    }

    #[test]
    fn test_broken_is_terminal() {
        let mut state = ConnectionState::ReadingResults;
        assert!(state.transition(ConnectionState::Broken).is_ok());
        assert!(!state.is_usable());
        assert!(state.transition(ConnectionState::Idle).is_err());
        assert!(state.transition(ConnectionState::Closed).is_ok());
    }

    #[test]
    fn test_close_from_any_state() {
        let mut state = ConnectionState::QueryInProgress;
        assert!(state.transition(ConnectionState::Closed).is_ok());
        assert!(!state.is_usable());
    }
}
