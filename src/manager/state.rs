//! Connection slot state machine

use crate::{Error, Result};

/// State of the manager's single connection slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SlotState {
    /// No handle held
    #[default]
    Empty,

    /// Handle held and believed valid
    Live,

    /// Handle being replaced
    Refreshing,
}

impl SlotState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: SlotState) -> bool {
        use SlotState::*;

        matches!(
            (self, next),
            (Empty, Refreshing) | (Live, Refreshing) | (Refreshing, Live) | (Refreshing, Empty)
        )
    }

    /// Transition to new state
    pub fn transition(&mut self, next: SlotState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("valid transition from {}", self),
                actual: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Live => write!(f, "live"),
            Self::Refreshing => write!(f, "refreshing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_cycle() {
        let mut state = SlotState::default();
        assert_eq!(state, SlotState::Empty);
        assert!(state.transition(SlotState::Refreshing).is_ok());
        assert!(state.transition(SlotState::Live).is_ok());
        assert!(state.transition(SlotState::Refreshing).is_ok());
        assert!(state.transition(SlotState::Empty).is_ok());
    }

    #[test]
    fn test_no_direct_open() {
        let mut state = SlotState::Empty;
        assert!(state.transition(SlotState::Live).is_err());
        assert_eq!(state, SlotState::Empty);
    }

    #[test]
    fn test_live_never_empties_directly() {
        let mut state = SlotState::Live;
        let err = state.transition(SlotState::Empty).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }
}
