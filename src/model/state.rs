//! Entity lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed entity.
///
/// `Destroyed` is zero: an entity in that state is gone for good and can no
/// longer be reached or observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ManagedState {
    Destroyed = 0,
    Created = 1,
    Activating = 2,
    Active = 3,
    Deactivating = 4,
    Inactive = 5,
    Destroying = 6,
}

impl ManagedState {
    /// Numeric state value (zero once destroyed).
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for every state except `Destroyed`.
    pub fn is_alive(self) -> bool {
        self != ManagedState::Destroyed
    }

    pub fn is_active(self) -> bool {
        self == ManagedState::Active
    }

    /// True while a transition body has flipped the state but not settled.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            ManagedState::Activating | ManagedState::Deactivating | ManagedState::Destroying
        )
    }

    /// States from which a destroy must deactivate first.
    pub(crate) fn needs_deactivation(self) -> bool {
        matches!(
            self,
            ManagedState::Active | ManagedState::Activating | ManagedState::Deactivating
        )
    }
}

impl std::fmt::Display for ManagedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ManagedState::Destroyed => "DESTROYED",
            ManagedState::Created => "CREATED",
            ManagedState::Activating => "ACTIVATING",
            ManagedState::Active => "ACTIVE",
            ManagedState::Deactivating => "DEACTIVATING",
            ManagedState::Inactive => "INACTIVE",
            ManagedState::Destroying => "DESTROYING",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroyed_is_zero() {
        assert_eq!(ManagedState::Destroyed.as_u8(), 0);
        assert!(!ManagedState::Destroyed.is_alive());
        assert!(ManagedState::Created.is_alive());
    }

    #[test]
    fn test_deactivation_states() {
        assert!(ManagedState::Active.needs_deactivation());
        assert!(ManagedState::Deactivating.needs_deactivation());
        assert!(!ManagedState::Inactive.needs_deactivation());
        assert!(!ManagedState::Created.needs_deactivation());
    }
}
