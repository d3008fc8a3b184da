#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Registration progress of one image.
///
/// ```text
/// Unregistered -> Registering -> Registered
///                      |
///                      v
///                   Failed -> Registering (retry)
/// ```
///
/// `Registered` is terminal, which keeps the reconstruction monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Failed,
}

impl Default for RegistrationState {
    fn default() -> Self {
        Self::Unregistered
    }
}

/// Returned when a registration state change is not allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid registration transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: RegistrationState,
    pub to: RegistrationState,
}

impl RegistrationState {
    /// Starts a registration attempt.
    pub fn begin(&mut self) -> Result<(), InvalidTransition> {
        let allowed = matches!(*self, Self::Unregistered | Self::Failed);
        self.transition(Self::Registering, allowed)
    }

    /// Completes the ongoing registration attempt successfully.
    pub fn succeed(&mut self) -> Result<(), InvalidTransition> {
        let allowed = *self == Self::Registering;
        self.transition(Self::Registered, allowed)
    }

    /// Completes the ongoing registration attempt unsuccessfully.
    pub fn fail(&mut self) -> Result<(), InvalidTransition> {
        let allowed = *self == Self::Registering;
        self.transition(Self::Failed, allowed)
    }

    pub fn is_registered(self) -> bool {
        self == Self::Registered
    }

    fn transition(&mut self, to: Self, allowed: bool) -> Result<(), InvalidTransition> {
        if allowed {
            *self = to;
            Ok(())
        } else {
            Err(InvalidTransition { from: *self, to })
        }
    }
}
