//! Device lifecycle state machine
//!
//! Transitions take the current state by value and return the next one.
//! A rejected transition leaves the caller holding the old state.

use mbit_protocol::LifecycleKind;

use crate::clock::WakeToken;
use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Executing user code
    Running,
    /// Suspended until the clock fires `token`
    Sleeping { token: WakeToken, request_seq: u64 },
    /// Halted by the user program until reset
    Panicked { code: u8 },
    /// Re-initializing peripherals
    Reset,
}

impl Lifecycle {
    pub fn kind(&self) -> LifecycleKind {
        match self {
            Lifecycle::Running => LifecycleKind::Running,
            Lifecycle::Sleeping { .. } => LifecycleKind::Sleeping,
            Lifecycle::Panicked { .. } => LifecycleKind::Panicked,
            Lifecycle::Reset => LifecycleKind::Reset,
        }
    }

    /// Whether peripheral operations are accepted
    pub fn is_operable(&self) -> bool {
        matches!(self, Lifecycle::Running | Lifecycle::Sleeping { .. })
    }

    /// Running -> Sleeping
    pub fn sleep(self, token: WakeToken, request_seq: u64) -> Result<Lifecycle, DeviceError> {
        match self {
            Lifecycle::Running => Ok(Lifecycle::Sleeping { token, request_seq }),
            other => Err(other.reject("sleep")),
        }
    }

    /// Sleeping -> Running when `fired` is the token being waited on
    pub fn wake(self, fired: WakeToken) -> Lifecycle {
        match self {
            Lifecycle::Sleeping { token, .. } if token == fired => Lifecycle::Running,
            other => other,
        }
    }

    /// Running | Sleeping -> Panicked
    pub fn panic(self, code: u8) -> Result<Lifecycle, DeviceError> {
        match self {
            Lifecycle::Running | Lifecycle::Sleeping { .. } => Ok(Lifecycle::Panicked { code }),
            other => Err(other.reject("panic")),
        }
    }

    /// Any state -> Reset
    pub fn reset(self) -> Lifecycle {
        Lifecycle::Reset
    }

    /// Reset -> Running
    pub fn finish_reset(self) -> Lifecycle {
        match self {
            Lifecycle::Reset => Lifecycle::Running,
            other => other,
        }
    }

    pub(crate) fn reject(&self, operation: &'static str) -> DeviceError {
        DeviceError::InvalidState {
            state: self.kind(),
            operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;

    #[test]
    fn test_sleep_and_wake() {
        let mut clock = VirtualClock::new();
        let token = clock.sleep_for(10);
        let other = clock.sleep_for(20);

        let state = Lifecycle::Running.sleep(token, 4).unwrap();
        assert_eq!(state.kind(), LifecycleKind::Sleeping);
        assert_eq!(state.wake(other), state);
        assert_eq!(state.wake(token), Lifecycle::Running);
    }

    #[test]
    fn test_cannot_sleep_while_panicked() {
        let mut clock = VirtualClock::new();
        let token = clock.sleep_for(10);
        let err = Lifecycle::Panicked { code: 3 }.sleep(token, 1).unwrap_err();
        assert_eq!(
            err,
            DeviceError::InvalidState {
                state: LifecycleKind::Panicked,
                operation: "sleep"
            }
        );
    }

    #[test]
    fn test_panic_only_from_live_states() {
        assert!(Lifecycle::Running.panic(1).is_ok());
        assert!(Lifecycle::Panicked { code: 1 }.panic(2).is_err());
        assert!(Lifecycle::Reset.panic(2).is_err());
    }

    #[test]
    fn test_reset_path() {
        let state = Lifecycle::Panicked { code: 9 }.reset();
        assert_eq!(state, Lifecycle::Reset);
        assert!(!state.is_operable());
        assert_eq!(state.finish_reset(), Lifecycle::Running);
        assert_eq!(Lifecycle::Running.finish_reset(), Lifecycle::Running);
    }
}
