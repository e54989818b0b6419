//! Per-connection admission state machine.

/// Disposition of one connection with respect to the admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Waiting for the authenticator to resolve.
    Pending,
    /// Handed to application logic.
    Released,
    /// Destroyed before authentication completed.
    Discarded,
}

/// Decides when application logic may observe a connection.
///
/// Exactly one of the auth/error signals determines the outcome of a
/// pending connection. `Released` and `Discarded` are terminal: the gate
/// releases at most once, never releases after a discard, and ignores
/// errors after release (those belong to application logic).
#[derive(Debug)]
pub struct AdmissionGate {
    state: GateState,
}

impl AdmissionGate {
    /// Gate for a connection with no authenticator: already released.
    pub fn open() -> Self {
        Self {
            state: GateState::Released,
        }
    }

    /// Gate for a connection that must authenticate before release.
    pub fn pending() -> Self {
        Self {
            state: GateState::Pending,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> GateState {
        self.state
    }

    /// Returns whether the connection is still awaiting authentication.
    pub fn is_pending(&self) -> bool {
        self.state == GateState::Pending
    }

    /// Records an auth signal. Returns true when this transition releases
    /// the connection, i.e. application logic must now be invoked.
    pub fn on_auth(&mut self) -> bool {
        if self.state == GateState::Pending {
            self.state = GateState::Released;
            true
        } else {
            false
        }
    }

    /// Records an error signal. Returns true when the connection must be
    /// destroyed and reported as a warning.
    pub fn on_error(&mut self) -> bool {
        if self.state == GateState::Pending {
            self.state = GateState::Discarded;
            true
        } else {
            false
        }
    }
}
