use std::mem;

use crate::Token;

use super::ConnectParams;

/// Externally visible state of a session
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StateKind {
    /// No session up, idle
    Inactive,
    /// Activation command outstanding
    Activating,
    /// Session up with at least one attached context
    Active,
    /// Active plus at least one QoS flow pending or established
    QosActive,
    /// Deactivation command outstanding
    Disconnecting,
    /// Cleanup after an activation that returned unusable parameters
    DisconnectingErrorCreatingConnection,
}

/// Session state with bookkeeping for outstanding commands
///
/// Nested [`InnerState`] to enforce all state transitions are done in this
/// module.
#[derive(Debug)]
pub(super) struct State {
    inner: InnerState,
}

#[derive(Debug)]
pub(super) enum InnerState {
    Inactive,
    Activating(Activating),
    Active,
    QosActive,
    Disconnecting(Disconnecting),
    DisconnectingError(DisconnectingError),
}

/// Bookkeeping while an activation command is outstanding
#[derive(Debug)]
pub(super) struct Activating {
    /// The request that triggered this activation
    pub(super) params: ConnectParams,
    /// Address families actually requested for this attempt
    ///
    /// Differs from the profile's protocol when a pending-protocol override
    /// from an earlier partial failure is in effect.
    pub(super) protocol: crate::Protocol,
    /// Generation tag captured when the command was issued
    pub(super) tag: u64,
    /// Set once a last-failure-cause query has been issued for a legacy
    /// transport whose setup replies carry no structured error
    pub(super) awaiting_fail_cause: bool,
}

/// Bookkeeping while a deactivation command is outstanding
#[derive(Debug)]
pub(super) struct Disconnecting {
    /// Generation tag captured when the command was issued
    pub(super) tag: u64,
    /// Completion tokens to resolve when deactivation finishes
    pub(super) tokens: Vec<Token>,
}

/// Bookkeeping for the forced deactivation after a rejected activation
#[derive(Debug)]
pub(super) struct DisconnectingError {
    /// Generation tag captured when the command was issued
    pub(super) tag: u64,
    /// The connect request that must be failed when cleanup completes
    pub(super) token: Token,
}

impl State {
    pub(super) fn new() -> Self {
        Self {
            inner: InnerState::Inactive,
        }
    }

    pub(super) fn as_activating(&self) -> Option<&Activating> {
        if let InnerState::Activating(ref a) = self.inner {
            Some(a)
        } else {
            None
        }
    }

    pub(super) fn as_activating_mut(&mut self) -> Option<&mut Activating> {
        if let InnerState::Activating(ref mut a) = self.inner {
            Some(a)
        } else {
            None
        }
    }

    pub(super) fn as_disconnecting(&self) -> Option<&Disconnecting> {
        if let InnerState::Disconnecting(ref d) = self.inner {
            Some(d)
        } else {
            None
        }
    }

    pub(super) fn as_disconnecting_error(&self) -> Option<&DisconnectingError> {
        if let InnerState::DisconnectingError(ref d) = self.inner {
            Some(d)
        } else {
            None
        }
    }

    /// Move back to `Inactive`, yielding the replaced state's bookkeeping
    pub(super) fn move_to_inactive(&mut self) -> InnerState {
        mem::replace(&mut self.inner, InnerState::Inactive)
    }

    pub(super) fn move_to_activating(&mut self, a: Activating) {
        debug_assert!(
            matches!(self.inner, InnerState::Inactive),
            "invalid state transition {:?} -> activating",
            self.kind()
        );
        self.inner = InnerState::Activating(a);
    }

    pub(super) fn move_to_active(&mut self) {
        debug_assert!(
            matches!(
                self.inner,
                InnerState::Activating(_) | InnerState::QosActive
            ),
            "invalid state transition {:?} -> active",
            self.kind()
        );
        self.inner = InnerState::Active;
    }

    pub(super) fn move_to_qos_active(&mut self) {
        debug_assert!(
            matches!(self.inner, InnerState::Active),
            "invalid state transition {:?} -> qos-active",
            self.kind()
        );
        self.inner = InnerState::QosActive;
    }

    pub(super) fn move_to_disconnecting(&mut self, d: Disconnecting) {
        debug_assert!(
            matches!(self.inner, InnerState::Active | InnerState::QosActive),
            "invalid state transition {:?} -> disconnecting",
            self.kind()
        );
        self.inner = InnerState::Disconnecting(d);
    }

    pub(super) fn move_to_disconnecting_error(&mut self, d: DisconnectingError) {
        debug_assert!(
            matches!(self.inner, InnerState::Activating(_)),
            "invalid state transition {:?} -> disconnecting-error",
            self.kind()
        );
        self.inner = InnerState::DisconnectingError(d);
    }

    pub(super) fn is_inactive(&self) -> bool {
        matches!(self.inner, InnerState::Inactive)
    }

    pub(super) fn is_activating(&self) -> bool {
        matches!(self.inner, InnerState::Activating(_))
    }

    /// Whether the session is up, with or without QoS flows
    pub(super) fn is_up(&self) -> bool {
        matches!(self.inner, InnerState::Active | InnerState::QosActive)
    }

    pub(super) fn is_qos_active(&self) -> bool {
        matches!(self.inner, InnerState::QosActive)
    }

    pub(super) fn is_disconnecting(&self) -> bool {
        matches!(
            self.inner,
            InnerState::Disconnecting(_) | InnerState::DisconnectingError(_)
        )
    }

    pub(super) fn kind(&self) -> StateKind {
        match self.inner {
            InnerState::Inactive => StateKind::Inactive,
            InnerState::Activating(_) => StateKind::Activating,
            InnerState::Active => StateKind::Active,
            InnerState::QosActive => StateKind::QosActive,
            InnerState::Disconnecting(_) => StateKind::Disconnecting,
            InnerState::DisconnectingError(_) => {
                StateKind::DisconnectingErrorCreatingConnection
            }
        }
    }
}
