//! Deterministic protocol logic for packet-data session management
//!
//! pdn-proto contains a fully deterministic implementation of the session
//! lifecycle state machine that sits between upper-layer contexts and a
//! cellular radio transport. It contains no I/O and no timers: callers feed
//! in requests and asynchronous transport completions, then drain the
//! commands the machine wants issued to the radio and the notifications it
//! wants delivered to upper layers. Most users will want the task-based
//! `pdn` API instead.
//!
//! The most important type is [`Session`], which owns the state for one
//! logical packet-data connection across arbitrarily many activate and
//! deactivate cycles. Supporting types cover failure classification
//! ([`FailCause`]), link-property resolution ([`LinkProperties`]), and the
//! per-flow QoS sub-state ([`QosFlowState`]).

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]

use std::fmt;

mod fail;
pub use fail::FailCause;

mod link;
pub use link::{DualStackOutcome, HttpProxy, LinkInfo, LinkProperties, Protocol};

mod qos;
pub use qos::{
    QosDirection, QosFlowState, QosIndication, QosSetupReply, QosSpec, QosStatusReply,
    TrafficClass,
};

mod session;
pub use session::{
    ApnProfile, Command, ConnectFailure, ConnectOutcome, ConnectParams, DisconnectParams,
    QosError, Request, Session, SessionConfig, SessionEvent, SessionSnapshot, SetupReply,
    StateKind, TransportEvent, TransportFault,
};

/// Stable identity of a session, assigned by the owning context
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

/// Handle identifying one upper-layer context attached to a session
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context {}", self.0)
    }
}

/// Correlates a request with its single terminating completion notification
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Token(pub u64);

/// Identifier for a QoS flow within a session, assigned by the transport
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FlowId(pub u32);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow {}", self.0)
    }
}

//
// Useful internal constants
//

/// Lowest transport interface version that reports structured setup errors
const MIN_STRUCTURED_ERROR_VERSION: u32 = 4;
/// Transport connection identifier value used while no connection is up
const CID_NONE: i32 = -1;
