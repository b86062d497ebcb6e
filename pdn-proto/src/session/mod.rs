use std::collections::VecDeque;
use std::mem;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::link::{DualStackOutcome, LinkInfo, LinkProperties, Protocol};
use crate::qos::{
    QosFlowRegistry, QosFlowState, QosIndication, QosSetupFailure, QosSetupReply, QosSpec,
    QosStatusReply,
};
use crate::{ContextId, FailCause, FlowId, SessionId, Token, CID_NONE, MIN_STRUCTURED_ERROR_VERSION};

mod state;
pub use state::StateKind;
use state::{Activating, Disconnecting, DisconnectingError, InnerState, State};

/// Access-point profile a session is brought up against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApnProfile {
    /// Access point name
    pub apn: String,
    /// Address families to request
    pub protocol: Protocol,
    /// Authentication user name, if the profile needs one
    pub username: Option<String>,
    /// Authentication password, if the profile needs one
    pub password: Option<String>,
}

/// Static configuration for a session
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// System-level DNS servers used when the transport reports none
    pub fallback_dns: Vec<IpAddr>,
    /// Locally configured HTTP proxy, preserved across activation cycles
    pub http_proxy: Option<crate::HttpProxy>,
}

/// One bring-up request
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// The upper-layer context attaching to the session
    pub context: ContextId,
    /// Completion token for the terminating notification
    pub token: Token,
    /// Profile to activate
    pub profile: ApnProfile,
}

/// One teardown request
#[derive(Debug, Clone)]
pub struct DisconnectParams {
    /// The upper-layer context detaching from the session
    pub context: ContextId,
    /// Completion token for the terminating notification
    pub token: Token,
    /// Free-form reason passed through to the transport
    pub reason: String,
}

/// Requests from upper-layer contexts
#[derive(Debug, Clone)]
pub enum Request {
    /// Attach a context, activating the session if necessary
    Connect(ConnectParams),
    /// Detach a context, deactivating the session when none remain
    Disconnect(DisconnectParams),
    /// Force teardown regardless of attached contexts
    DisconnectAll {
        /// Completion token
        token: Token,
        /// Free-form reason passed through to the transport
        reason: String,
    },
    /// Negotiate a new QoS flow
    QosSetup {
        /// Completion token
        token: Token,
        /// Requested flow parameters
        spec: QosSpec,
    },
    /// Release an existing QoS flow
    QosRelease {
        /// Completion token
        token: Token,
        /// Flow to release
        flow: FlowId,
    },
    /// Suspend an existing QoS flow
    QosSuspend {
        /// Completion token
        token: Token,
        /// Flow to suspend
        flow: FlowId,
    },
    /// Resume a suspended QoS flow
    QosResume {
        /// Completion token
        token: Token,
        /// Flow to resume
        flow: FlowId,
    },
    /// Query the current state of a QoS flow
    QosGetStatus {
        /// Completion token
        token: Token,
        /// Flow to query
        flow: FlowId,
    },
}

/// Radio-level fault reported alongside a transport reply
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportFault {
    /// The radio is not available to service requests
    RadioNotAvailable,
    /// Any other radio-level failure
    Other,
}

/// Transport reply to an activation command
#[derive(Debug, Clone, Default)]
pub struct SetupReply {
    /// Radio-level fault, if the command itself failed
    pub fault: Option<TransportFault>,
    /// Network status code, zero on success
    pub status: i32,
    /// Transport-assigned connection identifier
    pub connection_id: i32,
    /// Link configuration, present on success
    pub link: Option<LinkInfo>,
    /// Transport-suggested retry delay for non-permanent failures
    pub suggested_retry: Option<Duration>,
}

/// Asynchronous completions and indications from the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An activation command completed
    SetupDone {
        /// Generation tag captured when the command was issued
        tag: u64,
        /// The transport's reply
        reply: SetupReply,
    },
    /// A deactivation command completed
    DeactivateDone {
        /// Generation tag captured when the command was issued
        tag: u64,
    },
    /// A last-failure-cause query completed
    LastFailureCause {
        /// Generation tag captured when the query was issued
        tag: u64,
        /// Raw failure code
        code: i32,
    },
    /// A QoS setup command completed
    QosSetupDone {
        /// Generation tag captured when the command was issued
        tag: u64,
        /// The transport's reply
        reply: QosSetupReply,
    },
    /// A QoS release command completed
    QosReleaseDone {
        /// Generation tag captured when the command was issued
        tag: u64,
        /// The released flow
        flow: FlowId,
        /// Transport status code, zero on success
        status: i32,
    },
    /// A QoS suspend command completed
    QosSuspendDone {
        /// Generation tag captured when the command was issued
        tag: u64,
        /// The suspended flow
        flow: FlowId,
        /// Transport status code, zero on success
        status: i32,
    },
    /// A QoS resume command completed
    QosResumeDone {
        /// Generation tag captured when the command was issued
        tag: u64,
        /// The resumed flow
        flow: FlowId,
        /// Transport status code, zero on success
        status: i32,
    },
    /// A QoS status query completed
    QosStatusDone {
        /// Generation tag captured when the query was issued
        tag: u64,
        /// The queried flow
        flow: FlowId,
        /// The transport's reply
        reply: QosStatusReply,
    },
    /// Unsolicited flow state change pushed by the transport
    QosStateChanged {
        /// The affected flow
        flow: FlowId,
        /// What happened to it
        indication: QosIndication,
    },
    /// The radio came up, reporting its interface version
    RadioConnected {
        /// Transport interface version
        version: u32,
    },
    /// The radio went down
    RadioOff,
}

/// Commands the caller must issue to the radio transport
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Activate a session
    Activate {
        /// Generation tag to echo in the completion
        tag: u64,
        /// Profile to activate
        profile: ApnProfile,
        /// Address families to request for this attempt
        protocol: Protocol,
    },
    /// Deactivate the session
    Deactivate {
        /// Generation tag to echo in the completion
        tag: u64,
        /// Connection to tear down
        connection_id: i32,
        /// Free-form reason
        reason: String,
    },
    /// Query the cause of the last activation failure
    GetLastFailureCause {
        /// Generation tag to echo in the completion
        tag: u64,
        /// Connection the failure belongs to
        connection_id: i32,
    },
    /// Negotiate a QoS flow
    QosSetup {
        /// Generation tag to echo in the completion
        tag: u64,
        /// Connection to negotiate on
        connection_id: i32,
        /// Requested flow parameters
        spec: QosSpec,
    },
    /// Release a QoS flow
    QosRelease {
        /// Generation tag to echo in the completion
        tag: u64,
        /// Flow to release
        flow: FlowId,
    },
    /// Suspend a QoS flow
    QosSuspend {
        /// Generation tag to echo in the completion
        tag: u64,
        /// Flow to suspend
        flow: FlowId,
    },
    /// Resume a QoS flow
    QosResume {
        /// Generation tag to echo in the completion
        tag: u64,
        /// Flow to resume
        flow: FlowId,
    },
    /// Query a QoS flow's state
    QosGetStatus {
        /// Generation tag to echo in the completion
        tag: u64,
        /// Flow to query
        flow: FlowId,
    },
}

/// Successful bring-up result
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOutcome {
    /// The session's resolved link configuration
    pub link: LinkProperties,
    /// Whether a dual-stack request obtained only one address family
    pub partial: bool,
}

/// Failed bring-up result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFailure {
    /// Classified cause
    pub cause: FailCause,
    /// Transport-suggested retry delay, if any
    pub retry_hint: Option<Duration>,
}

impl ConnectFailure {
    /// Whether retrying is pointless
    pub fn is_permanent(&self) -> bool {
        self.cause.is_permanent()
    }
}

/// Errors surfaced on QoS operations
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum QosError {
    /// The session is not in a state that accepts QoS operations
    #[error("session is not active")]
    NotActive,
    /// The transport rejected the operation
    #[error("transport rejected the request with status {0}")]
    Rejected(i32),
    /// The transport's reply was missing fields or unparseable
    #[error("malformed transport reply")]
    Malformed,
    /// The flow is not known to this session
    #[error("no such flow")]
    NoSuchFlow,
}

/// Notifications to route back to upper-layer contexts
///
/// Every request produces exactly one terminating notification carrying its
/// token; `Detached` and `QosStateChanged` are unsolicited.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A bring-up request completed
    ConnectDone {
        /// Token of the originating request
        token: Token,
        /// The outcome
        result: Result<ConnectOutcome, ConnectFailure>,
    },
    /// A teardown request completed
    DisconnectDone {
        /// Token of the originating request
        token: Token,
    },
    /// A context was detached by a forced teardown it did not request
    Detached {
        /// The detached context
        context: ContextId,
    },
    /// A QoS setup request completed
    QosSetupDone {
        /// Token of the originating request
        token: Token,
        /// The negotiated flow id, or why setup failed
        result: Result<FlowId, QosError>,
    },
    /// A QoS release request completed
    QosReleaseDone {
        /// Token of the originating request
        token: Token,
        /// Success, or why the release failed
        result: Result<(), QosError>,
    },
    /// A QoS suspend request completed
    QosSuspendDone {
        /// Token of the originating request
        token: Token,
        /// Success, or why the suspend failed
        result: Result<(), QosError>,
    },
    /// A QoS resume request completed
    QosResumeDone {
        /// Token of the originating request
        token: Token,
        /// Success, or why the resume failed
        result: Result<(), QosError>,
    },
    /// A QoS status query completed
    QosStatusDone {
        /// Token of the originating request
        token: Token,
        /// Flow state and descriptors, or why the query failed
        result: Result<(QosFlowState, Vec<String>), QosError>,
    },
    /// A flow changed state without a local request
    QosStateChanged {
        /// The affected flow
        flow: FlowId,
        /// The new reportable state
        state: QosFlowState,
    },
}

/// Point-in-time view of a session for synchronous queries
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Current state
    pub kind: StateKind,
    /// Current link configuration
    pub link: LinkProperties,
    /// Number of attached upper-layer contexts
    pub attached_contexts: usize,
    /// Whether a dual-stack bring-up is running on one address family
    pub partial_success: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            kind: StateKind::Inactive,
            link: LinkProperties::default(),
            attached_contexts: 0,
            partial_success: false,
        }
    }
}

/// A partial-stack re-activation running while the session stays Active
#[derive(Debug)]
struct PartialRetry {
    token: Token,
    context: ContextId,
    tag: u64,
}

/// QoS operations with a command outstanding
#[derive(Debug)]
enum PendingQos {
    Setup { token: Token, spec: QosSpec },
    Release { token: Token, flow: FlowId },
    Suspend { token: Token, flow: FlowId },
    Resume { token: Token, flow: FlowId },
    Status { token: Token, flow: FlowId },
}

/// Protocol state and logic for a single packet-data session
///
/// Objects of this type receive [`Request`]s from upper-layer contexts and
/// [`TransportEvent`]s from the radio, and emit [`Command`]s for the caller
/// to issue to the transport along with [`SessionEvent`] notifications to
/// deliver upward. One `Session` is created per logical connection and is
/// reused across arbitrarily many activate/deactivate cycles.
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    state: State,
    /// Incremented on every entry into Inactive; stale completions carry an
    /// older value and are discarded
    tag: u64,
    /// Transport-assigned connection id, `-1` while no connection is up
    cid: i32,
    attached: FxHashSet<ContextId>,
    link: LinkProperties,
    profile: Option<ApnProfile>,
    created_at: Instant,
    last_fail: Option<(Instant, FailCause)>,
    retry_override: Option<u32>,
    /// Address family to request on the next attempt after a partial
    /// dual-stack failure or an only-IPvX rejection
    pending_protocol: Option<Protocol>,
    partial_success: bool,
    partial_retry: Option<PartialRetry>,
    transport_version: u32,
    radio_on: bool,
    qos: QosFlowRegistry,
    pending_qos: Vec<PendingQos>,
    deferred: VecDeque<Request>,
    replaying: bool,
    commands: VecDeque<Command>,
    events: VecDeque<SessionEvent>,
}

impl Session {
    /// Create an idle session
    pub fn new(id: SessionId, config: SessionConfig, now: Instant) -> Self {
        let link = LinkProperties {
            http_proxy: config.http_proxy.clone(),
            ..LinkProperties::default()
        };
        Self {
            id,
            config,
            state: State::new(),
            tag: 0,
            cid: CID_NONE,
            attached: FxHashSet::default(),
            link,
            profile: None,
            created_at: now,
            last_fail: None,
            retry_override: None,
            pending_protocol: None,
            partial_success: false,
            partial_retry: None,
            transport_version: MIN_STRUCTURED_ERROR_VERSION,
            radio_on: true,
            qos: QosFlowRegistry::default(),
            pending_qos: Vec::new(),
            deferred: VecDeque::new(),
            replaying: false,
            commands: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Next command to issue to the transport, if any
    pub fn poll_command(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    /// Next notification to deliver to upper layers, if any
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Current state
    pub fn state_kind(&self) -> StateKind {
        self.state.kind()
    }

    /// Whether the session is idle with nothing outstanding
    pub fn is_inactive(&self) -> bool {
        self.state.is_inactive()
    }

    /// Whether the session is up with QoS flows pending or established
    pub fn is_qos_active(&self) -> bool {
        self.state.is_qos_active()
    }

    /// Transport-assigned connection id, `-1` while no connection is up
    pub fn connection_id(&self) -> i32 {
        self.cid
    }

    /// Number of attached upper-layer contexts
    pub fn attached_context_count(&self) -> usize {
        self.attached.len()
    }

    /// Current link configuration
    pub fn current_link_properties(&self) -> &LinkProperties {
        &self.link
    }

    /// Current generation tag
    pub fn generation(&self) -> u64 {
        self.tag
    }

    /// When this session object was created
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Timestamp and cause of the most recent failure, if any
    pub fn last_failure(&self) -> Option<(Instant, FailCause)> {
        self.last_fail
    }

    /// Caller-supplied override for the retry policy's attempt count
    pub fn retry_override(&self) -> Option<u32> {
        self.retry_override
    }

    /// Override the retry policy's attempt count for this session
    pub fn set_retry_override(&mut self, count: Option<u32>) {
        self.retry_override = count;
    }

    /// Point-in-time view for synchronous queries
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            kind: self.state.kind(),
            link: self.link.clone(),
            attached_contexts: self.attached.len(),
            partial_success: self.partial_success,
        }
    }

    /// Process one request from an upper-layer context
    pub fn handle_request(&mut self, now: Instant, request: Request) {
        match request {
            Request::Connect(params) => self.on_connect(params),
            Request::Disconnect(params) => self.on_disconnect(now, params),
            Request::DisconnectAll { token, reason } => {
                self.on_disconnect_all(now, token, reason)
            }
            other => self.on_qos_request(other),
        }
    }

    /// Process one asynchronous completion or indication from the transport
    pub fn handle_transport(&mut self, now: Instant, event: TransportEvent) {
        match event {
            TransportEvent::SetupDone { tag, reply } => self.on_setup_done(now, tag, reply),
            TransportEvent::DeactivateDone { tag } => self.on_deactivate_done(now, tag),
            TransportEvent::LastFailureCause { tag, code } => {
                self.on_last_failure_cause(now, tag, code)
            }
            TransportEvent::QosSetupDone { tag, reply } => self.on_qos_setup_done(now, tag, reply),
            TransportEvent::QosReleaseDone { tag, flow, status } => {
                self.on_qos_simple_done(now, tag, flow, status, QosKind::Release)
            }
            TransportEvent::QosSuspendDone { tag, flow, status } => {
                self.on_qos_simple_done(now, tag, flow, status, QosKind::Suspend)
            }
            TransportEvent::QosResumeDone { tag, flow, status } => {
                self.on_qos_simple_done(now, tag, flow, status, QosKind::Resume)
            }
            TransportEvent::QosStatusDone { tag, flow, reply } => {
                self.on_qos_status_done(now, tag, flow, reply)
            }
            TransportEvent::QosStateChanged { flow, indication } => {
                self.on_qos_indication(flow, indication)
            }
            TransportEvent::RadioConnected { version } => {
                debug!(id = %self.id, version, "radio connected");
                self.transport_version = version;
                self.radio_on = true;
            }
            TransportEvent::RadioOff => {
                debug!(id = %self.id, "radio off");
                self.radio_on = false;
            }
        }
    }

    //
    // Request handling
    //

    fn on_connect(&mut self, params: ConnectParams) {
        if self.state.is_inactive() {
            let protocol = self
                .pending_protocol
                .unwrap_or(params.profile.protocol);
            let tag = self.tag;
            debug!(id = %self.id, apn = %params.profile.apn, %protocol, tag, "activating");
            self.profile = Some(params.profile.clone());
            self.commands.push_back(Command::Activate {
                tag,
                profile: params.profile.clone(),
                protocol,
            });
            self.state.move_to_activating(Activating {
                params,
                protocol,
                tag,
                awaiting_fail_cause: false,
            });
            return;
        }
        if self.state.is_activating() || self.state.is_disconnecting() {
            trace!(id = %self.id, "deferring connect");
            self.deferred.push_back(Request::Connect(params));
            return;
        }
        // Active or QosActive
        if self.partial_retry.is_some() {
            // A partial retry is in flight; additional attaches wait for it
            trace!(id = %self.id, "deferring connect during partial retry");
            self.deferred.push_back(Request::Connect(params));
            return;
        }
        if self.partial_success {
            let protocol = self
                .pending_protocol
                .unwrap_or(params.profile.protocol);
            debug!(id = %self.id, %protocol, "re-activating for partial retry");
            self.partial_retry = Some(PartialRetry {
                token: params.token,
                context: params.context,
                tag: self.tag,
            });
            self.commands.push_back(Command::Activate {
                tag: self.tag,
                profile: params.profile,
                protocol,
            });
            return;
        }
        // The session is shared; the new caller attaches without a command
        self.attached.insert(params.context);
        trace!(id = %self.id, context = %params.context, refs = self.attached.len(), "attached");
        self.events.push_back(SessionEvent::ConnectDone {
            token: params.token,
            result: Ok(ConnectOutcome {
                link: self.link.clone(),
                partial: false,
            }),
        });
    }

    fn on_disconnect(&mut self, now: Instant, params: DisconnectParams) {
        if self.state.is_inactive() {
            // Nothing up; complete immediately
            self.events.push_back(SessionEvent::DisconnectDone {
                token: params.token,
            });
            return;
        }
        if self.state.is_activating() || self.state.is_disconnecting() || self.partial_retry.is_some()
        {
            // Teardown must not race the retry caller out of its reply
            trace!(id = %self.id, "deferring disconnect");
            self.deferred.push_back(Request::Disconnect(params));
            return;
        }
        if !self.attached.remove(&params.context) {
            warn!(id = %self.id, context = %params.context, "disconnect from unattached context");
        }
        if !self.attached.is_empty() {
            trace!(id = %self.id, refs = self.attached.len(), "detached, session stays up");
            self.events.push_back(SessionEvent::DisconnectDone {
                token: params.token,
            });
            return;
        }
        self.begin_teardown(now, vec![params.token], params.reason);
    }

    fn on_disconnect_all(&mut self, now: Instant, token: Token, reason: String) {
        if self.state.is_inactive() {
            // Idempotent no-op, but the caller still gets its completion
            self.events.push_back(SessionEvent::DisconnectDone { token });
            return;
        }
        if self.state.is_activating() || self.state.is_disconnecting() || self.partial_retry.is_some()
        {
            trace!(id = %self.id, "deferring disconnect-all");
            self.deferred.push_back(Request::DisconnectAll { token, reason });
            return;
        }
        let contexts: Vec<ContextId> = self.attached.drain().collect();
        for context in contexts {
            self.events.push_back(SessionEvent::Detached { context });
        }
        self.begin_teardown(now, vec![token], reason);
    }

    fn on_qos_request(&mut self, request: Request) {
        if self.state.is_activating() {
            trace!(id = %self.id, "deferring qos request until active");
            self.deferred.push_back(request);
            return;
        }
        if !self.state.is_up() {
            self.events.push_back(qos_failure_event(&request, QosError::NotActive));
            return;
        }
        if self.qos_kind_busy(&request) {
            // At most one outstanding command per kind keeps replies
            // attributable to their requests
            trace!(id = %self.id, "deferring qos request behind outstanding command");
            self.deferred.push_back(request);
            return;
        }
        let tag = self.tag;
        match request {
            Request::QosSetup { token, spec } => {
                self.commands.push_back(Command::QosSetup {
                    tag,
                    connection_id: self.cid,
                    spec: spec.clone(),
                });
                self.pending_qos.push(PendingQos::Setup { token, spec });
                self.enter_qos_active();
            }
            Request::QosRelease { token, flow } => {
                if !self.qos.begin_release(flow) {
                    self.events.push_back(SessionEvent::QosReleaseDone {
                        token,
                        result: Err(QosError::NoSuchFlow),
                    });
                    return;
                }
                self.commands.push_back(Command::QosRelease { tag, flow });
                self.pending_qos.push(PendingQos::Release { token, flow });
            }
            Request::QosSuspend { token, flow } => {
                if !self.qos.begin_suspend(flow) {
                    self.events.push_back(SessionEvent::QosSuspendDone {
                        token,
                        result: Err(QosError::NoSuchFlow),
                    });
                    return;
                }
                self.commands.push_back(Command::QosSuspend { tag, flow });
                self.pending_qos.push(PendingQos::Suspend { token, flow });
            }
            Request::QosResume { token, flow } => {
                if !self.qos.begin_resume(flow) {
                    self.events.push_back(SessionEvent::QosResumeDone {
                        token,
                        result: Err(QosError::NoSuchFlow),
                    });
                    return;
                }
                self.commands.push_back(Command::QosResume { tag, flow });
                self.pending_qos.push(PendingQos::Resume { token, flow });
            }
            Request::QosGetStatus { token, flow } => {
                self.commands.push_back(Command::QosGetStatus { tag, flow });
                self.pending_qos.push(PendingQos::Status { token, flow });
                self.enter_qos_active();
            }
            _ => unreachable!("non-qos request routed to qos handler"),
        }
    }

    //
    // Transport completion handling
    //

    fn on_setup_done(&mut self, now: Instant, tag: u64, reply: SetupReply) {
        if let Some(a) = self.state.as_activating() {
            if a.tag != tag {
                trace!(id = %self.id, tag, current = a.tag, "discarding stale setup reply");
                return;
            }
            if a.awaiting_fail_cause {
                warn!(id = %self.id, "setup reply while awaiting failure cause");
                return;
            }
            self.complete_activation(now, reply);
            return;
        }
        let retry_matches = self.state.is_up()
            && self
                .partial_retry
                .as_ref()
                .map_or(false, |pr| pr.tag == tag);
        if retry_matches {
            self.complete_partial_retry(now, reply);
            return;
        }
        trace!(id = %self.id, tag, "discarding stale setup reply");
    }

    /// Resolution of an activation issued from Inactive, checked in order:
    /// radio gone, legacy query, rejection, success
    fn complete_activation(&mut self, now: Instant, reply: SetupReply) {
        let a = self.state.as_activating().expect("checked by caller");
        let token = a.params.token;
        let context = a.params.context;
        let protocol = a.protocol;
        let tag = a.tag;

        if reply.fault == Some(TransportFault::RadioNotAvailable) {
            self.fail_activation(now, token, FailCause::RadioNotAvailable, None);
            return;
        }
        let failed = reply.fault.is_some() || reply.status != 0;
        if failed && self.transport_version < MIN_STRUCTURED_ERROR_VERSION {
            // Too old to carry a structured error; ask the radio what happened
            debug!(id = %self.id, version = self.transport_version, "querying last failure cause");
            let a = self.state.as_activating_mut().expect("checked by caller");
            a.awaiting_fail_cause = true;
            self.commands.push_back(Command::GetLastFailureCause {
                tag,
                connection_id: reply.connection_id,
            });
            return;
        }
        if reply.fault.is_some() {
            self.fail_activation(now, token, FailCause::Unknown, reply.suggested_retry);
            return;
        }
        if reply.status != 0 {
            let cause = FailCause::from_transport_code(reply.status);
            self.record_pending_protocol(cause, reply.link.as_ref());
            self.fail_activation(now, token, cause, reply.suggested_retry);
            return;
        }

        let resolved = reply
            .link
            .as_ref()
            .map(|info| info.resolve(&self.config.fallback_dns, &self.link))
            .unwrap_or_default();
        if !resolved.has_address() {
            // Nominal success with nothing usable; tear the half-open
            // connection down before reporting failure
            warn!(id = %self.id, "activation succeeded without usable addresses");
            self.cid = reply.connection_id;
            self.commands.push_back(Command::Deactivate {
                tag,
                connection_id: reply.connection_id,
                reason: "unacceptable network parameter".into(),
            });
            self.state
                .move_to_disconnecting_error(DisconnectingError { tag, token });
            return;
        }

        self.cid = reply.connection_id;
        self.link = resolved;
        self.apply_dual_stack(protocol);
        self.attached.insert(context);
        self.state.move_to_active();
        debug_assert!(self.cid >= 0);
        debug!(
            id = %self.id,
            cid = self.cid,
            partial = self.partial_success,
            "session active"
        );
        self.events.push_back(SessionEvent::ConnectDone {
            token,
            result: Ok(ConnectOutcome {
                link: self.link.clone(),
                partial: self.partial_success,
            }),
        });
        self.replay_deferred(now);
    }

    fn complete_partial_retry(&mut self, now: Instant, reply: SetupReply) {
        let pr = self.partial_retry.take().expect("checked by caller");
        let requested = self
            .profile
            .as_ref()
            .map(|p| p.protocol)
            .unwrap_or(Protocol::Ipv4v6);
        let ok = reply.fault.is_none() && reply.status == 0 && reply.link.is_some();
        if ok {
            let info = reply.link.as_ref().expect("checked above");
            let resolved = info.resolve(&self.config.fallback_dns, &self.link);
            if resolved.has_address() {
                self.cid = reply.connection_id;
                self.link = resolved;
                self.apply_dual_stack(requested);
            }
        } else {
            // The session stays up on the family it already has
            let cause = if reply.fault == Some(TransportFault::RadioNotAvailable) {
                FailCause::RadioNotAvailable
            } else if reply.status != 0 {
                FailCause::from_transport_code(reply.status)
            } else {
                FailCause::Unknown
            };
            self.record_pending_protocol(cause, reply.link.as_ref());
            self.last_fail = Some((now, cause));
            debug!(id = %self.id, %cause, "partial retry failed, session stays partial");
        }
        // Either way the caller ends up attached to the live session
        self.attached.insert(pr.context);
        self.events.push_back(SessionEvent::ConnectDone {
            token: pr.token,
            result: Ok(ConnectOutcome {
                link: self.link.clone(),
                partial: self.partial_success,
            }),
        });
        self.replay_deferred(now);
    }

    fn on_deactivate_done(&mut self, now: Instant, tag: u64) {
        if self.state.as_disconnecting().map_or(false, |d| d.tag == tag) {
            let old = self.to_inactive(now, None);
            if let InnerState::Disconnecting(d) = old {
                for token in d.tokens {
                    self.events.push_back(SessionEvent::DisconnectDone { token });
                }
            }
            debug!(id = %self.id, "session inactive");
            self.replay_deferred(now);
            return;
        }
        if self
            .state
            .as_disconnecting_error()
            .map_or(false, |d| d.tag == tag)
        {
            let old = self.to_inactive(now, Some(FailCause::UnacceptableNetworkParameter));
            if let InnerState::DisconnectingError(d) = old {
                self.events.push_back(SessionEvent::ConnectDone {
                    token: d.token,
                    result: Err(ConnectFailure {
                        cause: FailCause::UnacceptableNetworkParameter,
                        retry_hint: None,
                    }),
                });
            }
            self.replay_deferred(now);
            return;
        }
        trace!(id = %self.id, tag, "discarding stale deactivate reply");
    }

    fn on_last_failure_cause(&mut self, now: Instant, tag: u64, code: i32) {
        let matches = self
            .state
            .as_activating()
            .map(|a| a.tag == tag && a.awaiting_fail_cause)
            .unwrap_or(false);
        if !matches {
            trace!(id = %self.id, tag, "discarding stale failure-cause reply");
            return;
        }
        let token = self.state.as_activating().expect("checked above").params.token;
        let cause = FailCause::from_transport_code(code);
        // Legacy replies carry no link properties, so the family is absent
        self.record_pending_protocol(cause, None);
        self.fail_activation(now, token, cause, None);
    }

    fn on_qos_setup_done(&mut self, now: Instant, tag: u64, reply: QosSetupReply) {
        if tag != self.tag {
            trace!(id = %self.id, tag, "discarding stale qos setup reply");
            return;
        }
        let Some(PendingQos::Setup { token, spec }) =
            self.take_pending(|p| matches!(p, PendingQos::Setup { .. }))
        else {
            trace!(id = %self.id, "qos setup reply without pending setup");
            return;
        };
        let result = match self.qos.setup_done(spec, &reply) {
            Ok(flow) => {
                debug!(id = %self.id, %flow, "qos flow activated");
                Ok(flow)
            }
            Err(QosSetupFailure::Rejected(status)) => Err(QosError::Rejected(status)),
            Err(QosSetupFailure::Malformed) => {
                warn!(id = %self.id, ?reply, "malformed qos setup reply");
                Err(QosError::Malformed)
            }
        };
        self.events.push_back(SessionEvent::QosSetupDone { token, result });
        self.maybe_exit_qos();
        self.replay_deferred(now);
    }

    fn on_qos_simple_done(&mut self, now: Instant, tag: u64, flow: FlowId, status: i32, kind: QosKind) {
        if tag != self.tag {
            trace!(id = %self.id, tag, %flow, "discarding stale qos reply");
            return;
        }
        let pending = self.take_pending(|p| match (kind, p) {
            (QosKind::Release, PendingQos::Release { flow: f, .. }) => *f == flow,
            (QosKind::Suspend, PendingQos::Suspend { flow: f, .. }) => *f == flow,
            (QosKind::Resume, PendingQos::Resume { flow: f, .. }) => *f == flow,
            _ => false,
        });
        let Some(pending) = pending else {
            trace!(id = %self.id, %flow, "qos reply without pending operation");
            return;
        };
        let token = match pending {
            PendingQos::Release { token, .. }
            | PendingQos::Suspend { token, .. }
            | PendingQos::Resume { token, .. } => token,
            _ => unreachable!(),
        };
        let result = if status == 0 {
            match kind {
                QosKind::Release => self.qos.release_done(flow),
                QosKind::Suspend => self.qos.suspend_done(flow),
                QosKind::Resume => self.qos.resume_done(flow),
            }
            Ok(())
        } else {
            // The flow returns to the state it held before the command
            self.qos.revert(flow);
            Err(QosError::Rejected(status))
        };
        self.events.push_back(match kind {
            QosKind::Release => SessionEvent::QosReleaseDone { token, result },
            QosKind::Suspend => SessionEvent::QosSuspendDone { token, result },
            QosKind::Resume => SessionEvent::QosResumeDone { token, result },
        });
        self.maybe_exit_qos();
        self.replay_deferred(now);
    }

    fn on_qos_status_done(&mut self, now: Instant, tag: u64, flow: FlowId, reply: QosStatusReply) {
        if tag != self.tag {
            trace!(id = %self.id, tag, %flow, "discarding stale qos status reply");
            return;
        }
        let Some(PendingQos::Status { token, .. }) =
            self.take_pending(|p| matches!(p, PendingQos::Status { flow: f, .. } if *f == flow))
        else {
            trace!(id = %self.id, %flow, "qos status reply without pending query");
            return;
        };
        let result = if reply.status == 0 {
            Ok((reply.flow_state(), reply.descriptors))
        } else {
            Err(QosError::Rejected(reply.status))
        };
        self.events.push_back(SessionEvent::QosStatusDone { token, result });
        self.maybe_exit_qos();
        self.replay_deferred(now);
    }

    fn on_qos_indication(&mut self, flow: FlowId, indication: QosIndication) {
        if !self.state.is_qos_active() {
            trace!(id = %self.id, %flow, ?indication, "qos indication outside qos-active");
            return;
        }
        if let Some(state) = self.qos.indication(flow, indication) {
            self.events
                .push_back(SessionEvent::QosStateChanged { flow, state });
        }
        self.maybe_exit_qos();
    }

    //
    // Internals
    //

    /// Tear the transport connection down, or go straight to Inactive when
    /// there is no channel to tear down
    fn begin_teardown(&mut self, now: Instant, tokens: Vec<Token>, reason: String) {
        debug_assert!(self.attached.is_empty());
        debug_assert!(self.partial_retry.is_none(), "teardown with a retry caller still waiting");
        let tag = self.tag;
        if self.state.is_qos_active() {
            // Flow releases are fire-and-forget; teardown does not wait
            for flow in self.qos.drain_for_teardown() {
                self.commands.push_back(Command::QosRelease { tag, flow });
            }
        }
        self.fail_pending_qos();
        if !self.radio_on || self.cid == CID_NONE {
            debug!(id = %self.id, "no transport channel, deactivation is immediate");
            self.to_inactive(now, None);
            for token in tokens {
                self.events.push_back(SessionEvent::DisconnectDone { token });
            }
            self.replay_deferred(now);
            return;
        }
        debug!(id = %self.id, cid = self.cid, reason = %reason, "deactivating");
        self.commands.push_back(Command::Deactivate {
            tag,
            connection_id: self.cid,
            reason,
        });
        self.state
            .move_to_disconnecting(Disconnecting { tag, tokens });
    }

    fn fail_activation(
        &mut self,
        now: Instant,
        token: Token,
        cause: FailCause,
        retry_hint: Option<Duration>,
    ) {
        self.to_inactive(now, Some(cause));
        self.events.push_back(SessionEvent::ConnectDone {
            token,
            result: Err(ConnectFailure { cause, retry_hint }),
        });
        self.replay_deferred(now);
    }

    /// Return to Inactive: clear connection state, advance the generation
    /// tag, and hand back the replaced state's bookkeeping
    fn to_inactive(&mut self, now: Instant, cause: Option<FailCause>) -> InnerState {
        if let Some(cause) = cause {
            self.last_fail = Some((now, cause));
            if cause.is_loggable() {
                debug!(id = %self.id, %cause, "session failed");
            }
        }
        self.cid = CID_NONE;
        self.attached.clear();
        self.partial_success = false;
        self.partial_retry = None;
        self.profile = None;
        self.fail_pending_qos();
        self.qos.drain_for_teardown();
        // The proxy is local configuration and survives the cycle
        self.link = LinkProperties {
            http_proxy: self.link.http_proxy.take(),
            ..LinkProperties::default()
        };
        self.tag += 1;
        self.state.move_to_inactive()
    }

    /// Every pending QoS operation still gets its one terminating reply
    fn fail_pending_qos(&mut self) {
        for pending in mem::take(&mut self.pending_qos) {
            self.events.push_back(match pending {
                PendingQos::Setup { token, .. } => SessionEvent::QosSetupDone {
                    token,
                    result: Err(QosError::NotActive),
                },
                PendingQos::Release { token, .. } => SessionEvent::QosReleaseDone {
                    token,
                    result: Err(QosError::NotActive),
                },
                PendingQos::Suspend { token, .. } => SessionEvent::QosSuspendDone {
                    token,
                    result: Err(QosError::NotActive),
                },
                PendingQos::Resume { token, .. } => SessionEvent::QosResumeDone {
                    token,
                    result: Err(QosError::NotActive),
                },
                PendingQos::Status { token, .. } => SessionEvent::QosStatusDone {
                    token,
                    result: Err(QosError::NotActive),
                },
            });
        }
    }

    /// Update partial-success bookkeeping from the families actually present
    fn apply_dual_stack(&mut self, requested: Protocol) {
        match DualStackOutcome::evaluate(requested, &self.link) {
            DualStackOutcome::Full => {
                self.partial_success = false;
                self.pending_protocol = None;
            }
            DualStackOutcome::Partial { pending } => {
                debug!(id = %self.id, %pending, "dual-stack bring-up is partial");
                self.partial_success = true;
                self.pending_protocol = Some(pending);
            }
            // A total miss is rejected before this point
            DualStackOutcome::Neither => {}
        }
    }

    /// Record the family to request next when the network only allows one
    fn record_pending_protocol(&mut self, cause: FailCause, link: Option<&LinkInfo>) {
        let allowed = match cause {
            FailCause::OnlyIpv4Allowed => Protocol::Ipv4,
            FailCause::OnlyIpv6Allowed => Protocol::Ipv6,
            _ => return,
        };
        let present = link.map_or(false, |info| {
            info.addresses.iter().any(|a| match allowed {
                Protocol::Ipv4 => a.is_ipv4(),
                Protocol::Ipv6 => a.is_ipv6(),
                Protocol::Ipv4v6 => true,
            })
        });
        if !present {
            debug!(id = %self.id, %allowed, "recording pending protocol");
            self.pending_protocol = Some(allowed);
        }
    }

    fn enter_qos_active(&mut self) {
        if !self.state.is_qos_active() {
            self.state.move_to_qos_active();
        }
    }

    fn maybe_exit_qos(&mut self) {
        if self.state.is_qos_active() && self.qos.is_empty() && self.pending_qos.is_empty() {
            self.state.move_to_active();
        }
    }

    fn take_pending(&mut self, matcher: impl Fn(&PendingQos) -> bool) -> Option<PendingQos> {
        let idx = self.pending_qos.iter().position(matcher)?;
        Some(self.pending_qos.remove(idx))
    }

    /// Whether a command of the request's kind is already outstanding
    fn qos_kind_busy(&self, request: &Request) -> bool {
        self.pending_qos.iter().any(|p| {
            matches!(
                (request, p),
                (Request::QosSetup { .. }, PendingQos::Setup { .. })
                    | (Request::QosRelease { .. }, PendingQos::Release { .. })
                    | (Request::QosSuspend { .. }, PendingQos::Suspend { .. })
                    | (Request::QosResume { .. }, PendingQos::Resume { .. })
                    | (Request::QosGetStatus { .. }, PendingQos::Status { .. })
            )
        })
    }

    /// Replay deferred requests in their original arrival order
    fn replay_deferred(&mut self, now: Instant) {
        if self.replaying {
            return;
        }
        self.replaying = true;
        let mut queue = mem::take(&mut self.deferred);
        while let Some(request) = queue.pop_front() {
            trace!(id = %self.id, "replaying deferred request");
            self.handle_request(now, request);
        }
        self.replaying = false;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum QosKind {
    Release,
    Suspend,
    Resume,
}

/// Terminating failure notification for a QoS request that cannot proceed
fn qos_failure_event(request: &Request, error: QosError) -> SessionEvent {
    match *request {
        Request::QosSetup { token, .. } => SessionEvent::QosSetupDone {
            token,
            result: Err(error),
        },
        Request::QosRelease { token, .. } => SessionEvent::QosReleaseDone {
            token,
            result: Err(error),
        },
        Request::QosSuspend { token, .. } => SessionEvent::QosSuspendDone {
            token,
            result: Err(error),
        },
        Request::QosResume { token, .. } => SessionEvent::QosResumeDone {
            token,
            result: Err(error),
        },
        Request::QosGetStatus { token, .. } => SessionEvent::QosStatusDone {
            token,
            result: Err(error),
        },
        _ => unreachable!("non-qos request routed to qos failure"),
    }
}

#[cfg(test)]
mod tests;
