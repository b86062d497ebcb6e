use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error_span, Instrument};

use proto::{
    ApnProfile, Command, ConnectFailure, ConnectOutcome, ConnectParams, ContextId,
    DisconnectParams, FailCause, FlowId, QosError, QosFlowState, QosSpec, Request, SessionConfig,
    SessionEvent, SessionId, SessionSnapshot, StateKind, TransportEvent,
};

use crate::router::{Completion, ConnectPending, NotificationRouter};
use crate::transport::{RadioIndication, RadioTransport};

/// The driver task has exited and can no longer service requests
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("session driver has shut down")]
pub struct SessionClosed;

/// Why a bring-up attempt failed
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum BringUpError {
    /// The network or radio rejected the activation
    #[error("activation rejected: {cause}")]
    Rejected {
        /// Classified cause
        cause: FailCause,
        /// When the caller should try again, or `None` when retrying is
        /// pointless
        retry_in: Option<Duration>,
    },
    /// The session shut down before the attempt completed
    #[error(transparent)]
    Closed(#[from] SessionClosed),
}

/// Errors surfaced on QoS calls
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum QosCallError {
    /// The session rejected or could not service the operation
    #[error(transparent)]
    Qos(#[from] QosError),
    /// The session shut down before the operation completed
    #[error(transparent)]
    Closed(#[from] SessionClosed),
}

/// Unsolicited flow state change, fanned out to every subscriber
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QosEvent {
    /// The affected flow
    pub flow: FlowId,
    /// Its new reportable state
    pub state: QosFlowState,
}

/// Decides how long a caller should wait before retrying a failed bring-up
pub trait RetryPolicy: Send + 'static {
    /// Delay before the next attempt, or `None` when retrying is pointless
    fn next_delay(&mut self, failure: &ConnectFailure) -> Option<Duration>;
    /// Called after a successful bring-up
    fn reset(&mut self);
}

/// Doubling backoff, capped, that defers to the network's suggested delay
/// when the transport supplied one
pub struct ExponentialBackoff {
    attempt: u32,
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Backoff starting at `base` and doubling up to `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            attempt: 0,
            base,
            max,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&mut self, failure: &ConnectFailure) -> Option<Duration> {
        if failure.is_permanent() {
            return None;
        }
        let attempt = self.attempt;
        self.attempt += 1;
        if let Some(hint) = failure.retry_hint {
            return Some(hint);
        }
        Some((self.base * 2u32.saturating_pow(attempt.min(16))).min(self.max))
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

enum Msg {
    BringUp {
        profile: ApnProfile,
        reply: oneshot::Sender<Result<(ContextId, ConnectOutcome), BringUpError>>,
        detached: oneshot::Sender<()>,
    },
    TearDown {
        context: ContextId,
        reason: String,
        reply: oneshot::Sender<()>,
    },
    TearDownAll {
        reason: String,
        reply: oneshot::Sender<()>,
    },
    QosSetup {
        spec: QosSpec,
        reply: oneshot::Sender<Result<FlowId, QosError>>,
    },
    QosRelease {
        flow: FlowId,
        reply: oneshot::Sender<Result<(), QosError>>,
    },
    QosSuspend {
        flow: FlowId,
        reply: oneshot::Sender<Result<(), QosError>>,
    },
    QosResume {
        flow: FlowId,
        reply: oneshot::Sender<Result<(), QosError>>,
    },
    QosStatus {
        flow: FlowId,
        reply: oneshot::Sender<Result<(QosFlowState, Vec<String>), QosError>>,
    },
    Radio(TransportEvent),
}

/// Handle to a packet-data session
///
/// Cheaply clonable; every clone talks to the same driver task. The session
/// stays alive while any clone or [`Attachment`] exists and shuts down once
/// all of them drop.
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    inbox: mpsc::Sender<Msg>,
    snapshot: watch::Receiver<SessionSnapshot>,
    qos_events: broadcast::Sender<QosEvent>,
}

impl Session {
    /// Create a session and spawn its driver on the current runtime
    ///
    /// `indications` carries unsolicited radio notifications; closing it is
    /// harmless and simply stops indication delivery.
    pub fn new(
        id: SessionId,
        config: SessionConfig,
        transport: Arc<dyn RadioTransport>,
        retry: Box<dyn RetryPolicy>,
        indications: mpsc::Receiver<RadioIndication>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (qos_tx, _) = broadcast::channel(16);
        let driver = SessionDriver {
            proto: proto::Session::new(id, config, Instant::now()),
            transport,
            retry,
            router: NotificationRouter::default(),
            inbox: inbox_rx,
            feedback: inbox_tx.downgrade(),
            indications,
            indications_done: false,
            snapshot: snapshot_tx,
            qos_events: qos_tx.clone(),
            next_context: 0,
        };
        tokio::spawn(driver.run().instrument(error_span!("session", id = %id)));
        Self {
            id,
            inbox: inbox_tx,
            snapshot: snapshot_rx,
            qos_events: qos_tx,
        }
    }

    /// This session's identity
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Attach to the session, activating it if it is not already up
    ///
    /// Resolves once the activation reaches a terminating outcome. Callers
    /// beyond the first share the existing connection and resolve
    /// immediately.
    pub async fn bring_up(&self, profile: ApnProfile) -> Result<Attachment, BringUpError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (detached_tx, detached_rx) = oneshot::channel();
        self.inbox
            .send(Msg::BringUp {
                profile,
                reply: reply_tx,
                detached: detached_tx,
            })
            .await
            .map_err(|_| SessionClosed)?;
        let (context, outcome) = reply_rx.await.map_err(|_| SessionClosed)??;
        Ok(Attachment {
            session: self.clone(),
            context,
            outcome,
            detached: detached_rx,
        })
    }

    /// Force teardown, detaching every attached context
    ///
    /// Resolves once the connection is down. Idempotent while inactive.
    pub async fn tear_down_all(&self, reason: impl Into<String>) -> Result<(), SessionClosed> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Msg::TearDownAll {
                reason: reason.into(),
                reply: tx,
            })
            .await
            .map_err(|_| SessionClosed)?;
        rx.await.map_err(|_| SessionClosed)
    }

    /// Negotiate a new QoS flow on the active connection
    pub async fn qos_setup(&self, spec: QosSpec) -> Result<FlowId, QosCallError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Msg::QosSetup { spec, reply: tx })
            .await
            .map_err(|_| SessionClosed)?;
        let result = rx.await.map_err(|_| SessionClosed)?;
        Ok(result?)
    }

    /// Release a QoS flow
    pub async fn qos_release(&self, flow: FlowId) -> Result<(), QosCallError> {
        self.qos_unit(|reply| Msg::QosRelease { flow, reply }).await
    }

    /// Suspend a QoS flow
    pub async fn qos_suspend(&self, flow: FlowId) -> Result<(), QosCallError> {
        self.qos_unit(|reply| Msg::QosSuspend { flow, reply }).await
    }

    /// Resume a suspended QoS flow
    pub async fn qos_resume(&self, flow: FlowId) -> Result<(), QosCallError> {
        self.qos_unit(|reply| Msg::QosResume { flow, reply }).await
    }

    /// Query a QoS flow's current state and descriptors
    pub async fn qos_status(
        &self,
        flow: FlowId,
    ) -> Result<(QosFlowState, Vec<String>), QosCallError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Msg::QosStatus { flow, reply: tx })
            .await
            .map_err(|_| SessionClosed)?;
        let result = rx.await.map_err(|_| SessionClosed)?;
        Ok(result?)
    }

    async fn qos_unit(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), QosError>>) -> Msg,
    ) -> Result<(), QosCallError> {
        let (tx, rx) = oneshot::channel();
        self.inbox.send(make(tx)).await.map_err(|_| SessionClosed)?;
        let result = rx.await.map_err(|_| SessionClosed)?;
        Ok(result?)
    }

    /// Point-in-time view of the session's state
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> StateKind {
        self.snapshot.borrow().kind
    }

    /// Subscribe to unsolicited QoS flow state changes
    pub fn qos_events(&self) -> broadcast::Receiver<QosEvent> {
        self.qos_events.subscribe()
    }
}

/// One context's membership in a session
///
/// Returned by [`Session::bring_up`]. Dropping it without calling
/// [`tear_down`](Attachment::tear_down) leaks the attachment until the
/// session is torn down by other means.
pub struct Attachment {
    session: Session,
    context: ContextId,
    outcome: ConnectOutcome,
    detached: oneshot::Receiver<()>,
}

impl Attachment {
    /// The session this attachment belongs to
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// This attachment's context handle
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// The bring-up outcome: resolved link and the partial-stack flag
    pub fn outcome(&self) -> &ConnectOutcome {
        &self.outcome
    }

    /// Detach from the session, tearing the connection down when this was
    /// the last attachment
    ///
    /// Resolves once the detach has taken effect.
    pub async fn tear_down(self, reason: impl Into<String>) -> Result<(), SessionClosed> {
        let (tx, rx) = oneshot::channel();
        self.session
            .inbox
            .send(Msg::TearDown {
                context: self.context,
                reason: reason.into(),
                reply: tx,
            })
            .await
            .map_err(|_| SessionClosed)?;
        rx.await.map_err(|_| SessionClosed)
    }

    /// Resolve when a forced teardown detaches this context, or when the
    /// session shuts down
    pub async fn detached(self) {
        let _ = self.detached.await;
    }
}

/// Owns the protocol state machine and bridges it to the transport
///
/// Runs until every [`Session`] handle and [`Attachment`] has dropped.
/// Transport commands execute on sub-tasks so a slow radio never blocks the
/// inbox; their completions come back through the same inbox as
/// [`Msg::Radio`] and are matched to the issuing generation by the state
/// machine itself.
struct SessionDriver {
    proto: proto::Session,
    transport: Arc<dyn RadioTransport>,
    retry: Box<dyn RetryPolicy>,
    router: NotificationRouter,
    inbox: mpsc::Receiver<Msg>,
    feedback: mpsc::WeakSender<Msg>,
    indications: mpsc::Receiver<RadioIndication>,
    indications_done: bool,
    snapshot: watch::Sender<SessionSnapshot>,
    qos_events: broadcast::Sender<QosEvent>,
    next_context: u64,
}

impl SessionDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle_msg(msg),
                    None => break,
                },
                ind = self.indications.recv(), if !self.indications_done => match ind {
                    Some(ind) => self.handle_indication(ind),
                    None => self.indications_done = true,
                },
            }
            self.flush();
        }
        debug!("session driver exiting");
    }

    fn handle_msg(&mut self, msg: Msg) {
        let now = Instant::now();
        match msg {
            Msg::BringUp {
                profile,
                reply,
                detached,
            } => {
                let context = ContextId(self.next_context);
                self.next_context += 1;
                let token = self.router.register(Completion::Connect(ConnectPending {
                    context,
                    reply,
                    detached,
                }));
                self.proto.handle_request(
                    now,
                    Request::Connect(ConnectParams {
                        context,
                        token,
                        profile,
                    }),
                );
            }
            Msg::TearDown {
                context,
                reason,
                reply,
            } => {
                self.router.drop_detach_sink(context);
                let token = self.router.register(Completion::Disconnect(reply));
                self.proto.handle_request(
                    now,
                    Request::Disconnect(DisconnectParams {
                        context,
                        token,
                        reason,
                    }),
                );
            }
            Msg::TearDownAll { reason, reply } => {
                let token = self.router.register(Completion::Disconnect(reply));
                self.proto
                    .handle_request(now, Request::DisconnectAll { token, reason });
            }
            Msg::QosSetup { spec, reply } => {
                let token = self.router.register(Completion::QosSetup(reply));
                self.proto
                    .handle_request(now, Request::QosSetup { token, spec });
            }
            Msg::QosRelease { flow, reply } => {
                let token = self.router.register(Completion::QosUnit(reply));
                self.proto
                    .handle_request(now, Request::QosRelease { token, flow });
            }
            Msg::QosSuspend { flow, reply } => {
                let token = self.router.register(Completion::QosUnit(reply));
                self.proto
                    .handle_request(now, Request::QosSuspend { token, flow });
            }
            Msg::QosResume { flow, reply } => {
                let token = self.router.register(Completion::QosUnit(reply));
                self.proto
                    .handle_request(now, Request::QosResume { token, flow });
            }
            Msg::QosStatus { flow, reply } => {
                let token = self.router.register(Completion::QosStatus(reply));
                self.proto
                    .handle_request(now, Request::QosGetStatus { token, flow });
            }
            Msg::Radio(event) => self.proto.handle_transport(now, event),
        }
    }

    fn handle_indication(&mut self, ind: RadioIndication) {
        let event = match ind {
            RadioIndication::QosStateChanged { flow, indication } => {
                TransportEvent::QosStateChanged { flow, indication }
            }
            RadioIndication::RadioConnected { version } => {
                TransportEvent::RadioConnected { version }
            }
            RadioIndication::RadioOff => TransportEvent::RadioOff,
        };
        self.proto.handle_transport(Instant::now(), event);
    }

    /// Drain commands and notifications produced by the last input, then
    /// publish the new snapshot
    fn flush(&mut self) {
        while let Some(cmd) = self.proto.poll_command() {
            self.issue(cmd);
        }
        while let Some(event) = self.proto.poll_event() {
            self.dispatch(event);
        }
        self.snapshot.send_replace(self.proto.snapshot());
    }

    /// Execute one transport command on a sub-task, posting its completion
    /// back through the inbox
    fn issue(&self, cmd: Command) {
        // Upgrade fails only while shutting down, when replies have no home
        let Some(feedback) = self.feedback.upgrade() else {
            return;
        };
        let transport = self.transport.clone();
        match cmd {
            Command::Activate {
                tag,
                profile,
                protocol,
            } => {
                tokio::spawn(async move {
                    let reply = transport.activate(&profile, protocol).await;
                    let _ = feedback
                        .send(Msg::Radio(TransportEvent::SetupDone { tag, reply }))
                        .await;
                });
            }
            Command::Deactivate {
                tag,
                connection_id,
                reason,
            } => {
                tokio::spawn(async move {
                    transport.deactivate(connection_id, &reason).await;
                    let _ = feedback
                        .send(Msg::Radio(TransportEvent::DeactivateDone { tag }))
                        .await;
                });
            }
            Command::GetLastFailureCause { tag, connection_id } => {
                tokio::spawn(async move {
                    let code = transport.get_last_failure_cause(connection_id).await;
                    let _ = feedback
                        .send(Msg::Radio(TransportEvent::LastFailureCause { tag, code }))
                        .await;
                });
            }
            Command::QosSetup {
                tag,
                connection_id,
                spec,
            } => {
                tokio::spawn(async move {
                    let reply = transport.qos_setup(connection_id, &spec).await;
                    let _ = feedback
                        .send(Msg::Radio(TransportEvent::QosSetupDone { tag, reply }))
                        .await;
                });
            }
            Command::QosRelease { tag, flow } => {
                tokio::spawn(async move {
                    let status = transport.qos_release(flow).await;
                    let _ = feedback
                        .send(Msg::Radio(TransportEvent::QosReleaseDone { tag, flow, status }))
                        .await;
                });
            }
            Command::QosSuspend { tag, flow } => {
                tokio::spawn(async move {
                    let status = transport.qos_suspend(flow).await;
                    let _ = feedback
                        .send(Msg::Radio(TransportEvent::QosSuspendDone { tag, flow, status }))
                        .await;
                });
            }
            Command::QosResume { tag, flow } => {
                tokio::spawn(async move {
                    let status = transport.qos_resume(flow).await;
                    let _ = feedback
                        .send(Msg::Radio(TransportEvent::QosResumeDone { tag, flow, status }))
                        .await;
                });
            }
            Command::QosGetStatus { tag, flow } => {
                tokio::spawn(async move {
                    let reply = transport.qos_get_status(flow).await;
                    let _ = feedback
                        .send(Msg::Radio(TransportEvent::QosStatusDone { tag, flow, reply }))
                        .await;
                });
            }
        }
    }

    fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ConnectDone { token, result } => {
                let result = match result {
                    Ok(outcome) => {
                        self.retry.reset();
                        Ok(outcome)
                    }
                    Err(failure) => {
                        let retry_in = self.retry.next_delay(&failure);
                        Err(BringUpError::Rejected {
                            cause: failure.cause,
                            retry_in,
                        })
                    }
                };
                self.router.finish_connect(token, result);
            }
            SessionEvent::DisconnectDone { token } => self.router.finish_disconnect(token),
            SessionEvent::Detached { context } => self.router.notify_detached(context),
            SessionEvent::QosSetupDone { token, result } => {
                self.router.finish_qos_setup(token, result)
            }
            SessionEvent::QosReleaseDone { token, result }
            | SessionEvent::QosSuspendDone { token, result }
            | SessionEvent::QosResumeDone { token, result } => {
                self.router.finish_qos_unit(token, result)
            }
            SessionEvent::QosStatusDone { token, result } => {
                self.router.finish_qos_status(token, result)
            }
            SessionEvent::QosStateChanged { flow, state } => {
                // No subscribers is fine, the send just reports zero
                let _ = self.qos_events.send(QosEvent { flow, state });
            }
        }
    }
}
