use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::warn;

use proto::{ConnectOutcome, ContextId, FlowId, QosError, QosFlowState, Token};

use crate::session::BringUpError;

/// Bookkeeping for a bring-up request awaiting its terminating reply
pub(crate) struct ConnectPending {
    pub(crate) context: ContextId,
    pub(crate) reply: oneshot::Sender<Result<(ContextId, ConnectOutcome), BringUpError>>,
    pub(crate) detached: oneshot::Sender<()>,
}

/// One registered completion sink per outstanding request
pub(crate) enum Completion {
    Connect(ConnectPending),
    Disconnect(oneshot::Sender<()>),
    QosSetup(oneshot::Sender<Result<FlowId, QosError>>),
    QosUnit(oneshot::Sender<Result<(), QosError>>),
    QosStatus(oneshot::Sender<Result<(QosFlowState, Vec<String>), QosError>>),
}

/// Routes terminating notifications back to the callers that attached to
/// this session, including the fan-out on bulk teardown
///
/// Every request registers exactly one completion sink keyed by token; a
/// dropped receiver is tolerated since the requester may have gone away.
#[derive(Default)]
pub(crate) struct NotificationRouter {
    next_token: u64,
    pending: FxHashMap<Token, Completion>,
    detach_sinks: FxHashMap<ContextId, oneshot::Sender<()>>,
}

impl NotificationRouter {
    pub(crate) fn register(&mut self, completion: Completion) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.pending.insert(token, completion);
        token
    }

    pub(crate) fn finish_connect(
        &mut self,
        token: Token,
        result: Result<ConnectOutcome, BringUpError>,
    ) {
        match self.pending.remove(&token) {
            Some(Completion::Connect(p)) => match result {
                Ok(outcome) => {
                    self.detach_sinks.insert(p.context, p.detached);
                    let _ = p.reply.send(Ok((p.context, outcome)));
                }
                Err(e) => {
                    let _ = p.reply.send(Err(e));
                }
            },
            Some(_) => warn!(?token, "connect completion for mismatched request"),
            None => warn!(?token, "connect completion without pending request"),
        }
    }

    pub(crate) fn finish_disconnect(&mut self, token: Token) {
        match self.pending.remove(&token) {
            Some(Completion::Disconnect(tx)) => {
                let _ = tx.send(());
            }
            Some(_) => warn!(?token, "disconnect completion for mismatched request"),
            None => warn!(?token, "disconnect completion without pending request"),
        }
    }

    pub(crate) fn finish_qos_setup(&mut self, token: Token, result: Result<FlowId, QosError>) {
        match self.pending.remove(&token) {
            Some(Completion::QosSetup(tx)) => {
                let _ = tx.send(result);
            }
            Some(_) => warn!(?token, "qos setup completion for mismatched request"),
            None => warn!(?token, "qos setup completion without pending request"),
        }
    }

    pub(crate) fn finish_qos_unit(&mut self, token: Token, result: Result<(), QosError>) {
        match self.pending.remove(&token) {
            Some(Completion::QosUnit(tx)) => {
                let _ = tx.send(result);
            }
            Some(_) => warn!(?token, "qos completion for mismatched request"),
            None => warn!(?token, "qos completion without pending request"),
        }
    }

    pub(crate) fn finish_qos_status(
        &mut self,
        token: Token,
        result: Result<(QosFlowState, Vec<String>), QosError>,
    ) {
        match self.pending.remove(&token) {
            Some(Completion::QosStatus(tx)) => {
                let _ = tx.send(result);
            }
            Some(_) => warn!(?token, "qos status completion for mismatched request"),
            None => warn!(?token, "qos status completion without pending request"),
        }
    }

    /// Wake the context's detach sink after a forced teardown
    pub(crate) fn notify_detached(&mut self, context: ContextId) {
        if let Some(tx) = self.detach_sinks.remove(&context) {
            let _ = tx.send(());
        }
    }

    /// Forget a context's detach sink when it tears itself down
    pub(crate) fn drop_detach_sink(&mut self, context: ContextId) {
        self.detach_sinks.remove(&context);
    }
}
