use rustc_hash::FxHashMap;
use tracing::debug;

use crate::FlowId;

/// Direction of traffic a QoS flow covers
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QosDirection {
    /// Device to network
    Uplink,
    /// Network to device
    Downlink,
    /// Both directions
    Bidirectional,
}

/// Traffic treatment class requested for a flow
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrafficClass {
    /// Real-time conversational traffic
    Conversational,
    /// One-way streaming traffic
    Streaming,
    /// Request/response traffic
    Interactive,
    /// Best-effort bulk traffic
    Background,
}

/// Parameters for a requested QoS flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosSpec {
    /// Direction the flow covers
    pub direction: QosDirection,
    /// Traffic class
    pub class: TrafficClass,
    /// Peak bit rate in kbit/s
    pub peak_rate_kbps: u32,
    /// Guaranteed bit rate in kbit/s
    pub guaranteed_rate_kbps: u32,
    /// Transfer delay bound in milliseconds, if any
    pub latency_ms: Option<u32>,
}

/// Three-value flow status reported to upper layers
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QosFlowState {
    /// No such flow, or the flow is being released
    None,
    /// The flow is activated (possibly still pending network confirmation)
    Activated,
    /// The flow is suspended
    Suspended,
}

/// Unsolicited flow state change pushed by the transport
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QosIndication {
    /// The network confirmed activation
    Activated,
    /// Released at the device's request
    UserReleased,
    /// Released by the network
    NetworkReleased,
    /// Suspended by the network
    Suspended,
    /// Flow parameters were modified in place
    Modified,
}

/// Raw transport reply to a QoS setup request
///
/// The flow identifier arrives as uninterpreted text; a missing or
/// non-numeric identifier makes the reply malformed.
#[derive(Debug, Clone)]
pub struct QosSetupReply {
    /// Transport status code, zero on success
    pub status: i32,
    /// Raw flow identifier
    pub flow_id: Option<String>,
}

/// Raw transport reply to a QoS status query
#[derive(Debug, Clone, Default)]
pub struct QosStatusReply {
    /// Transport status code, zero on success
    pub status: i32,
    /// Raw flow state: 0 none, 1 activated, 2 suspended
    pub state: i32,
    /// Filter and flow descriptors, passed through verbatim
    pub descriptors: Vec<String>,
}

impl QosStatusReply {
    /// Map the raw state code onto the reporting vocabulary
    pub fn flow_state(&self) -> QosFlowState {
        match self.state {
            1 => QosFlowState::Activated,
            2 => QosFlowState::Suspended,
            _ => QosFlowState::None,
        }
    }
}

/// Where an individual flow is in its own lifecycle
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum FlowPhase {
    /// Setup acknowledged, awaiting network confirmation
    Enabling,
    /// Confirmed by the network
    Enabled,
    /// Suspend command outstanding
    Suspending,
    /// Suspended by the network
    Suspended,
    /// Resume command outstanding
    Resuming,
    /// Release command outstanding
    Releasing,
}

impl FlowPhase {
    fn report(self) -> QosFlowState {
        match self {
            Self::Enabling | Self::Enabled | Self::Resuming => QosFlowState::Activated,
            Self::Suspending | Self::Suspended => QosFlowState::Suspended,
            Self::Releasing => QosFlowState::None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct QosFlow {
    pub(crate) spec: QosSpec,
    pub(crate) phase: FlowPhase,
    /// Phase to restore if the outstanding command is rejected
    prior: FlowPhase,
}

/// Rejection reasons for a QoS setup attempt
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum QosSetupFailure {
    /// The transport rejected the setup with this status code
    Rejected(i32),
    /// The reply was missing fields or carried a non-numeric flow id
    Malformed,
}

/// Set of active QoS flows for one session
#[derive(Debug, Default)]
pub(crate) struct QosFlowRegistry {
    flows: FxHashMap<FlowId, QosFlow>,
}

impl QosFlowRegistry {
    pub(crate) fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Absorb a setup reply, adding the flow on success
    ///
    /// A malformed reply leaves the registry unchanged.
    pub(crate) fn setup_done(
        &mut self,
        spec: QosSpec,
        reply: &QosSetupReply,
    ) -> Result<FlowId, QosSetupFailure> {
        if reply.status != 0 {
            return Err(QosSetupFailure::Rejected(reply.status));
        }
        let id = reply
            .flow_id
            .as_deref()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .map(FlowId)
            .ok_or(QosSetupFailure::Malformed)?;
        self.flows.insert(
            id,
            QosFlow {
                spec,
                phase: FlowPhase::Enabling,
                prior: FlowPhase::Enabling,
            },
        );
        Ok(id)
    }

    pub(crate) fn status_of(&self, id: FlowId) -> QosFlowState {
        self.flows
            .get(&id)
            .map(|f| f.phase.report())
            .unwrap_or(QosFlowState::None)
    }

    /// Mark a flow as having a release command outstanding
    pub(crate) fn begin_release(&mut self, id: FlowId) -> bool {
        self.begin(id, FlowPhase::Releasing)
    }

    /// Drop a flow once its release has been confirmed
    pub(crate) fn release_done(&mut self, id: FlowId) {
        self.flows.remove(&id);
    }

    pub(crate) fn begin_suspend(&mut self, id: FlowId) -> bool {
        self.begin(id, FlowPhase::Suspending)
    }

    pub(crate) fn suspend_done(&mut self, id: FlowId) {
        self.set_phase(id, FlowPhase::Suspended);
    }

    pub(crate) fn begin_resume(&mut self, id: FlowId) -> bool {
        self.begin(id, FlowPhase::Resuming)
    }

    pub(crate) fn resume_done(&mut self, id: FlowId) {
        self.set_phase(id, FlowPhase::Enabled);
    }

    /// Restore the phase a flow held before its rejected command
    pub(crate) fn revert(&mut self, id: FlowId) {
        if let Some(flow) = self.flows.get_mut(&id) {
            flow.phase = flow.prior;
        }
    }

    /// Enter a transitional phase, remembering where to revert to
    fn begin(&mut self, id: FlowId, phase: FlowPhase) -> bool {
        match self.flows.get_mut(&id) {
            Some(flow) => {
                flow.prior = flow.phase;
                flow.phase = phase;
                true
            }
            None => false,
        }
    }

    fn set_phase(&mut self, id: FlowId, phase: FlowPhase) -> bool {
        match self.flows.get_mut(&id) {
            Some(flow) => {
                flow.phase = phase;
                true
            }
            None => false,
        }
    }

    /// Convert an unsolicited transport indication into a reportable state
    ///
    /// Returns `None` for flows this registry does not know, which can
    /// happen when an indication races a local release.
    pub(crate) fn indication(
        &mut self,
        id: FlowId,
        ind: QosIndication,
    ) -> Option<QosFlowState> {
        if !self.flows.contains_key(&id) {
            debug!(%id, ?ind, "indication for unknown flow");
            return None;
        }
        Some(match ind {
            QosIndication::Activated => {
                self.set_phase(id, FlowPhase::Enabled);
                QosFlowState::Activated
            }
            QosIndication::Suspended => {
                self.set_phase(id, FlowPhase::Suspended);
                QosFlowState::Suspended
            }
            QosIndication::UserReleased | QosIndication::NetworkReleased => {
                self.flows.remove(&id);
                QosFlowState::None
            }
            QosIndication::Modified => self.status_of(id),
        })
    }

    /// Remove every flow, returning the ids that still need a release command
    ///
    /// Used on session teardown; the releases are fire-and-forget.
    pub(crate) fn drain_for_teardown(&mut self) -> Vec<FlowId> {
        let ids: Vec<FlowId> = self
            .flows
            .iter()
            .filter(|(_, f)| f.phase != FlowPhase::Releasing)
            .map(|(id, _)| *id)
            .collect();
        self.flows.clear();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> QosSpec {
        QosSpec {
            direction: QosDirection::Bidirectional,
            class: TrafficClass::Interactive,
            peak_rate_kbps: 512,
            guaranteed_rate_kbps: 64,
            latency_ms: Some(100),
        }
    }

    #[test]
    fn setup_success_adds_flow() {
        let mut reg = QosFlowRegistry::default();
        let id = reg
            .setup_done(
                spec(),
                &QosSetupReply {
                    status: 0,
                    flow_id: Some("7".into()),
                },
            )
            .unwrap();
        assert_eq!(id, FlowId(7));
        assert_eq!(reg.status_of(id), QosFlowState::Activated);
    }

    #[test]
    fn malformed_setup_leaves_registry_unchanged() {
        let mut reg = QosFlowRegistry::default();
        for flow_id in [None, Some("".to_string()), Some("seven".to_string())] {
            let err = reg
                .setup_done(spec(), &QosSetupReply { status: 0, flow_id })
                .unwrap_err();
            assert_eq!(err, QosSetupFailure::Malformed);
        }
        assert!(reg.is_empty());
    }

    #[test]
    fn rejected_setup_reports_status() {
        let mut reg = QosFlowRegistry::default();
        let err = reg
            .setup_done(
                spec(),
                &QosSetupReply {
                    status: 3,
                    flow_id: Some("1".into()),
                },
            )
            .unwrap_err();
        assert_eq!(err, QosSetupFailure::Rejected(3));
    }

    #[test]
    fn suspend_resume_cycle() {
        let mut reg = QosFlowRegistry::default();
        let id = reg
            .setup_done(
                spec(),
                &QosSetupReply {
                    status: 0,
                    flow_id: Some("3".into()),
                },
            )
            .unwrap();
        assert!(reg.begin_suspend(id));
        reg.suspend_done(id);
        assert_eq!(reg.status_of(id), QosFlowState::Suspended);
        assert!(reg.begin_resume(id));
        reg.resume_done(id);
        assert_eq!(reg.status_of(id), QosFlowState::Activated);
    }

    #[test]
    fn rejected_command_restores_prior_phase() {
        let mut reg = QosFlowRegistry::default();
        let id = reg
            .setup_done(
                spec(),
                &QosSetupReply {
                    status: 0,
                    flow_id: Some("3".into()),
                },
            )
            .unwrap();
        // The network suspends the flow, then a local suspend is rejected
        reg.indication(id, QosIndication::Suspended);
        assert!(reg.begin_suspend(id));
        reg.revert(id);
        assert_eq!(reg.status_of(id), QosFlowState::Suspended);
        // A rejected resume leaves it suspended as well
        assert!(reg.begin_resume(id));
        reg.revert(id);
        assert_eq!(reg.status_of(id), QosFlowState::Suspended);
        // A rejected release keeps the flow alive
        assert!(reg.begin_release(id));
        reg.revert(id);
        assert_eq!(reg.status_of(id), QosFlowState::Suspended);
        assert!(!reg.is_empty());
    }

    #[test]
    fn network_release_indication_removes_flow() {
        let mut reg = QosFlowRegistry::default();
        let id = reg
            .setup_done(
                spec(),
                &QosSetupReply {
                    status: 0,
                    flow_id: Some("4".into()),
                },
            )
            .unwrap();
        assert_eq!(
            reg.indication(id, QosIndication::NetworkReleased),
            Some(QosFlowState::None)
        );
        assert!(reg.is_empty());
        assert_eq!(reg.indication(id, QosIndication::Activated), None);
    }

    #[test]
    fn teardown_drains_unreleased_flows() {
        let mut reg = QosFlowRegistry::default();
        for raw in ["1", "2"] {
            reg.setup_done(
                spec(),
                &QosSetupReply {
                    status: 0,
                    flow_id: Some(raw.into()),
                },
            )
            .unwrap();
        }
        reg.begin_release(FlowId(1));
        let mut pending = reg.drain_for_teardown();
        pending.sort();
        // flow 1 already has a release in flight, only flow 2 needs one
        assert_eq!(pending, vec![FlowId(2)]);
        assert!(reg.is_empty());
    }
}
