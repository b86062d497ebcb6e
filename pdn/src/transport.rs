use async_trait::async_trait;

use proto::{
    ApnProfile, FlowId, Protocol, QosIndication, QosSetupReply, QosSpec, QosStatusReply,
    SetupReply,
};

/// Abstracts the radio command layer a session drives
///
/// Implementations execute one command at a time per kind for a given
/// session; the state machine never issues overlapping commands of the same
/// kind. Commands do not fail at the Rust level: radio faults and network
/// rejections travel inside the reply structures, and a transport that can
/// never answer should report a radio-not-available fault.
#[async_trait]
pub trait RadioTransport: Send + Sync + 'static {
    /// Activate a session for `profile`, requesting the given families
    async fn activate(&self, profile: &ApnProfile, protocol: Protocol) -> SetupReply;

    /// Deactivate the connection, passing the caller's reason through
    async fn deactivate(&self, connection_id: i32, reason: &str);

    /// Ask what made the last activation fail, for transports too old to
    /// report structured errors inline
    async fn get_last_failure_cause(&self, connection_id: i32) -> i32;

    /// Negotiate a QoS flow on an active connection
    async fn qos_setup(&self, connection_id: i32, spec: &QosSpec) -> QosSetupReply;

    /// Release a QoS flow; returns the transport status code
    async fn qos_release(&self, flow: FlowId) -> i32;

    /// Suspend a QoS flow; returns the transport status code
    async fn qos_suspend(&self, flow: FlowId) -> i32;

    /// Resume a QoS flow; returns the transport status code
    async fn qos_resume(&self, flow: FlowId) -> i32;

    /// Query a QoS flow's current state
    async fn qos_get_status(&self, flow: FlowId) -> QosStatusReply;
}

/// Unsolicited notifications pushed by the radio
#[derive(Debug, Clone)]
pub enum RadioIndication {
    /// A QoS flow changed state without a local request
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
