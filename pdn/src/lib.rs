//! Async management of cellular packet-data sessions
//!
//! This crate drives the deterministic state machine from [`pdn_proto`] on a
//! tokio runtime. Each [`Session`] owns a driver task that feeds requests
//! and radio completions through the state machine, executes the commands it
//! produces against a [`RadioTransport`], and routes terminating
//! notifications back to callers as resolved futures.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use pdn::*;
//! # async fn example(transport: Arc<dyn RadioTransport>) -> Result<(), BringUpError> {
//! let (_indications_tx, indications_rx) = tokio::sync::mpsc::channel(16);
//! let session = Session::new(
//!     SessionId(0),
//!     SessionConfig::default(),
//!     transport,
//!     Box::new(ExponentialBackoff::default()),
//!     indications_rx,
//! );
//! let attachment = session
//!     .bring_up(ApnProfile {
//!         apn: "internet".into(),
//!         protocol: Protocol::Ipv4v6,
//!         username: None,
//!         password: None,
//!     })
//!     .await?;
//! println!("up on {}", attachment.outcome().link.interface);
//! attachment.tear_down("done").await.ok();
//! # Ok(())
//! # }
//! ```
//!
//! [`pdn_proto`]: proto

#![warn(missing_docs)]

mod registry;
mod router;
mod session;
mod transport;

pub use proto::{
    ApnProfile, ConnectFailure, ConnectOutcome, ContextId, FailCause, FlowId, HttpProxy, LinkInfo,
    LinkProperties, Protocol, QosDirection, QosError, QosFlowState, QosIndication, QosSetupReply,
    QosSpec, QosStatusReply, SessionConfig, SessionId, SessionSnapshot, SetupReply, StateKind,
    TrafficClass, TransportFault,
};

pub use crate::registry::SessionRegistry;
pub use crate::session::{
    Attachment, BringUpError, ExponentialBackoff, QosCallError, QosEvent, RetryPolicy, Session,
    SessionClosed,
};
pub use crate::transport::{RadioIndication, RadioTransport};
