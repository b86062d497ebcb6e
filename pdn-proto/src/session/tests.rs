use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Instant;

use super::*;
use crate::qos::{QosDirection, TrafficClass};

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn v4(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

fn v6(last: u16) -> IpAddr {
    IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, last))
}

fn profile() -> ApnProfile {
    ApnProfile {
        apn: "internet".into(),
        protocol: Protocol::Ipv4v6,
        username: None,
        password: None,
    }
}

fn link_info(with_v4: bool, with_v6: bool) -> LinkInfo {
    let mut addresses = Vec::new();
    if with_v4 {
        addresses.push(v4(2));
    }
    if with_v6 {
        addresses.push(v6(2));
    }
    LinkInfo {
        interface: "rmnet0".into(),
        addresses,
        gateways: vec![v4(1)],
        dns: vec![v4(53)],
        mtu: Some(1500),
    }
}

fn ok_reply(cid: i32, with_v4: bool, with_v6: bool) -> SetupReply {
    SetupReply {
        fault: None,
        status: 0,
        connection_id: cid,
        link: Some(link_info(with_v4, with_v6)),
        suggested_retry: None,
    }
}

fn sess() -> Session {
    trace_init();
    Session::new(SessionId(1), SessionConfig::default(), Instant::now())
}

fn connect(s: &mut Session, ctx: u64, tok: u64) {
    s.handle_request(
        Instant::now(),
        Request::Connect(ConnectParams {
            context: ContextId(ctx),
            token: Token(tok),
            profile: profile(),
        }),
    );
}

fn disconnect(s: &mut Session, ctx: u64, tok: u64) {
    s.handle_request(
        Instant::now(),
        Request::Disconnect(DisconnectParams {
            context: ContextId(ctx),
            token: Token(tok),
            reason: "test".into(),
        }),
    );
}

/// Drive a session to Active with one attached context
fn bring_up(s: &mut Session, cid: i32) {
    connect(s, 1, 1);
    let tag = match s.poll_command() {
        Some(Command::Activate { tag, .. }) => tag,
        other => panic!("expected activate, got {other:?}"),
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: ok_reply(cid, true, true),
        },
    );
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::ConnectDone { result: Ok(_), .. })
    ));
}

#[test]
fn connect_success_dual_stack() {
    let mut s = sess();
    assert!(s.is_inactive());
    assert_eq!(s.connection_id(), -1);

    connect(&mut s, 1, 1);
    assert_eq!(s.state_kind(), StateKind::Activating);
    let Some(Command::Activate { tag, protocol, .. }) = s.poll_command() else {
        panic!("expected activate command");
    };
    assert_eq!(protocol, Protocol::Ipv4v6);

    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: ok_reply(7, true, true),
        },
    );
    assert_eq!(s.state_kind(), StateKind::Active);
    assert_eq!(s.connection_id(), 7);
    assert_eq!(s.attached_context_count(), 1);
    match s.poll_event() {
        Some(SessionEvent::ConnectDone {
            token: Token(1),
            result: Ok(outcome),
        }) => {
            assert!(!outcome.partial);
            assert!(outcome.link.has_ipv4() && outcome.link.has_ipv6());
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn partial_success_then_retry_completes() {
    let mut s = sess();
    connect(&mut s, 1, 1);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    // Only IPv4 comes back from a dual-stack request
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: ok_reply(3, true, false),
        },
    );
    match s.poll_event() {
        Some(SessionEvent::ConnectDone {
            result: Ok(outcome),
            ..
        }) => assert!(outcome.partial),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(s.snapshot().partial_success);

    // A second bring-up triggers a partial retry on the missing family
    connect(&mut s, 2, 2);
    assert_eq!(s.state_kind(), StateKind::Active);
    let Some(Command::Activate { tag, protocol, .. }) = s.poll_command() else {
        panic!("expected partial-retry activate");
    };
    assert_eq!(protocol, Protocol::Ipv6);
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: ok_reply(3, true, true),
        },
    );
    match s.poll_event() {
        Some(SessionEvent::ConnectDone {
            token: Token(2),
            result: Ok(outcome),
        }) => assert!(!outcome.partial),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!s.snapshot().partial_success);
    assert_eq!(s.attached_context_count(), 2);
}

#[test]
fn attaches_queue_behind_inflight_partial_retry() {
    let mut s = sess();
    connect(&mut s, 1, 1);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: ok_reply(3, true, false),
        },
    );
    s.poll_event();

    connect(&mut s, 2, 2); // starts the partial retry
    connect(&mut s, 3, 3); // must wait for it
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected partial-retry activate");
    };
    assert!(s.poll_command().is_none(), "third attach must not issue a command");

    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: ok_reply(3, true, true),
        },
    );
    // Retry caller completes first, then the deferred attach
    match s.poll_event() {
        Some(SessionEvent::ConnectDone { token: Token(2), .. }) => {}
        other => panic!("unexpected event {other:?}"),
    }
    match s.poll_event() {
        Some(SessionEvent::ConnectDone { token: Token(3), result: Ok(_) }) => {}
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(s.attached_context_count(), 3);
}

#[test]
fn teardown_waits_for_inflight_partial_retry() {
    let mut s = sess();
    connect(&mut s, 1, 1);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: ok_reply(3, true, false),
        },
    );
    s.poll_event();

    connect(&mut s, 2, 2); // starts the partial retry
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected partial-retry activate");
    };

    // Detaching the first context must not cut the retry caller off
    disconnect(&mut s, 1, 3);
    assert!(s.poll_command().is_none(), "no teardown while the retry is in flight");
    assert!(s.poll_event().is_none());

    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: ok_reply(3, true, true),
        },
    );
    // Retry caller gets its reply, then the deferred detach runs
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::ConnectDone { token: Token(2), result: Ok(_) })
    ));
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::DisconnectDone { token: Token(3) })
    ));
    assert!(s.poll_command().is_none(), "second context keeps the session up");
    assert_eq!(s.state_kind(), StateKind::Active);
    assert_eq!(s.attached_context_count(), 1);
}

#[test]
fn disconnect_all_waits_for_inflight_partial_retry() {
    let mut s = sess();
    connect(&mut s, 1, 1);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: ok_reply(3, true, false),
        },
    );
    s.poll_event();

    connect(&mut s, 2, 2);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected partial-retry activate");
    };
    s.handle_request(
        Instant::now(),
        Request::DisconnectAll {
            token: Token(9),
            reason: "forced".into(),
        },
    );
    assert!(s.poll_command().is_none(), "no teardown while the retry is in flight");

    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: ok_reply(3, true, true),
        },
    );
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::ConnectDone { token: Token(2), result: Ok(_) })
    ));
    // The replayed teardown now detaches both contexts and deactivates
    let mut detached = Vec::new();
    while let Some(event) = s.poll_event() {
        if let SessionEvent::Detached { context } = event {
            detached.push(context);
        }
    }
    detached.sort();
    assert_eq!(detached, vec![ContextId(1), ContextId(2)]);
    let Some(Command::Deactivate { tag, .. }) = s.poll_command() else {
        panic!("expected deactivate");
    };
    s.handle_transport(Instant::now(), TransportEvent::DeactivateDone { tag });
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::DisconnectDone { token: Token(9) })
    ));
    assert!(s.is_inactive());
}

#[test]
fn permanent_rejection_classified() {
    let mut s = sess();
    connect(&mut s, 1, 1);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: SetupReply {
                status: 0x1B,
                ..SetupReply::default()
            },
        },
    );
    assert!(s.is_inactive());
    assert_eq!(s.connection_id(), -1);
    match s.poll_event() {
        Some(SessionEvent::ConnectDone {
            result: Err(failure),
            ..
        }) => {
            assert_eq!(failure.cause, FailCause::MissingUnknownApn);
            assert!(failure.is_permanent());
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(s.last_failure().map(|(_, c)| c), Some(FailCause::MissingUnknownApn));
}

#[test]
fn radio_not_available_terminates_attempt() {
    let mut s = sess();
    connect(&mut s, 1, 1);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: SetupReply {
                fault: Some(TransportFault::RadioNotAvailable),
                ..SetupReply::default()
            },
        },
    );
    assert!(s.is_inactive());
    match s.poll_event() {
        Some(SessionEvent::ConnectDone {
            result: Err(failure),
            ..
        }) => assert_eq!(failure.cause, FailCause::RadioNotAvailable),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn retry_hint_surfaced_on_transient_rejection() {
    let mut s = sess();
    connect(&mut s, 1, 1);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: SetupReply {
                status: 0x1A,
                suggested_retry: Some(Duration::from_secs(5)),
                ..SetupReply::default()
            },
        },
    );
    match s.poll_event() {
        Some(SessionEvent::ConnectDone {
            result: Err(failure),
            ..
        }) => {
            assert_eq!(failure.cause, FailCause::InsufficientResources);
            assert!(!failure.is_permanent());
            assert_eq!(failure.retry_hint, Some(Duration::from_secs(5)));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn legacy_transport_queries_failure_cause() {
    let mut s = sess();
    s.handle_transport(Instant::now(), TransportEvent::RadioConnected { version: 3 });
    connect(&mut s, 1, 1);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: SetupReply {
                fault: Some(TransportFault::Other),
                connection_id: 2,
                ..SetupReply::default()
            },
        },
    );
    // Still activating; the machine went to ask what happened
    assert_eq!(s.state_kind(), StateKind::Activating);
    match s.poll_command() {
        Some(Command::GetLastFailureCause { connection_id: 2, .. }) => {}
        other => panic!("expected failure-cause query, got {other:?}"),
    }
    s.handle_transport(
        Instant::now(),
        TransportEvent::LastFailureCause { tag, code: 0x08 },
    );
    assert!(s.is_inactive());
    match s.poll_event() {
        Some(SessionEvent::ConnectDone {
            result: Err(failure),
            ..
        }) => assert_eq!(failure.cause, FailCause::OperatorBarred),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn legacy_failure_cause_records_pending_protocol() {
    let mut s = sess();
    s.handle_transport(Instant::now(), TransportEvent::RadioConnected { version: 3 });
    connect(&mut s, 1, 1);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: SetupReply {
                status: 1,
                connection_id: 2,
                ..SetupReply::default()
            },
        },
    );
    match s.poll_command() {
        Some(Command::GetLastFailureCause { .. }) => {}
        other => panic!("expected failure-cause query, got {other:?}"),
    }
    s.handle_transport(
        Instant::now(),
        TransportEvent::LastFailureCause { tag, code: 0x33 },
    );
    match s.poll_event() {
        Some(SessionEvent::ConnectDone {
            result: Err(failure),
            ..
        }) => assert_eq!(failure.cause, FailCause::OnlyIpv6Allowed),
        other => panic!("unexpected event {other:?}"),
    }
    // The queried cause narrows the next attempt just like a direct one
    connect(&mut s, 1, 2);
    match s.poll_command() {
        Some(Command::Activate { protocol, .. }) => assert_eq!(protocol, Protocol::Ipv6),
        other => panic!("expected activate, got {other:?}"),
    }
}

#[test]
fn unusable_parameters_force_cleanup() {
    let mut s = sess();
    connect(&mut s, 1, 1);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    // Nominal success, but no addresses at all
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: SetupReply {
                status: 0,
                connection_id: 9,
                link: Some(LinkInfo::default()),
                ..SetupReply::default()
            },
        },
    );
    assert_eq!(
        s.state_kind(),
        StateKind::DisconnectingErrorCreatingConnection
    );
    match s.poll_command() {
        Some(Command::Deactivate { connection_id: 9, .. }) => {}
        other => panic!("expected deactivate, got {other:?}"),
    }
    s.handle_transport(Instant::now(), TransportEvent::DeactivateDone { tag });
    assert!(s.is_inactive());
    match s.poll_event() {
        Some(SessionEvent::ConnectDone {
            result: Err(failure),
            ..
        }) => assert_eq!(failure.cause, FailCause::UnacceptableNetworkParameter),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn only_ipv6_rejection_records_pending_protocol() {
    let mut s = sess();
    connect(&mut s, 1, 1);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: SetupReply {
                status: 0x33,
                ..SetupReply::default()
            },
        },
    );
    s.poll_event();
    // The next attempt targets the allowed family
    connect(&mut s, 1, 2);
    match s.poll_command() {
        Some(Command::Activate { protocol, .. }) => assert_eq!(protocol, Protocol::Ipv6),
        other => panic!("expected activate, got {other:?}"),
    }
}

#[test]
fn dual_stack_requested_again_after_single_family_cycle() {
    let mut s = sess();
    connect(&mut s, 1, 1);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: SetupReply {
                status: 0x33,
                ..SetupReply::default()
            },
        },
    );
    s.poll_event();

    // Retry on the allowed family succeeds; that is as much as this
    // attempt can get, so it does not count as partial
    connect(&mut s, 1, 2);
    let Some(Command::Activate { tag, protocol, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    assert_eq!(protocol, Protocol::Ipv6);
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: ok_reply(5, false, true),
        },
    );
    match s.poll_event() {
        Some(SessionEvent::ConnectDone {
            result: Ok(outcome),
            ..
        }) => assert!(!outcome.partial),
        other => panic!("unexpected event {other:?}"),
    }

    // After a full teardown the restriction is forgotten and the next
    // cycle asks for dual stack again
    disconnect(&mut s, 1, 3);
    let Some(Command::Deactivate { tag, .. }) = s.poll_command() else {
        panic!("expected deactivate");
    };
    s.handle_transport(Instant::now(), TransportEvent::DeactivateDone { tag });
    s.poll_event();
    connect(&mut s, 1, 4);
    match s.poll_command() {
        Some(Command::Activate { protocol, .. }) => assert_eq!(protocol, Protocol::Ipv4v6),
        other => panic!("expected activate, got {other:?}"),
    }
}

#[test]
fn refcounted_sharing_and_teardown() {
    let mut s = sess();
    bring_up(&mut s, 4);

    // Second context shares the session without a transport command
    connect(&mut s, 2, 2);
    assert!(s.poll_command().is_none());
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::ConnectDone { token: Token(2), result: Ok(_) })
    ));
    assert_eq!(s.attached_context_count(), 2);

    // First detach keeps the session up
    disconnect(&mut s, 1, 3);
    assert!(s.poll_command().is_none());
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::DisconnectDone { token: Token(3) })
    ));
    assert_eq!(s.attached_context_count(), 1);

    // Last detach deactivates
    disconnect(&mut s, 2, 4);
    assert_eq!(s.state_kind(), StateKind::Disconnecting);
    let Some(Command::Deactivate { tag, connection_id: 4, .. }) = s.poll_command() else {
        panic!("expected deactivate");
    };
    s.handle_transport(Instant::now(), TransportEvent::DeactivateDone { tag });
    assert!(s.is_inactive());
    assert_eq!(s.connection_id(), -1);
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::DisconnectDone { token: Token(4) })
    ));
}

#[test]
fn disconnect_all_notifies_every_context() {
    let mut s = sess();
    bring_up(&mut s, 4);
    connect(&mut s, 2, 2);
    s.poll_event();

    s.handle_request(
        Instant::now(),
        Request::DisconnectAll {
            token: Token(9),
            reason: "forced".into(),
        },
    );
    let mut detached = Vec::new();
    while let Some(event) = s.poll_event() {
        if let SessionEvent::Detached { context } = event {
            detached.push(context);
        }
    }
    detached.sort();
    assert_eq!(detached, vec![ContextId(1), ContextId(2)]);

    let Some(Command::Deactivate { tag, .. }) = s.poll_command() else {
        panic!("expected deactivate");
    };
    s.handle_transport(Instant::now(), TransportEvent::DeactivateDone { tag });
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::DisconnectDone { token: Token(9) })
    ));
}

#[test]
fn disconnect_all_idempotent_while_inactive() {
    let mut s = sess();
    for tok in [1, 2, 3] {
        s.handle_request(
            Instant::now(),
            Request::DisconnectAll {
                token: Token(tok),
                reason: "noop".into(),
            },
        );
        assert!(matches!(
            s.poll_event(),
            Some(SessionEvent::DisconnectDone { token }) if token == Token(tok)
        ));
        assert!(s.poll_command().is_none());
        assert!(s.is_inactive());
    }
}

#[test]
fn radio_off_teardown_is_immediate() {
    let mut s = sess();
    bring_up(&mut s, 4);
    s.handle_transport(Instant::now(), TransportEvent::RadioOff);
    disconnect(&mut s, 1, 2);
    assert!(s.is_inactive());
    assert!(s.poll_command().is_none(), "no command when the radio is gone");
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::DisconnectDone { token: Token(2) })
    ));
}

#[test]
fn generation_tag_advances_and_stale_replies_are_ignored() {
    let mut s = sess();
    let first_gen = s.generation();
    bring_up(&mut s, 4);
    disconnect(&mut s, 1, 2);
    let Some(Command::Deactivate { tag: old_tag, .. }) = s.poll_command() else {
        panic!("expected deactivate");
    };
    s.handle_transport(Instant::now(), TransportEvent::DeactivateDone { tag: old_tag });
    s.poll_event();
    assert!(s.generation() > first_gen);

    // New activation cycle
    connect(&mut s, 1, 3);
    let Some(Command::Activate { tag: new_tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    assert_ne!(old_tag, new_tag);

    // A reply from the dead cycle must be a no-op
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag: old_tag,
            reply: ok_reply(8, true, true),
        },
    );
    assert_eq!(s.state_kind(), StateKind::Activating);
    assert!(s.poll_event().is_none());

    // The live cycle still completes
    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag: new_tag,
            reply: ok_reply(8, true, true),
        },
    );
    assert_eq!(s.state_kind(), StateKind::Active);
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::ConnectDone { token: Token(3), result: Ok(_) })
    ));
}

#[test]
fn connect_deferred_while_activating() {
    let mut s = sess();
    connect(&mut s, 1, 1);
    let Some(Command::Activate { tag, .. }) = s.poll_command() else {
        panic!("expected activate");
    };
    connect(&mut s, 2, 2);
    assert!(s.poll_command().is_none());
    assert!(s.poll_event().is_none());

    s.handle_transport(
        Instant::now(),
        TransportEvent::SetupDone {
            tag,
            reply: ok_reply(5, true, true),
        },
    );
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::ConnectDone { token: Token(1), result: Ok(_) })
    ));
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::ConnectDone { token: Token(2), result: Ok(_) })
    ));
    assert_eq!(s.attached_context_count(), 2);
}

fn qos_spec() -> QosSpec {
    QosSpec {
        direction: QosDirection::Bidirectional,
        class: TrafficClass::Conversational,
        peak_rate_kbps: 256,
        guaranteed_rate_kbps: 64,
        latency_ms: Some(80),
    }
}

#[test]
fn qos_flow_lifecycle() {
    let mut s = sess();
    bring_up(&mut s, 4);

    s.handle_request(
        Instant::now(),
        Request::QosSetup {
            token: Token(10),
            spec: qos_spec(),
        },
    );
    assert!(s.is_qos_active());
    let Some(Command::QosSetup { tag, connection_id: 4, .. }) = s.poll_command() else {
        panic!("expected qos setup");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::QosSetupDone {
            tag,
            reply: QosSetupReply {
                status: 0,
                flow_id: Some("5".into()),
            },
        },
    );
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::QosSetupDone { token: Token(10), result: Ok(FlowId(5)) })
    ));

    // Unsolicited suspend from the network
    s.handle_transport(
        Instant::now(),
        TransportEvent::QosStateChanged {
            flow: FlowId(5),
            indication: QosIndication::Suspended,
        },
    );
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::QosStateChanged { flow: FlowId(5), state: QosFlowState::Suspended })
    ));

    // Release returns the machine to plain Active
    s.handle_request(
        Instant::now(),
        Request::QosRelease {
            token: Token(11),
            flow: FlowId(5),
        },
    );
    let Some(Command::QosRelease { tag, flow: FlowId(5) }) = s.poll_command() else {
        panic!("expected qos release");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::QosReleaseDone {
            tag,
            flow: FlowId(5),
            status: 0,
        },
    );
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::QosReleaseDone { token: Token(11), result: Ok(()) })
    ));
    assert_eq!(s.state_kind(), StateKind::Active);
}

#[test]
fn concurrent_qos_setups_run_one_at_a_time() {
    let mut s = sess();
    bring_up(&mut s, 4);
    for tok in [10, 11] {
        s.handle_request(
            Instant::now(),
            Request::QosSetup {
                token: Token(tok),
                spec: qos_spec(),
            },
        );
    }
    let Some(Command::QosSetup { tag, .. }) = s.poll_command() else {
        panic!("expected qos setup");
    };
    assert!(s.poll_command().is_none(), "second setup must wait its turn");

    s.handle_transport(
        Instant::now(),
        TransportEvent::QosSetupDone {
            tag,
            reply: QosSetupReply {
                status: 0,
                flow_id: Some("5".into()),
            },
        },
    );
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::QosSetupDone { token: Token(10), result: Ok(FlowId(5)) })
    ));
    // Only now does the queued setup go out
    let Some(Command::QosSetup { tag, .. }) = s.poll_command() else {
        panic!("expected the queued qos setup");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::QosSetupDone {
            tag,
            reply: QosSetupReply {
                status: 0,
                flow_id: Some("8".into()),
            },
        },
    );
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::QosSetupDone { token: Token(11), result: Ok(FlowId(8)) })
    ));
}

#[test]
fn malformed_qos_setup_returns_to_active() {
    let mut s = sess();
    bring_up(&mut s, 4);
    s.handle_request(
        Instant::now(),
        Request::QosSetup {
            token: Token(10),
            spec: qos_spec(),
        },
    );
    let Some(Command::QosSetup { tag, .. }) = s.poll_command() else {
        panic!("expected qos setup");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::QosSetupDone {
            tag,
            reply: QosSetupReply {
                status: 0,
                flow_id: Some("not-a-number".into()),
            },
        },
    );
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::QosSetupDone { token: Token(10), result: Err(QosError::Malformed) })
    ));
    assert_eq!(s.state_kind(), StateKind::Active);
}

#[test]
fn qos_rejected_while_inactive() {
    let mut s = sess();
    s.handle_request(
        Instant::now(),
        Request::QosSetup {
            token: Token(10),
            spec: qos_spec(),
        },
    );
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::QosSetupDone { token: Token(10), result: Err(QosError::NotActive) })
    ));
    assert!(s.poll_command().is_none());
}

#[test]
fn teardown_releases_qos_flows_without_waiting() {
    let mut s = sess();
    bring_up(&mut s, 4);
    s.handle_request(
        Instant::now(),
        Request::QosSetup {
            token: Token(10),
            spec: qos_spec(),
        },
    );
    let Some(Command::QosSetup { tag, .. }) = s.poll_command() else {
        panic!("expected qos setup");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::QosSetupDone {
            tag,
            reply: QosSetupReply {
                status: 0,
                flow_id: Some("6".into()),
            },
        },
    );
    s.poll_event();
    assert!(s.is_qos_active());

    disconnect(&mut s, 1, 20);
    // Flow release first, fire-and-forget, then the deactivation
    match s.poll_command() {
        Some(Command::QosRelease { flow: FlowId(6), .. }) => {}
        other => panic!("expected qos release, got {other:?}"),
    }
    let Some(Command::Deactivate { tag, .. }) = s.poll_command() else {
        panic!("expected deactivate");
    };
    assert_eq!(s.state_kind(), StateKind::Disconnecting);
    s.handle_transport(Instant::now(), TransportEvent::DeactivateDone { tag });
    assert!(s.is_inactive());
    assert!(matches!(
        s.poll_event(),
        Some(SessionEvent::DisconnectDone { token: Token(20) })
    ));
}

#[test]
fn qos_get_status_maps_transport_reply() {
    let mut s = sess();
    bring_up(&mut s, 4);
    s.handle_request(
        Instant::now(),
        Request::QosGetStatus {
            token: Token(12),
            flow: FlowId(9),
        },
    );
    assert!(s.is_qos_active());
    let Some(Command::QosGetStatus { tag, flow: FlowId(9) }) = s.poll_command() else {
        panic!("expected qos status query");
    };
    s.handle_transport(
        Instant::now(),
        TransportEvent::QosStatusDone {
            tag,
            flow: FlowId(9),
            reply: QosStatusReply {
                status: 0,
                state: 2,
                descriptors: vec!["filter:src=any".into()],
            },
        },
    );
    match s.poll_event() {
        Some(SessionEvent::QosStatusDone {
            token: Token(12),
            result: Ok((state, descriptors)),
        }) => {
            assert_eq!(state, QosFlowState::Suspended);
            assert_eq!(descriptors, vec!["filter:src=any".to_string()]);
        }
        other => panic!("unexpected event {other:?}"),
    }
    // Registry is empty, so the machine drops back to Active
    assert_eq!(s.state_kind(), StateKind::Active);
}
