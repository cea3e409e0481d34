//! Session plumbing: envelopes and acks, backpressure, role switches,
//! `set`, and the disconnect sweep.

use std::sync::Arc;

use dslink::app::events::{LinkEvent, Side};
use dslink::app::ports::NodeInfo;
use dslink::error::ErrorKind;
use dslink::rpc::permission::Permission;
use dslink::rpc::requester::IgnoreResult;
use dslink::rpc::responder::ActionResult;
use dslink::rpc::transport::MessageBudget;
use dslink::{SessionOptions, Value};

use crate::mock_link::*;

fn msg(envelope: &Value) -> Option<u32> {
    envelope.get("msg").and_then(Value::as_u32)
}

fn ack(envelope: &Value) -> Option<u32> {
    envelope.get("ack").and_then(Value::as_u32)
}

// ── Envelopes ────────────────────────────────────────────────

#[test]
fn highest_msg_is_acked_once() {
    let a = Peer::new();
    a.session.process_incoming(&Value::map().with("msg", 5u32)).unwrap();
    a.session.process_incoming(&Value::map().with("msg", 3u32)).unwrap();
    assert_eq!(a.session.pending_ack(), Some(5));

    let sent = a.flush();
    assert_eq!(sent.len(), 1);
    assert_eq!(ack(&sent[0]), Some(5));
    assert_eq!(msg(&sent[0]), None, "ack-only envelopes are not numbered");
    assert!(a.flush().is_empty());
}

#[test]
fn envelopes_carry_increasing_ids_and_piggyback_acks() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree.add_node("/n", NodeInfo::node()).unwrap();

    a.requester().list("/n", Arc::new(ListLog::default()));
    let first = a.flush();
    assert_eq!(first.len(), 1);
    assert_eq!(msg(&first[0]), Some(1));
    assert_eq!(ack(&first[0]), None);
    b.session.process_incoming(&first[0]).unwrap();

    let reply = b.flush();
    assert_eq!(reply.len(), 1);
    assert_eq!(msg(&reply[0]), Some(1));
    assert_eq!(ack(&reply[0]), Some(1), "ack rides along with the responses");
    a.session.process_incoming(&reply[0]).unwrap();

    a.requester().list("/n", Arc::new(ListLog::default()));
    let second = a.flush();
    assert_eq!(msg(&second[0]), Some(2));
    assert_eq!(ack(&second[0]), Some(1));
}

#[test]
fn peers_go_quiet_after_exchanging_acks() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree.add_node("/n", NodeInfo::node()).unwrap();
    a.requester().list("/n", Arc::new(ListLog::default()));
    pump(&a, &b);
    assert!(a.flush().is_empty());
    assert!(b.flush().is_empty());
}

#[test]
fn malformed_input_is_contained() {
    let a = Peer::new();
    assert!(a.session.process_incoming(&Value::from("junk")).is_err());

    // A frame without a rid is skipped; the rest of the envelope still runs.
    a.session
        .process_incoming(
            &Value::map().with(
                "requests",
                vec![
                    Value::map().with("method", "list").with("path", "/"),
                    Value::map()
                        .with("rid", 4u32)
                        .with("method", "list")
                        .with("path", "/missing"),
                ],
            ),
        )
        .unwrap();
    let responses = a.flush_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(rid(&responses[0]), 4);
}

#[test]
fn unknown_method_is_invalid_method() {
    let b = Peer::new();
    b.receive_requests(vec![Value::map().with("rid", 2u32).with("method", "frobnicate")]);
    let responses = b.flush_responses();
    let kind = responses[0]
        .get("error")
        .and_then(|e| e.get("type"))
        .and_then(Value::as_str);
    assert_eq!(kind, Some("invalidMethod"));
}

// ── Backpressure ─────────────────────────────────────────────

#[test]
fn frame_budget_caps_each_message() {
    let a = Peer::with_budget(MessageBudget {
        max_bytes: 16 * 1024,
        max_frames: 1,
    });
    for path in ["/a", "/b", "/c"] {
        a.requester().list(path, Arc::new(ListLog::default()));
    }
    let sent = a.flush();
    assert_eq!(sent.len(), 3);
    for envelope in &sent {
        assert_eq!(frames(std::slice::from_ref(envelope), "requests").len(), 1);
    }
    let ids: Vec<Option<u32>> = sent.iter().map(msg).collect();
    assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
}

#[test]
fn one_envelope_at_a_time_resumes_where_it_stopped() {
    let a = Peer::with_budget(MessageBudget {
        max_bytes: 16 * 1024,
        max_frames: 2,
    });
    for path in ["/a", "/b", "/c"] {
        a.requester().list(path, Arc::new(ListLog::default()));
    }
    let first = a.next_envelope().unwrap();
    assert_eq!(frames(&[first], "requests").len(), 2);
    let second = a.next_envelope().unwrap();
    let rest = frames(&[second], "requests");
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].get("path").and_then(Value::as_str), Some("/c"));
    assert!(a.next_envelope().is_none());
}

#[test]
fn envelope_over_the_frame_cap_is_split() {
    let a = Peer::new();
    let padding = "p".repeat(300);
    for path in ["/a", "/b"] {
        a.requester().invoke(
            path,
            Value::map().with("pad", padding.as_str()),
            None,
            Arc::new(InvokeLog::default()),
        );
    }
    a.sink.set_frame_limit(500);
    let sent = a.flush();
    assert_eq!(sent.len(), 2);
    let ids: Vec<Option<u32>> = sent.iter().map(msg).collect();
    assert_eq!(ids, vec![Some(1), Some(2)]);
    assert_eq!(frames(&sent, "requests").len(), 2);
    assert_eq!(a.requester().open_requests(), 2);
}

#[test]
fn oversized_response_fails_only_its_request() {
    let a = Peer::new();
    let b = Peer::new();
    let huge = "x".repeat(4096);
    b.tree
        .add_action("/big", Permission::Read, Vec::new(), Vec::new(), move |_params, _stream| {
            Ok(ActionResult::Row(vec![Value::from(huge.as_str())]))
        })
        .unwrap();
    b.tree
        .add_action("/small", Permission::Read, Vec::new(), Vec::new(), |_params, _stream| {
            Ok(ActionResult::Row(vec![Value::from(1)]))
        })
        .unwrap();
    b.sink.set_frame_limit(1024);

    let big = Arc::new(InvokeLog::default());
    let small = Arc::new(InvokeLog::default());
    a.requester().invoke("/big", Value::map(), None, big.clone());
    a.requester().invoke("/small", Value::map(), None, small.clone());
    pump(&a, &b);

    let errors = big.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::ServerError);
    assert!(big.rows().is_empty());
    assert_eq!(big.closes(), 1);

    assert_eq!(small.rows(), vec![Value::from(vec![Value::from(1)])]);
    assert_eq!(b.session.responder().unwrap().open_requests(), 0);
    assert_eq!(a.requester().open_requests(), 0);

    // The link is still usable.
    let again = Arc::new(InvokeLog::default());
    a.requester().invoke("/small", Value::map(), None, again.clone());
    pump(&a, &b);
    assert_eq!(again.closes(), 1);
    assert!(again.errors.lock().unwrap().is_empty());
}

#[test]
fn oversized_request_fails_locally() {
    let a = Peer::new();
    a.sink.set_frame_limit(512);
    let log = Arc::new(InvokeLog::default());
    a.requester().invoke(
        "/anything",
        Value::map().with("pad", "y".repeat(2048).as_str()),
        None,
        log.clone(),
    );

    let sent = a.flush();
    assert!(frames(&sent, "requests").is_empty());
    assert_eq!(log.errors.lock().unwrap()[0].kind, ErrorKind::ServerError);
    assert_eq!(log.closes(), 1);
    assert_eq!(a.requester().open_requests(), 0);
}

// ── Roles ────────────────────────────────────────────────────

#[test]
fn disabled_responder_rejects_requests() {
    let b = Peer::with_options(
        SessionOptions {
            responder: false,
            ..SessionOptions::default()
        },
        MessageBudget::default(),
    );
    assert!(b.session.responder().is_none());

    b.receive_requests(vec![
        Value::map().with("rid", 1u32).with("method", "list").with("path", "/"),
        Value::map().with("rid", 1u32).with("method", "close"),
    ]);
    let responses = b.flush_responses();
    assert_eq!(responses.len(), 1);
    let kind = responses[0]
        .get("error")
        .and_then(|e| e.get("type"))
        .and_then(Value::as_str);
    assert_eq!(kind, Some("notImplemented"));
}

#[test]
fn peer_permission_limits_remote_calls() {
    let a = Peer::new();
    let b = Peer::with_options(
        SessionOptions {
            peer_permission: Permission::Read,
            ..SessionOptions::default()
        },
        MessageBudget::default(),
    );
    b.tree
        .add_action("/reboot", Permission::Config, Vec::new(), Vec::new(), |_params, _stream| {
            Ok(ActionResult::Empty)
        })
        .unwrap();

    let log = Arc::new(InvokeLog::default());
    a.requester().invoke("/reboot", Value::map(), None, log.clone());
    pump(&a, &b);
    assert_eq!(log.errors.lock().unwrap()[0].kind, ErrorKind::PermissionDenied);
}

// ── Set ──────────────────────────────────────────────────────

#[test]
fn set_updates_the_value_and_its_subscribers() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree
        .add_value("/setpoint", "number", 20, Some(Permission::Write))
        .unwrap();

    let values = Arc::new(ValueLog::default());
    let _sub = a.requester().subscribe("/setpoint", 1, values.clone());
    pump(&a, &b);

    let log = Arc::new(CallLog::default());
    a.requester()
        .set("/setpoint", Value::from(22), None, log.clone());
    pump(&a, &b);

    assert!(log.errors.lock().unwrap().is_empty());
    assert_eq!(log.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(b.tree.value("/setpoint").unwrap().value, Value::from(22));
    assert_eq!(values.values(), vec![Value::from(20), Value::from(22)]);
}

#[test]
fn set_is_checked_against_permissions() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree
        .add_value("/guarded", "number", 0, Some(Permission::Config))
        .unwrap();
    b.tree.add_value("/fixed", "number", 0, None).unwrap();

    let denied = Arc::new(CallLog::default());
    a.requester()
        .set("/guarded", Value::from(1), Some(Permission::Write), denied.clone());
    let read_only = Arc::new(CallLog::default());
    a.requester()
        .set("/fixed", Value::from(1), None, read_only.clone());
    let missing = Arc::new(CallLog::default());
    a.requester()
        .set("/absent", Value::from(1), None, missing.clone());
    pump(&a, &b);

    assert_eq!(denied.errors.lock().unwrap()[0].kind, ErrorKind::PermissionDenied);
    assert_eq!(read_only.errors.lock().unwrap()[0].kind, ErrorKind::NotImplemented);
    assert_eq!(missing.errors.lock().unwrap()[0].kind, ErrorKind::InvalidPath);
    assert_eq!(b.tree.value("/guarded").unwrap().value, Value::from(0));
    assert_eq!(b.tree.value("/fixed").unwrap().value, Value::from(0));
}

#[test]
fn fire_and_forget_set_still_applies() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree
        .add_value("/level", "number", 0, Some(Permission::Write))
        .unwrap();
    a.requester()
        .set("/level", Value::from(3), None, Arc::new(IgnoreResult));
    pump(&a, &b);
    assert_eq!(b.tree.value("/level").unwrap().value, Value::from(3));
    assert_eq!(a.requester().open_requests(), 0);
}

// ── Disconnect ───────────────────────────────────────────────

#[test]
fn disconnect_fails_everything_open_and_reports_counts() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree.add_node("/dir", NodeInfo::node()).unwrap();
    b.tree.add_value("/v", "number", 1, None).unwrap();
    b.tree
        .add_action("/feed", Permission::Read, Vec::new(), Vec::new(), |_params, _stream| {
            Ok(ActionResult::stream(Vec::new()))
        })
        .unwrap();

    let invoke = Arc::new(InvokeLog::default());
    a.requester().invoke("/feed", Value::map(), None, invoke.clone());
    let list = Arc::new(ListLog::default());
    a.requester().list("/dir", list.clone());
    let values = Arc::new(ValueLog::default());
    let _sub = a.requester().subscribe("/v", 0, values.clone());
    pump(&a, &b);

    a.session.on_disconnect();
    assert!(!a.session.is_connected());
    assert_eq!(invoke.errors.lock().unwrap()[0].kind, ErrorKind::Disconnected);
    assert_eq!(invoke.closes(), 1);
    assert_eq!(list.errors.lock().unwrap()[0].kind, ErrorKind::Disconnected);
    assert_eq!(list.closes(), 1);
    assert_eq!(values.closes(), 1);
    assert_eq!(a.requester().open_requests(), 0);
    assert_eq!(
        a.events().last(),
        Some(&LinkEvent::Disconnected {
            requests: 2,
            subscriptions: 1,
        })
    );

    // The responder side sweeps its own half.
    b.session.on_disconnect();
    assert_eq!(b.session.responder().unwrap().open_requests(), 0);
    assert!(b.session.responder().unwrap().subscriptions().is_empty());
    assert_eq!(
        b.events().last(),
        Some(&LinkEvent::Disconnected {
            requests: 2,
            subscriptions: 1,
        })
    );
}

#[test]
fn second_disconnect_is_silent() {
    let a = Peer::new();
    a.session.on_disconnect();
    let count = a.events().len();
    a.session.on_disconnect();
    assert_eq!(a.events().len(), count);
    a.session.on_connect();
    assert_eq!(a.events().last(), Some(&LinkEvent::Connected));
}

#[test]
fn request_lifecycle_is_reported_on_both_sides() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree.add_node("/n", NodeInfo::node()).unwrap();

    let stub = a.requester().list("/n", Arc::new(ListLog::default()));
    pump(&a, &b);
    stub.close();
    pump(&a, &b);

    let rid = stub.rid();
    assert!(a.events().contains(&LinkEvent::RequestOpened {
        side: Side::Requester,
        rid,
        method: "list",
    }));
    assert!(a.events().contains(&LinkEvent::RequestClosed {
        side: Side::Requester,
        rid,
    }));
    assert!(b.events().contains(&LinkEvent::RequestOpened {
        side: Side::Responder,
        rid,
        method: "list",
    }));
    assert!(b.events().contains(&LinkEvent::RequestClosed {
        side: Side::Responder,
        rid,
    }));
}
