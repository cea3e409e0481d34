//! Subscriptions end to end: the requester's shared groups on one side,
//! the responder's value feed on the other.

use std::sync::Arc;

use dslink::rpc::frame::ValueUpdate;
use dslink::rpc::requester::{GroupState, SubscriptionHandler};
use dslink::Value;

use crate::mock_link::*;

const TS: &str = "2026-01-01T00:00:00.000Z";

fn row(sid: u32, value: i64) -> Value {
    Value::list().push(sid).push(value).push(TS)
}

fn updates(rows: Vec<Value>) -> Value {
    Value::map().with("rid", 0u32).with("updates", rows)
}

fn subscribe_request(rid: u32, entries: Vec<(&str, u32, u8)>) -> Value {
    let paths: Vec<Value> = entries
        .into_iter()
        .map(|(path, sid, qos)| {
            Value::map()
                .with("path", path)
                .with("sid", sid)
                .with("qos", qos)
        })
        .collect();
    Value::map()
        .with("rid", rid)
        .with("method", "subscribe")
        .with("paths", paths)
}

/// `rid 0` rows for `sid`, in the order they were sent.
fn rows_for(responses: &[Value], sid: u32) -> Vec<Value> {
    responses
        .iter()
        .filter(|f| rid(f) == 0)
        .filter_map(|f| f.get("updates").and_then(Value::as_list))
        .flat_map(|rows| rows.iter())
        .filter(|r| {
            let s = match r.as_list() {
                Some(items) => items.first().and_then(Value::as_u32),
                None => r.get("sid").and_then(Value::as_u32),
            };
            s == Some(sid)
        })
        .cloned()
        .collect()
}

fn value_of(row: &Value) -> Value {
    match row.as_list() {
        Some(items) => items.get(1).cloned().unwrap_or_default(),
        None => row.get("value").cloned().unwrap_or_default(),
    }
}

// ── Requester side ───────────────────────────────────────────

#[test]
fn two_members_share_one_wire_subscription() {
    let a = Peer::new();
    let m1 = Arc::new(ValueLog::default());
    let m2 = Arc::new(ValueLog::default());

    let s1 = a.requester().subscribe("/a", 0, m1.clone());
    let s2 = a.requester().subscribe("/a", 0, m2.clone());
    assert_eq!(s1.sid(), 1);
    assert_eq!(s2.sid(), 1);

    let sent = a.flush_requests();
    assert_eq!(sent.len(), 1, "one subscribe frame for both members");
    assert_eq!(method(&sent[0]), Some("subscribe"));
    let expected = Value::from(vec![Value::map()
        .with("path", "/a")
        .with("sid", 1u32)
        .with("qos", 0u8)]);
    assert_eq!(sent[0].get("paths"), Some(&expected));

    a.receive_responses(vec![updates(vec![row(1, 10)])]);
    assert_eq!(m1.values(), vec![Value::from(10)]);
    assert_eq!(m2.values(), vec![Value::from(10)]);

    s1.unsubscribe();
    assert!(a.flush_requests().is_empty(), "m2 still needs the value");
    assert_eq!(m1.closes(), 1);

    s2.unsubscribe();
    let sent = a.flush_requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(method(&sent[0]), Some("unsubscribe"));
    assert_eq!(sent[0].get("sids"), Some(&Value::from(vec![Value::from(1u32)])));
    assert!(a.requester().subscriptions().snapshot("/a").is_none());
}

#[test]
fn highest_member_qos_goes_on_the_wire() {
    let a = Peer::new();
    let _low = a
        .requester()
        .subscribe("/q", 0, Arc::new(ValueLog::default()));
    let _high = a
        .requester()
        .subscribe("/q", 2, Arc::new(ValueLog::default()));
    let _mid = a
        .requester()
        .subscribe("/q", 1, Arc::new(ValueLog::default()));

    let sent = a.flush_requests();
    assert_eq!(sent.len(), 1);
    let paths = sent[0].get("paths").and_then(Value::as_list).unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].get("qos").and_then(Value::as_u32), Some(2));
}

#[test]
fn late_joiner_replays_cached_value_without_network() {
    let a = Peer::new();
    let first = Arc::new(ValueLog::default());
    let _s1 = a.requester().subscribe("/t", 0, first.clone());
    a.flush();
    a.receive_responses(vec![updates(vec![row(1, 42)])]);

    let late = Arc::new(ValueLog::default());
    let _s2 = a.requester().subscribe("/t", 0, late.clone());
    assert_eq!(late.values(), vec![Value::from(42)]);
    assert!(a.flush_requests().is_empty(), "no new subscribe for a joiner");
}

#[test]
fn unknown_sid_is_ignored() {
    let a = Peer::new();
    let log = Arc::new(ValueLog::default());
    let _s = a.requester().subscribe("/x", 0, log.clone());
    a.flush();

    a.receive_responses(vec![updates(vec![row(99, 1), row(1, 2)])]);
    assert_eq!(log.values(), vec![Value::from(2)]);
    assert!(a.flush_requests().is_empty());
}

#[test]
fn status_rows_reach_members() {
    let a = Peer::new();
    let log = Arc::new(ValueLog::default());
    let _s = a.requester().subscribe("/gone", 0, log.clone());
    a.flush();

    let status_row = Value::map()
        .with("sid", 1u32)
        .with("value", Value::Null)
        .with("ts", TS)
        .with("status", "unknown");
    a.receive_responses(vec![updates(vec![status_row])]);
    let got = log.updates.lock().unwrap().clone();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].status.as_deref(), Some("unknown"));
    assert!(got[0].value.is_null());
}

struct Panics;

impl SubscriptionHandler for Panics {
    fn on_update(&self, _update: &ValueUpdate) {
        panic!("consumer bug");
    }
}

#[test]
fn panicking_member_does_not_starve_the_others() {
    let a = Peer::new();
    let _bad = a.requester().subscribe("/p", 0, Arc::new(Panics));
    let good = Arc::new(ValueLog::default());
    let _ok = a.requester().subscribe("/p", 0, good.clone());
    a.flush();

    a.receive_responses(vec![updates(vec![row(1, 7)])]);
    a.receive_responses(vec![updates(vec![row(1, 8)])]);
    assert_eq!(good.values(), vec![Value::from(7), Value::from(8)]);
}

#[test]
fn resubscribe_while_unsubscribe_pending_keeps_sid() {
    let a = Peer::new();
    let s1 = a
        .requester()
        .subscribe("/r", 0, Arc::new(ValueLog::default()));
    a.flush();
    s1.unsubscribe();
    let snap = a.requester().subscriptions().snapshot("/r").unwrap();
    assert_eq!(snap.state, GroupState::PendingUnsubscribe);

    let log = Arc::new(ValueLog::default());
    let s2 = a.requester().subscribe("/r", 0, log.clone());
    assert_eq!(s2.sid(), s1.sid());
    let sent = a.flush_requests();
    assert!(sent.iter().all(|f| method(f) != Some("unsubscribe")));

    a.receive_responses(vec![updates(vec![row(s2.sid(), 3)])]);
    assert_eq!(log.values(), vec![Value::from(3)]);
}

#[test]
fn disconnect_closes_every_member() {
    let a = Peer::new();
    let m1 = Arc::new(ValueLog::default());
    let m2 = Arc::new(ValueLog::default());
    let s1 = a.requester().subscribe("/d", 0, m1.clone());
    let _s2 = a.requester().subscribe("/e", 0, m2.clone());

    a.session.on_disconnect();
    assert_eq!(m1.closes(), 1);
    assert_eq!(m2.closes(), 1);
    assert!(s1.is_closed());
    assert!(a.requester().subscriptions().is_empty());

    // Unsubscribing after the sweep is harmless and closes nothing twice.
    s1.unsubscribe();
    assert_eq!(m1.closes(), 1);
    assert!(a.flush().is_empty());
}

// ── Responder side ───────────────────────────────────────────

#[test]
fn remote_subscriber_sees_current_then_changed_values() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree.add_value("/v", "number", 1, None).unwrap();

    let log = Arc::new(ValueLog::default());
    let _s = a.requester().subscribe("/v", 0, log.clone());
    pump(&a, &b);
    assert_eq!(log.values(), vec![Value::from(1)]);
    assert_eq!(b.session.responder().unwrap().subscriptions().len(), 1);

    b.tree.update("/v", 5).unwrap();
    pump(&a, &b);
    assert_eq!(log.values(), vec![Value::from(1), Value::from(5)]);
    assert_eq!(a.requester().open_requests(), 0, "subscribe ack was closed");
}

#[test]
fn qos0_keeps_latest_qos1_keeps_all() {
    let b = Peer::new();
    b.tree.add_value("/v", "number", 0, None).unwrap();
    b.tree.add_value("/w", "number", 0, None).unwrap();

    b.receive_requests(vec![subscribe_request(1, vec![("/v", 7, 0), ("/w", 8, 1)])]);
    b.flush();

    for n in 1..=3 {
        b.tree.update("/v", n).unwrap();
        b.tree.update("/w", n).unwrap();
    }
    let responses = b.flush_responses();

    let v: Vec<Value> = rows_for(&responses, 7).iter().map(value_of).collect();
    let w: Vec<Value> = rows_for(&responses, 8).iter().map(value_of).collect();
    assert_eq!(v, vec![Value::from(3)]);
    assert_eq!(w, vec![Value::from(1), Value::from(2), Value::from(3)]);
}

#[test]
fn unsubscribed_sid_stops_receiving() {
    let b = Peer::new();
    b.tree.add_value("/v", "number", 0, None).unwrap();
    b.receive_requests(vec![subscribe_request(1, vec![("/v", 4, 0)])]);
    b.flush();

    b.receive_requests(vec![Value::map()
        .with("rid", 2u32)
        .with("method", "unsubscribe")
        .with("sids", vec![Value::from(4u32)])]);
    b.tree.update("/v", 9).unwrap();

    let responses = b.flush_responses();
    assert!(rows_for(&responses, 4).is_empty());
    assert!(responses.iter().any(|f| rid(f) == 2 && stream(f) == Some("closed")));
    assert!(b.session.responder().unwrap().subscriptions().is_empty());
}

#[test]
fn unresolvable_path_reports_unknown_status() {
    let b = Peer::new();
    b.receive_requests(vec![subscribe_request(1, vec![("/nope", 3, 0)])]);
    let responses = b.flush_responses();
    let rows = rows_for(&responses, 3);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status").and_then(Value::as_str), Some("unknown"));
    assert!(value_of(&rows[0]).is_null());
}

#[test]
fn updates_split_across_messages_keep_order() {
    let b = Peer::with_budget(dslink::rpc::transport::MessageBudget {
        max_bytes: 64,
        max_frames: 64,
    });
    b.tree.add_value("/v", "number", 0, None).unwrap();
    b.receive_requests(vec![subscribe_request(1, vec![("/v", 2, 1)])]);
    b.flush();

    for n in 1..=20 {
        b.tree.update("/v", n).unwrap();
    }
    let envelopes = b.flush();
    assert!(envelopes.len() > 1, "budget should force several messages");
    let got: Vec<Value> = rows_for(&frames(&envelopes, "responses"), 2)
        .iter()
        .map(value_of)
        .collect();
    let want: Vec<Value> = (1..=20).map(Value::from).collect();
    assert_eq!(got, want);
}
