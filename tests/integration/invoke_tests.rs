//! Invoke: initial tables, streamed updates, closes from either side.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dslink::app::tree::MemoryTree;
use dslink::error::{DsError, ErrorKind};
use dslink::rpc::frame::InvokeMode;
use dslink::rpc::permission::Permission;
use dslink::rpc::responder::{ActionResult, InvokeStream};
use dslink::rpc::transport::MessageBudget;
use dslink::Value;

use crate::mock_link::*;

fn columns() -> Vec<Value> {
    vec![Value::map().with("name", "n").with("type", "number")]
}

fn one(n: i64) -> Vec<Value> {
    vec![Value::from(n)]
}

/// An action that keeps its stream handle for the test to drive.
fn streaming_action(tree: &MemoryTree, path: &str) -> Arc<Mutex<Option<InvokeStream>>> {
    let slot = Arc::new(Mutex::new(None));
    let keep = slot.clone();
    tree.add_action(path, Permission::Read, Vec::new(), columns(), move |_params, stream| {
        *keep.lock().unwrap() = Some(stream);
        Ok(ActionResult::stream(columns()))
    })
    .unwrap();
    slot
}

fn handle(slot: &Mutex<Option<InvokeStream>>) -> InvokeStream {
    slot.lock().unwrap().clone().expect("action ran")
}

fn invoke(a: &Peer, path: &str, log: &Arc<InvokeLog>) -> Arc<dslink::rpc::requester::RequestStub> {
    a.requester().invoke(path, Value::map(), None, log.clone())
}

#[test]
fn table_result_arrives_then_closes() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree
        .add_action("/count", Permission::Read, Vec::new(), columns(), |_params, _stream| {
            Ok(ActionResult::table(columns(), (1..=3).map(one)))
        })
        .unwrap();

    let log = Arc::new(InvokeLog::default());
    invoke(&a, "/count", &log);
    pump(&a, &b);

    assert_eq!(*log.columns.lock().unwrap(), columns());
    let want: Vec<Value> = (1..=3).map(|n| Value::from(one(n))).collect();
    assert_eq!(log.rows(), want);
    assert_eq!(log.closes(), 1);
    assert!(log.errors.lock().unwrap().is_empty());
    assert_eq!(a.requester().open_requests(), 0);
    assert_eq!(b.session.responder().unwrap().open_requests(), 0);
}

#[test]
fn params_reach_the_action() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree
        .add_action("/echo", Permission::Read, Vec::new(), Vec::new(), |params, _stream| {
            Ok(ActionResult::Row(vec![params.get("text").cloned().unwrap_or_default()]))
        })
        .unwrap();

    let log = Arc::new(InvokeLog::default());
    a.requester()
        .invoke("/echo", Value::map().with("text", "hi"), None, log.clone());
    pump(&a, &b);
    assert_eq!(log.rows(), vec![Value::from(vec![Value::from("hi")])]);
    assert_eq!(log.closes(), 1);
}

#[test]
fn rows_split_across_messages_stay_in_order() {
    let a = Peer::new();
    let b = Peer::with_budget(MessageBudget {
        max_bytes: 64,
        max_frames: 64,
    });
    b.tree
        .add_action("/many", Permission::Read, Vec::new(), columns(), |_params, _stream| {
            Ok(ActionResult::table(columns(), (0..50).map(one)))
        })
        .unwrap();

    let log = Arc::new(InvokeLog::default());
    invoke(&a, "/many", &log);
    for e in a.flush() {
        b.session.process_incoming(&e).unwrap();
    }
    let envelopes = b.flush();
    assert!(envelopes.len() > 1, "tight budget should split the table");
    for e in &envelopes {
        a.session.process_incoming(e).unwrap();
    }

    let want: Vec<Value> = (0..50).map(|n| Value::from(one(n))).collect();
    assert_eq!(log.rows(), want);
    assert_eq!(log.closes(), 1);
}

#[test]
fn streamed_rows_flush_before_close() {
    let a = Peer::new();
    let b = Peer::new();
    let slot = streaming_action(&b.tree, "/feed");

    let log = Arc::new(InvokeLog::default());
    invoke(&a, "/feed", &log);
    pump(&a, &b);
    assert_eq!(log.closes(), 0, "stream stays open");

    let feed = handle(&slot);
    assert!(feed.append(vec![one(1)]));
    assert!(feed.append(vec![one(2)]));
    assert!(feed.append(vec![one(3)]));
    feed.close();

    let responses = b.flush_responses();
    let last = responses.last().unwrap();
    assert_eq!(stream(last), Some("closed"));
    assert!(last.get("updates").is_none());

    for r in responses {
        a.receive_responses(vec![r]);
    }
    let want: Vec<Value> = (1..=3).map(|n| Value::from(one(n))).collect();
    assert_eq!(log.rows(), want);
    assert_eq!(log.closes(), 1);
    assert!(!feed.append(vec![one(4)]), "closed stream refuses rows");
}

#[test]
fn mode_changes_get_frames_of_their_own() {
    let a = Peer::new();
    let b = Peer::new();
    let slot = streaming_action(&b.tree, "/modes");

    let log = Arc::new(InvokeLog::default());
    invoke(&a, "/modes", &log);
    pump(&a, &b);

    let feed = handle(&slot);
    feed.append(vec![one(1)]);
    feed.append(vec![one(2)]);
    feed.refresh(vec![one(3)]);
    feed.insert(0, vec![one(4)]);
    feed.replace(0, 1, vec![one(5)]);
    pump(&a, &b);

    let updates = log.updates.lock().unwrap().clone();
    let modes: Vec<InvokeMode> = updates.iter().map(|u| u.mode).collect();
    assert_eq!(
        modes,
        vec![
            InvokeMode::Append,
            InvokeMode::Refresh,
            InvokeMode::Insert(0),
            InvokeMode::Replace(0, 1),
        ]
    );
    assert_eq!(updates[0].rows.len(), 2, "consecutive appends share a frame");
}

#[test]
fn error_close_drops_queued_rows() {
    let a = Peer::new();
    let b = Peer::new();
    let slot = streaming_action(&b.tree, "/fail");

    let log = Arc::new(InvokeLog::default());
    invoke(&a, "/fail", &log);
    pump(&a, &b);

    let feed = handle(&slot);
    feed.append(vec![one(1)]);
    feed.close_with_error(DsError::server("sensor offline"));
    pump(&a, &b);

    assert!(log.rows().is_empty());
    let errors = log.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::ServerError);
    assert_eq!(errors[0].msg, "sensor offline");
    assert_eq!(log.closes(), 1);
}

#[test]
fn action_error_becomes_error_frame() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree
        .add_action("/strict", Permission::Read, Vec::new(), Vec::new(), |_params, _stream| {
            Err(DsError::new(ErrorKind::InvalidParameter, "missing x"))
        })
        .unwrap();

    let log = Arc::new(InvokeLog::default());
    invoke(&a, "/strict", &log);
    pump(&a, &b);
    let errors = log.errors.lock().unwrap().clone();
    assert_eq!(errors[0].kind, ErrorKind::InvalidParameter);
    assert_eq!(log.closes(), 1);
}

#[test]
fn panicking_action_is_a_server_error() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree
        .add_action("/boom", Permission::Read, Vec::new(), Vec::new(), |_params, _stream| {
            panic!("action bug")
        })
        .unwrap();

    let log = Arc::new(InvokeLog::default());
    invoke(&a, "/boom", &log);
    pump(&a, &b);
    assert_eq!(log.errors.lock().unwrap()[0].kind, ErrorKind::ServerError);
    assert_eq!(log.closes(), 1);
    assert_eq!(b.session.responder().unwrap().open_requests(), 0);
}

#[test]
fn permit_caps_the_granted_level() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree
        .add_action("/reset", Permission::Write, Vec::new(), Vec::new(), |_params, _stream| {
            Ok(ActionResult::Empty)
        })
        .unwrap();

    let denied = Arc::new(InvokeLog::default());
    a.requester()
        .invoke("/reset", Value::map(), Some(Permission::Read), denied.clone());
    let allowed = Arc::new(InvokeLog::default());
    a.requester()
        .invoke("/reset", Value::map(), Some(Permission::Write), allowed.clone());
    pump(&a, &b);

    assert_eq!(denied.errors.lock().unwrap()[0].kind, ErrorKind::PermissionDenied);
    assert!(allowed.errors.lock().unwrap().is_empty());
    assert_eq!(allowed.closes(), 1);
}

#[test]
fn invoking_a_value_node_is_invalid_method() {
    let a = Peer::new();
    let b = Peer::new();
    b.tree.add_value("/v", "number", 1, None).unwrap();

    let log = Arc::new(InvokeLog::default());
    invoke(&a, "/v", &log);
    pump(&a, &b);
    assert_eq!(log.errors.lock().unwrap()[0].kind, ErrorKind::InvalidMethod);
}

#[test]
fn local_close_is_sent_once_and_cancels_the_action() {
    let a = Peer::new();
    let b = Peer::new();
    let hooks = Arc::new(AtomicUsize::new(0));
    let seen = hooks.clone();
    b.tree
        .add_action("/watch", Permission::Read, Vec::new(), columns(), move |_params, stream| {
            let seen = seen.clone();
            stream.on_close(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            });
            Ok(ActionResult::stream(columns()))
        })
        .unwrap();

    let log = Arc::new(InvokeLog::default());
    let stub = invoke(&a, "/watch", &log);
    pump(&a, &b);
    assert_eq!(b.session.responder().unwrap().open_requests(), 1);

    stub.close();
    stub.close();
    assert!(stub.is_closed());
    assert_eq!(log.closes(), 1);

    let sent = a.flush_requests();
    let closes: Vec<&Value> = sent.iter().filter(|f| method(f) == Some("close")).collect();
    assert_eq!(closes.len(), 1);
    assert_eq!(rid(closes[0]), stub.rid());

    b.receive_requests(sent);
    assert_eq!(b.session.responder().unwrap().open_requests(), 0);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
}

#[test]
fn close_racing_a_remote_close_runs_on_close_once() {
    let a = Peer::new();
    let b = Peer::new();
    let slot = streaming_action(&b.tree, "/race");

    let log = Arc::new(InvokeLog::default());
    let stub = invoke(&a, "/race", &log);
    pump(&a, &b);

    handle(&slot).close();
    let in_flight = b.flush();
    stub.close();
    for e in &in_flight {
        a.session.process_incoming(e).unwrap();
    }

    assert_eq!(log.closes(), 1);
    let sent = a.flush_requests();
    assert_eq!(sent.iter().filter(|f| method(f) == Some("close")).count(), 1);
}

#[test]
fn response_for_unknown_rid_is_closed() {
    let a = Peer::new();
    a.receive_responses(vec![Value::map()
        .with("rid", 77u32)
        .with("stream", "open")
        .with("updates", Value::list())]);
    let sent = a.flush_requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(method(&sent[0]), Some("close"));
    assert_eq!(rid(&sent[0]), 77);

    // Already closed on the far side: nothing to say.
    a.receive_responses(vec![Value::map().with("rid", 78u32).with("stream", "closed")]);
    assert!(a.flush_requests().is_empty());
}
