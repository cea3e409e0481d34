//! Shared state under concurrent callers: subscription groups, streamed
//! rows racing the writer, and closes racing closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use dslink::rpc::permission::Permission;
use dslink::rpc::requester::Subscription;
use dslink::rpc::responder::{ActionResult, InvokeStream};
use dslink::rpc::transport::MessageBudget;
use dslink::Value;

use crate::mock_link::*;

const THREADS: usize = 8;

fn subscribe_frames(requests: &[Value]) -> Vec<&Value> {
    requests
        .iter()
        .filter(|f| method(f) == Some("subscribe"))
        .collect()
}

fn unsubscribe_frames(requests: &[Value]) -> Vec<&Value> {
    requests
        .iter()
        .filter(|f| method(f) == Some("unsubscribe"))
        .collect()
}

#[test]
fn concurrent_subscribes_share_one_sid() {
    let a = Peer::new();
    let peer = &a;
    let mut handles: Vec<Subscription> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|i| {
                s.spawn(move || {
                    (0..4)
                        .map(|_| {
                            peer.requester().subscribe(
                                "/a",
                                (i % 3) as u8,
                                Arc::new(ValueLog::default()),
                            )
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    let sid = handles[0].sid();
    assert!(handles.iter().all(|h| h.sid() == sid));
    assert_eq!(a.requester().subscriptions().len(), 1);

    let requests = a.flush_requests();
    let subscribes = subscribe_frames(&requests);
    assert_eq!(subscribes.len(), 1);
    let paths = subscribes[0].get("paths").and_then(Value::as_list).unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].get("sid").and_then(Value::as_u32), Some(sid));
    assert_eq!(paths[0].get("qos").and_then(Value::as_u32), Some(2));

    // Everyone but one leaves at once: the group stays.
    let last = handles.pop().unwrap();
    thread::scope(|s| {
        for chunk in handles.chunks(4) {
            s.spawn(move || chunk.iter().for_each(Subscription::unsubscribe));
        }
    });
    assert!(a.flush_requests().is_empty());
    assert_eq!(a.requester().subscriptions().snapshot("/a").unwrap().members, 1);

    last.unsubscribe();
    let requests = a.flush_requests();
    let unsubscribes = unsubscribe_frames(&requests);
    assert_eq!(unsubscribes.len(), 1);
    assert_eq!(
        unsubscribes[0].get("sids").and_then(Value::as_list),
        Some(&[Value::from(sid)][..])
    );
}

#[test]
fn churn_never_unsubscribes_a_held_path() {
    let a = Peer::new();
    let anchor = a
        .requester()
        .subscribe("/a", 1, Arc::new(ValueLog::default()));
    a.flush();
    let sid = anchor.sid();

    let peer = &a;
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(move || {
                for _ in 0..50 {
                    let sub = peer
                        .requester()
                        .subscribe("/a", 0, Arc::new(ValueLog::default()));
                    assert_eq!(sub.sid(), sid);
                    sub.unsubscribe();
                }
            });
        }
    });

    // Lower QoS joiners need no frame, and the count never hit zero.
    assert!(a.flush_requests().is_empty());
    let snap = a.requester().subscriptions().snapshot("/a").unwrap();
    assert_eq!(snap.members, 1);
    assert_eq!(snap.qos, 1);
}

#[test]
fn rows_appended_while_flushing_arrive_in_order() {
    let a = Peer::new();
    let b = Peer::with_budget(MessageBudget {
        max_bytes: 128,
        max_frames: 4,
    });
    let slot: Arc<Mutex<Option<InvokeStream>>> = Arc::new(Mutex::new(None));
    let keep = slot.clone();
    b.tree
        .add_action("/feed", Permission::Read, Vec::new(), Vec::new(), move |_params, stream| {
            *keep.lock().unwrap() = Some(stream);
            Ok(ActionResult::stream(Vec::new()))
        })
        .unwrap();

    let log = Arc::new(InvokeLog::default());
    a.requester().invoke("/feed", Value::map(), None, log.clone());
    pump(&a, &b);
    let feed = slot.lock().unwrap().clone().unwrap();

    const ROWS: i64 = 500;
    let done = AtomicBool::new(false);
    let mut sent = Vec::new();
    thread::scope(|s| {
        s.spawn(|| {
            for n in 0..ROWS {
                assert!(feed.append(vec![vec![Value::from(n)]]));
            }
            feed.close();
            done.store(true, Ordering::SeqCst);
        });
        while !done.load(Ordering::SeqCst) {
            sent.extend(b.flush());
        }
    });
    sent.extend(b.flush());
    assert!(sent.len() > 1);

    for envelope in &sent {
        a.session.process_incoming(envelope).unwrap();
    }
    let want: Vec<Value> = (0..ROWS).map(|n| Value::from(vec![Value::from(n)])).collect();
    assert_eq!(log.rows(), want);
    assert_eq!(log.closes(), 1);
    assert!(log.errors.lock().unwrap().is_empty());
}

#[test]
fn local_and_remote_close_race_runs_on_close_once() {
    let a = Peer::new();
    let logs: Vec<Arc<InvokeLog>> = (0..64).map(|_| Arc::new(InvokeLog::default())).collect();
    let stubs: Vec<_> = logs
        .iter()
        .map(|log| a.requester().invoke("/x", Value::map(), None, log.clone()))
        .collect();
    a.flush();

    let peer = &a;
    thread::scope(|s| {
        let local = &stubs;
        s.spawn(move || local.iter().for_each(|stub| stub.close()));
        s.spawn(move || {
            for stub in local {
                peer.receive_responses(vec![Value::map()
                    .with("rid", stub.rid())
                    .with("stream", "closed")]);
            }
        });
    });

    for log in &logs {
        assert_eq!(log.closes(), 1);
    }
    assert_eq!(a.requester().open_requests(), 0);
    let closes = a
        .flush_requests()
        .iter()
        .filter(|f| method(f) == Some("close"))
        .count();
    assert!(closes <= stubs.len());
}
