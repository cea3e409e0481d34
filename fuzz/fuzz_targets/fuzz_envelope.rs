//! Fuzz target: inbound envelope handling
//!
//! Decodes arbitrary bytes as a JSON envelope and routes it through a
//! session serving a small tree. Whatever the peer sends, the session must
//! not panic and must still be able to assemble its outgoing messages.
//!
//! cargo fuzz run fuzz_envelope

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use dslink::app::ports::{NodeInfo, NullEventSink};
use dslink::app::tree::MemoryTree;
use dslink::rpc::codec::{Codec, JsonCodec};
use dslink::rpc::permission::Permission;
use dslink::rpc::responder::ActionResult;
use dslink::rpc::transport::FramedSink;
use dslink::{Session, SessionOptions};

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = JsonCodec.decode(data) else {
        return;
    };

    let tree = MemoryTree::new();
    let _ = tree.add_node("/n", NodeInfo::node());
    let _ = tree.add_value("/n/v", "number", 0, Some(Permission::Write));
    let _ = tree.add_action("/n/a", Permission::Read, Vec::new(), Vec::new(), |params, _s| {
        Ok(ActionResult::Row(vec![params.clone()]))
    });

    let sink = Arc::new(FramedSink::default());
    let session = Session::new(
        SessionOptions::default(),
        tree,
        sink.clone(),
        Arc::new(NullEventSink),
    );
    session.on_connect();
    let _ = session.process_incoming(&envelope);
    let _ = session.flush();
    let _ = sink.take_output();
    session.on_disconnect();
});
