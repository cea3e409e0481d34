//! Requester-side subscription aggregation.
//!
//! Every local interest in a remote path shares one [`SubscriptionGroup`]
//! and therefore one SID on the wire.
//!
//! ```text
//!   subscribe(path, qos) ──▶ group (PendingSubscribe) ──drain──▶ Subscribed
//!                                                                   │
//!   last member leaves ──▶ PendingUnsubscribe ──drain──▶ removed ◀───┘
//!                                │
//!                 new subscribe ─┘ revives the group, same SID
//! ```
//!
//! Lock order is table → group. Consumer callbacks always run after both
//! locks are released.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::rpc::frame::{ValueUpdate, request};
use crate::rpc::guard::{CloseOnce, lock, shielded};
use crate::rpc::outbound::{OutboundEntry, OutboundQueue, ScheduleFlag, WriteContext, WriteStatus};
use crate::rpc::request_table::{RequestTable, next_id};
use crate::rpc::value::Value;

use super::handlers::SubscriptionHandler;
use super::stubs::RequestStub;

// ── Members ──────────────────────────────────────────────────

struct Member {
    id: u64,
    sid: u32,
    path: String,
    qos: u8,
    handler: Arc<dyn SubscriptionHandler>,
    /// Sequence number of the newest update handed to the handler.
    delivered: AtomicU64,
    closed: CloseOnce,
}

impl Member {
    /// Deliver unless a newer update already reached this member.
    fn deliver(&self, seq: u64, update: &ValueUpdate) {
        if self.closed.is_closed() {
            return;
        }
        if self.delivered.fetch_max(seq, Ordering::AcqRel) >= seq {
            return;
        }
        shielded("SUB", || self.handler.on_update(update));
    }

    fn close(&self) {
        if self.closed.close() {
            shielded("SUB", || self.handler.on_close());
        }
    }
}

/// Handle for one local subscription.
pub struct Subscription {
    member: Arc<Member>,
    table: Weak<SubscriptionTable>,
}

impl Subscription {
    pub fn sid(&self) -> u32 {
        self.member.sid
    }

    pub fn path(&self) -> &str {
        &self.member.path
    }

    /// QoS this member asked for (the group may run higher).
    pub fn qos(&self) -> u8 {
        self.member.qos
    }

    pub fn is_closed(&self) -> bool {
        self.member.closed.is_closed()
    }

    /// Detach from the group. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(table) = self.table.upgrade() {
            table.unsubscribe(&self.member);
        }
        self.member.close();
    }
}

// ── Groups ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    PendingSubscribe,
    Subscribed,
    PendingUnsubscribe,
    Unsubscribed,
}

struct GroupInner {
    members: BTreeMap<u64, Arc<Member>>,
    qos: u8,
    /// QoS carried by the last subscribe frame; `None` until one is sent.
    sent_qos: Option<u8>,
    seq: u64,
    last: Option<(u64, ValueUpdate)>,
    state: GroupState,
    queued_subscribe: bool,
    queued_unsubscribe: bool,
}

pub struct SubscriptionGroup {
    path: String,
    sid: u32,
    inner: Mutex<GroupInner>,
}

impl SubscriptionGroup {
    fn new(path: &str, sid: u32, qos: u8) -> Self {
        Self {
            path: path.to_string(),
            sid,
            inner: Mutex::new(GroupInner {
                members: BTreeMap::new(),
                qos,
                sent_qos: None,
                seq: 0,
                last: None,
                state: GroupState::PendingSubscribe,
                queued_subscribe: false,
                queued_unsubscribe: false,
            }),
        }
    }
}

impl GroupInner {
    /// Add a member. Returns `true` if the group needs a (re)subscribe
    /// frame queued.
    ///
    /// A group revived from `PendingUnsubscribe` has no members left, so its
    /// QoS restarts from the new member's and the wire is corrected if that
    /// differs from what was last sent.
    fn attach(&mut self, member: Arc<Member>) -> bool {
        let revived = self.state == GroupState::PendingUnsubscribe;
        if revived {
            self.state = if self.sent_qos.is_some() {
                GroupState::Subscribed
            } else {
                GroupState::PendingSubscribe
            };
            self.qos = member.qos;
        } else {
            self.qos = self.qos.max(member.qos);
        }
        self.members.insert(member.id, member);

        let stale = self
            .sent_qos
            .is_none_or(|sent| self.qos > sent || (revived && self.qos != sent));
        if stale {
            self.state = GroupState::PendingSubscribe;
        }
        if self.state == GroupState::PendingSubscribe && !self.queued_subscribe {
            self.queued_subscribe = true;
            return true;
        }
        false
    }
}

/// Point-in-time view of a group, for inspection and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSnapshot {
    pub sid: u32,
    pub qos: u8,
    pub state: GroupState,
    pub members: usize,
    pub last: Option<ValueUpdate>,
}

// ── Table ────────────────────────────────────────────────────

#[derive(Default)]
struct TableState {
    by_path: HashMap<String, Arc<SubscriptionGroup>>,
    by_sid: HashMap<u32, Arc<SubscriptionGroup>>,
    last_sid: u32,
    next_member: u64,
    to_subscribe: VecDeque<Arc<SubscriptionGroup>>,
    to_unsubscribe: VecDeque<Arc<SubscriptionGroup>>,
}

impl TableState {
    fn allocate_sid(&mut self) -> u32 {
        let mut sid = next_id(self.last_sid);
        while self.by_sid.contains_key(&sid) {
            sid = next_id(sid);
        }
        self.last_sid = sid;
        sid
    }

    fn forget(&mut self, group: &Arc<SubscriptionGroup>) {
        if self
            .by_path
            .get(&group.path)
            .is_some_and(|g| Arc::ptr_eq(g, group))
        {
            self.by_path.remove(&group.path);
        }
        if self
            .by_sid
            .get(&group.sid)
            .is_some_and(|g| Arc::ptr_eq(g, group))
        {
            self.by_sid.remove(&group.sid);
        }
    }
}

/// SID ↔ group maps plus the pending subscribe/unsubscribe batches.
/// Also the outbound entry that writes those batches.
pub struct SubscriptionTable {
    me: Weak<SubscriptionTable>,
    flag: ScheduleFlag,
    queue: Arc<OutboundQueue>,
    requests: Arc<RequestTable<RequestStub>>,
    state: Mutex<TableState>,
}

impl SubscriptionTable {
    pub(crate) fn new(queue: Arc<OutboundQueue>, requests: Arc<RequestTable<RequestStub>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            flag: ScheduleFlag::new(),
            queue,
            requests,
            state: Mutex::new(TableState::default()),
        })
    }

    fn schedule(&self) {
        if let Some(me) = self.me.upgrade() {
            self.queue.enqueue(me);
        }
    }

    /// Attach a consumer to `path`, creating the group (and SID) on first
    /// interest. A group that already has a value replays it to the new
    /// consumer before this returns.
    pub fn subscribe(
        &self,
        path: &str,
        qos: u8,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Subscription {
        let (member, replay, schedule) = {
            let mut st = lock(&self.state);
            let id = st.next_member;
            st.next_member += 1;

            let group = match st.by_path.get(path) {
                Some(g) => g.clone(),
                None => {
                    let sid = st.allocate_sid();
                    let g = Arc::new(SubscriptionGroup::new(path, sid, qos));
                    st.by_path.insert(path.to_string(), g.clone());
                    st.by_sid.insert(sid, g.clone());
                    debug!("SUB[{}]: new group for {}", sid, path);
                    g
                }
            };

            let member = Arc::new(Member {
                id,
                sid: group.sid,
                path: group.path.clone(),
                qos,
                handler,
                delivered: AtomicU64::new(0),
                closed: CloseOnce::new(),
            });

            let mut g = lock(&group.inner);
            let schedule = g.attach(member.clone());
            let replay = g.last.clone();
            drop(g);
            if schedule {
                st.to_subscribe.push_back(group.clone());
            }
            (member, replay, schedule)
        };

        if let Some((seq, update)) = replay {
            member.deliver(seq, &update);
        }
        if schedule {
            self.schedule();
        }
        Subscription {
            member,
            table: self.me.clone(),
        }
    }

    fn unsubscribe(&self, member: &Arc<Member>) {
        let schedule = {
            let mut st = lock(&self.state);
            let Some(group) = st.by_sid.get(&member.sid).cloned() else {
                return;
            };
            let mut g = lock(&group.inner);
            if g.members.remove(&member.id).is_none() || !g.members.is_empty() {
                return;
            }

            if g.sent_qos.is_none() {
                // Never went out; nothing to take back.
                g.state = GroupState::Unsubscribed;
                drop(g);
                st.forget(&group);
                debug!("SUB[{}]: dropped before subscribe was sent", group.sid);
                false
            } else {
                g.state = GroupState::PendingUnsubscribe;
                let queue = !g.queued_unsubscribe;
                g.queued_unsubscribe = true;
                drop(g);
                if queue {
                    st.to_unsubscribe.push_back(group);
                }
                true
            }
        };
        if schedule {
            self.schedule();
        }
    }

    /// Route the rows of a `rid 0` response. Malformed rows are logged and
    /// skipped.
    pub fn dispatch(&self, rows: &[Value]) {
        for row in rows {
            match ValueUpdate::from_row(row) {
                Ok((sid, update)) => self.dispatch_update(sid, update),
                Err(e) => warn!("SUB: dropping update row: {}", e),
            }
        }
    }

    /// Fan one update out to every member of the SID's group, in attach
    /// order, and cache it for late joiners. Unknown SIDs are ignored.
    pub fn dispatch_update(&self, sid: u32, update: ValueUpdate) {
        let Some(group) = lock(&self.state).by_sid.get(&sid).cloned() else {
            debug!("SUB[{}]: update for unknown sid dropped", sid);
            return;
        };
        let (seq, members) = {
            let mut g = lock(&group.inner);
            g.seq += 1;
            let seq = g.seq;
            g.last = Some((seq, update.clone()));
            (seq, g.members.values().cloned().collect::<Vec<_>>())
        };
        for member in members {
            member.deliver(seq, &update);
        }
    }

    /// Drop every group and close every member. Returns the number of
    /// groups that were live.
    pub fn on_disconnect(&self) -> usize {
        let groups: Vec<_> = {
            let mut st = lock(&self.state);
            st.to_subscribe.clear();
            st.to_unsubscribe.clear();
            st.by_path.clear();
            st.by_sid.drain().map(|(_, g)| g).collect()
        };
        let count = groups.len();
        let mut members = Vec::new();
        for group in &groups {
            let mut g = lock(&group.inner);
            g.state = GroupState::Unsubscribed;
            g.queued_subscribe = false;
            g.queued_unsubscribe = false;
            members.extend(std::mem::take(&mut g.members).into_values());
        }
        for member in members {
            member.close();
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.state).by_sid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self, path: &str) -> Option<GroupSnapshot> {
        let group = lock(&self.state).by_path.get(path).cloned()?;
        let g = lock(&group.inner);
        Some(GroupSnapshot {
            sid: group.sid,
            qos: g.qos,
            state: g.state,
            members: g.members.len(),
            last: g.last.as_ref().map(|(_, u)| u.clone()),
        })
    }

    fn ack_rid(&self, method: &'static str) -> u32 {
        self.requests
            .allocate(|rid| RequestStub::ack(rid, method), |s| s)
            .rid()
    }
}

impl OutboundEntry for SubscriptionTable {
    fn schedule_flag(&self) -> &ScheduleFlag {
        &self.flag
    }

    /// At most one subscribe and one unsubscribe frame per call. A batch
    /// stops early when the next entry would overflow the message; the
    /// remainder waits for the next message.
    fn write_to(&self, ctx: &mut WriteContext<'_>) -> WriteStatus {
        let mut st = lock(&self.state);

        let mut paths = Vec::new();
        let mut bytes = 0;
        while let Some(group) = st.to_subscribe.pop_front() {
            let mut g = lock(&group.inner);
            if g.state != GroupState::PendingSubscribe {
                g.queued_subscribe = false;
                continue;
            }
            let entry = Value::map()
                .with("path", group.path.as_str())
                .with("sid", group.sid)
                .with("qos", g.qos);
            let size = entry.size_hint();
            if !(paths.is_empty() && ctx.is_empty()) && ctx.should_end_with(bytes + size) {
                drop(g);
                st.to_subscribe.push_front(group);
                break;
            }
            g.state = GroupState::Subscribed;
            g.sent_qos = Some(g.qos);
            g.queued_subscribe = false;
            bytes += size;
            paths.push(entry);
        }
        if !paths.is_empty() {
            let rid = self.ack_rid("subscribe");
            debug!("SUB: subscribe rid={} paths={}", rid, paths.len());
            ctx.write_request(request(rid, "subscribe").with("paths", paths));
        }

        let mut sids = Vec::new();
        let mut bytes = 0;
        while let Some(group) = st.to_unsubscribe.pop_front() {
            let mut g = lock(&group.inner);
            if g.state != GroupState::PendingUnsubscribe {
                g.queued_unsubscribe = false;
                continue;
            }
            let size = Value::from(group.sid).size_hint() + 1;
            if !(sids.is_empty() && ctx.is_empty()) && ctx.should_end_with(bytes + size) {
                drop(g);
                st.to_unsubscribe.push_front(group);
                break;
            }
            g.state = GroupState::Unsubscribed;
            g.queued_unsubscribe = false;
            drop(g);
            st.forget(&group);
            bytes += size;
            sids.push(Value::from(group.sid));
        }
        if !sids.is_empty() {
            let rid = self.ack_rid("unsubscribe");
            debug!("SUB: unsubscribe rid={} sids={}", rid, sids.len());
            ctx.write_request(request(rid, "unsubscribe").with("sids", sids));
        }

        if st.to_subscribe.is_empty() && st.to_unsubscribe.is_empty() {
            WriteStatus::Done
        } else {
            WriteStatus::More
        }
    }
}
