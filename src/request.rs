// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One in-flight query, and the per-channel table that demultiplexes
//! replies by transaction ID (§3 "Request", §4.1).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use rand::distributions::{Distribution, Standard};
use rand::thread_rng;

use crate::channel::ChannelHandle;
use crate::codec::PacketCodec;
use crate::error::{ResolverError, Result};
use crate::reply::{RecordType, Reply};
use crate::runtime::EventHandle;

/// Maximum number of probes `RequestTable::insert` will take before giving
/// up on finding a free transaction ID (§4.1).
pub const MAX_ID_COLLISIONS: u32 = 32;

/// The request lifecycle state (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    New,
    WaitSend,
    WaitReply,
    /// In flight over TCP after a truncation reschedule (§4.5).
    Tcp,
    /// Terminal: the callback has been invoked.
    Replied,
    /// Short-circuited by the fake-reply table (§4.10), waiting for the
    /// scheduled write event that will deliver it.
    Fake,
}

/// Which kind of event a request currently has registered, so it can be
/// cancelled with the matching `del_*` call on a terminal transition
/// (§5 "Cancellation").
#[derive(Clone, Copy)]
pub(crate) enum RequestEvent {
    Timer(EventHandle),
    Write(EventHandle),
}

/// Generate a random 16-bit transaction ID, the same way hickory-proto's
/// `UdpClientStream::random_query_id` does: each request's ID only needs to
/// be unique within the channel it lands on, not globally, so a plain
/// thread-local RNG draw is sufficient (§4.1).
pub(crate) fn random_query_id() -> u16 {
    Standard.sample(&mut thread_rng())
}

pub(crate) struct RequestData {
    pub(crate) id: u16,
    pub(crate) state: RequestState,
    pub(crate) packet: Vec<u8>,
    pub(crate) queries: Vec<(String, RecordType)>,
    pub(crate) retransmits: u32,
    pub(crate) timeout: Duration,
    pub(crate) io: Option<ChannelHandle>,
    pub(crate) event: Option<RequestEvent>,
    pub(crate) fake_reply: Option<Reply>,
    callback: Option<Box<dyn FnOnce(Reply)>>,
}

/// A reference-counted handle to one in-flight request.
///
/// `librdns` manages this with manual `REF_INIT_RETAIN`/`REF_RETAIN`/
/// `REF_RELEASE` calls threaded through every function that touches a
/// request (§5 "Resource lifecycle"); `Rc`'s ordinary clone/drop gives the
/// same counted-lifetime behavior without the bookkeeping, so the
/// `retain`/`release` call sites below exist only as doc comments pointing
/// at the C-side operation they replace.
#[derive(Clone)]
pub struct RequestHandle(pub(crate) Rc<RefCell<RequestData>>);

impl RequestHandle {
    pub(crate) fn new(
        id: u16,
        packet: Vec<u8>,
        queries: Vec<(String, RecordType)>,
        retransmits: u32,
        timeout: Duration,
        callback: Box<dyn FnOnce(Reply)>,
    ) -> Self {
        Self(Rc::new(RefCell::new(RequestData {
            id,
            state: RequestState::New,
            packet,
            queries,
            retransmits,
            timeout,
            io: None,
            event: None,
            fake_reply: None,
            callback: Some(callback),
        })))
    }

    pub(crate) fn id(&self) -> u16 {
        self.0.borrow().id
    }

    pub(crate) fn state(&self) -> RequestState {
        self.0.borrow().state
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        self.0.borrow_mut().state = state;
    }

    pub(crate) fn io(&self) -> Option<ChannelHandle> {
        self.0.borrow().io.clone()
    }

    pub(crate) fn set_io(&self, io: Option<ChannelHandle>) {
        self.0.borrow_mut().io = io;
    }

    pub(crate) fn retransmits(&self) -> u32 {
        self.0.borrow().retransmits
    }

    pub(crate) fn decrement_retransmits(&self) -> u32 {
        let mut data = self.0.borrow_mut();
        data.retransmits = data.retransmits.saturating_sub(1);
        data.retransmits
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.0.borrow().timeout
    }

    pub(crate) fn take_event(&self) -> Option<RequestEvent> {
        self.0.borrow_mut().event.take()
    }

    pub(crate) fn set_event(&self, event: Option<RequestEvent>) {
        self.0.borrow_mut().event = event;
    }

    pub(crate) fn packet(&self) -> std::cell::Ref<'_, Vec<u8>> {
        std::cell::Ref::map(self.0.borrow(), |d| &d.packet)
    }

    pub(crate) fn queries(&self) -> std::cell::Ref<'_, Vec<(String, RecordType)>> {
        std::cell::Ref::map(self.0.borrow(), |d| &d.queries)
    }

    /// Rewrite the transaction ID in the stored packet, in place, via the
    /// codec (§4.1 "ID regeneration rewrites the first two bytes of the
    /// packet buffer in-place.").
    pub(crate) fn set_id(&self, id: u16, codec: &dyn PacketCodec) {
        let mut data = self.0.borrow_mut();
        data.id = id;
        codec.rewrite_id(&mut data.packet, id);
    }

    pub(crate) fn take_fake_reply(&self) -> Option<Reply> {
        self.0.borrow_mut().fake_reply.take()
    }

    pub(crate) fn set_fake_reply(&self, reply: Reply) {
        self.0.borrow_mut().fake_reply = Some(reply);
    }

    /// Deliver the final reply to the caller's callback. Idempotent against
    /// being called twice only by construction: the state machine never
    /// reaches a second terminal transition (§8 invariant 1), but taking the
    /// `Option` here means a stray double-call is a silent no-op rather than
    /// a panic, the lone exception to this crate's "trust the invariants"
    /// rule because this is the final line of defense for invariant 1.
    pub(crate) fn deliver(&self, reply: Reply) {
        let cb = self.0.borrow_mut().callback.take();
        if let Some(cb) = cb {
            cb(reply);
        }
    }

    pub(crate) fn ptr_eq(&self, other: &RequestHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Per-channel mapping from transaction ID to in-flight request (§3
/// "Request Table", §4.1).
#[derive(Default)]
pub struct RequestTable {
    map: HashMap<u16, RequestHandle>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn lookup(&self, id: u16) -> Option<RequestHandle> {
        self.map.get(&id).cloned()
    }

    /// Insert `req` under its current ID, regenerating the ID on collision.
    /// Fails after [`MAX_ID_COLLISIONS`] consecutive collisions (§4.1).
    pub fn insert(&mut self, req: &RequestHandle, codec: &dyn PacketCodec) -> Result<()> {
        let mut attempts = 0;
        loop {
            if !self.map.contains_key(&req.id()) {
                break;
            }
            attempts += 1;
            if attempts > MAX_ID_COLLISIONS {
                return Err(ResolverError::IdSpaceExhausted);
            }
            req.set_id(random_query_id(), codec);
        }
        self.map.insert(req.id(), req.clone());
        Ok(())
    }

    /// Remove `req` from the table. Idempotent against an entry that is
    /// already missing (§4.1 "remove(req) is idempotent").
    pub fn remove(&mut self, req: &RequestHandle) {
        if let Some(existing) = self.map.get(&req.id()) {
            if existing.ptr_eq(req) {
                self.map.remove(&req.id());
            }
        }
    }

    /// Remove and return every request currently in the table (§7 "Read
    /// errors / EOF on TCP", §8 invariant 6). Used by channel reset: the
    /// caller still owns the driver reference needed to cancel each
    /// request's registered event, so that step happens at the call site,
    /// not here.
    pub(crate) fn take_all(&mut self) -> Vec<RequestHandle> {
        self.map.drain().map(|(_, req)| req).collect()
    }
}
