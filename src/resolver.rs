// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The resolver root: owns upstreams, the async driver, the optional
//! plugins, the fake-reply table, and orchestrates every state transition
//! described in §4 by dispatching on the handles in [`crate::request`],
//! [`crate::channel`], and [`crate::server`].

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::channel::{tcp, udp, ChannelHandle};
use crate::codec::{ParsedRecord, PacketCodec, QuestionMatch};
use crate::config::{ResolverOpts, ServerConfig};
use crate::error::{ResolverError, Result};
use crate::fake::FakeReplyTable;
use crate::plugin::{CurvePlugin, UpstreamElement, UpstreamSelector};
use crate::reply::{Rcode, RecordType, Reply, ReplyFlags};
use crate::request::{random_query_id, RequestEvent, RequestHandle, RequestState};
use crate::runtime::{AsyncDriver, EventHandle, PeriodicCallback, ReadWaiter, TimerWaiter, WriteWaiter};
use crate::server::{ServerHandle, UpstreamRegistry};

struct ParsedHeader {
    qr: bool,
    rcode: Rcode,
    qdcount: u16,
    ancount: u16,
    ad: bool,
    tc: bool,
}

/// Parse the fixed 12-byte DNS header fields the driver itself inspects
/// (§4.6); name/record parsing stays with the external codec.
fn parse_header(bytes: &[u8]) -> Option<ParsedHeader> {
    if bytes.len() < 12 {
        return None;
    }
    let flags = u16::from_be_bytes([bytes[2], bytes[3]]);
    Some(ParsedHeader {
        qr: (flags >> 15) & 1 != 0,
        rcode: Rcode::from_wire((flags & 0x0f) as u8),
        qdcount: u16::from_be_bytes([bytes[4], bytes[5]]),
        ancount: u16::from_be_bytes([bytes[6], bytes[7]]),
        ad: (flags >> 5) & 1 != 0,
        tc: (flags >> 9) & 1 != 0,
    })
}

struct ResolverInner {
    opts: ResolverOpts,
    driver: Option<Rc<dyn AsyncDriver>>,
    codec: Rc<dyn PacketCodec>,
    curve_plugin: Option<Rc<dyn CurvePlugin>>,
    selector: Option<Rc<dyn UpstreamSelector>>,
    servers: UpstreamRegistry,
    pending: Vec<ServerConfig>,
    fake_replies: FakeReplyTable,
    initialized: bool,
    maintenance_handle: Option<EventHandle>,
}

/// The resolver root object (§3 "Resolver").
///
/// `!Send`/`!Sync` by construction (built on `Rc<RefCell<_>>`): a
/// `Resolver` may only be driven from the single thread that owns its
/// async driver (§5).
#[derive(Clone)]
pub struct Resolver(Rc<RefCell<ResolverInner>>);

impl Resolver {
    /// Construct an uninitialized resolver (§6 `Resolver::new`). `codec` is
    /// the external wire-format collaborator; unlike the C original there is
    /// no global codec, so it is supplied here rather than discovered later.
    pub fn new(codec: Rc<dyn PacketCodec>, opts: ResolverOpts) -> Self {
        Self(Rc::new(RefCell::new(ResolverInner {
            opts,
            driver: None,
            codec,
            curve_plugin: None,
            selector: None,
            servers: UpstreamRegistry::new(),
            pending: Vec::new(),
            fake_replies: FakeReplyTable::new(),
            initialized: false,
            maintenance_handle: None,
        })))
    }

    /// Install the async driver (§6 `Resolver::bind_async`).
    pub fn bind_async(&self, driver: Rc<dyn AsyncDriver>) {
        self.0.borrow_mut().driver = Some(driver);
    }

    /// Register a curve (encrypted-transport) plugin (§6, §9 "Global plugin
    /// slot").
    pub fn register_curve_plugin(&self, plugin: Rc<dyn CurvePlugin>) {
        self.0.borrow_mut().curve_plugin = Some(plugin);
    }

    /// Install an upstream-selection policy plugin (§6, §4.8).
    pub fn set_upstream_selector(&self, selector: Rc<dyn UpstreamSelector>) {
        self.0.borrow_mut().selector = Some(selector);
    }

    /// Configure channel recycling (§6, §4.9).
    pub fn set_max_io_uses(&self, n: u64, check_period: Duration) {
        let mut inner = self.0.borrow_mut();
        inner.opts.max_ioc_uses = n;
        inner.opts.ioc_check_period = Some(check_period);
    }

    /// Toggle the EDNS DO bit on outgoing queries (§6).
    pub fn set_dnssec(&self, enabled: bool) {
        self.0.borrow_mut().opts.dnssec = enabled;
    }

    /// Add or replace a fake-reply short-circuit entry (§6, §4.10).
    pub fn set_fake_reply(&self, name: &str, record_type: RecordType, reply: Reply) -> bool {
        self.0.borrow_mut().fake_replies.register(name, record_type, reply)
    }

    /// Queue a server for construction at [`Resolver::init`] (§6
    /// `Resolver::add_server`).
    pub fn add_server(&self, config: ServerConfig) -> Result<()> {
        if config.udp_channels == 0 {
            return Err(ResolverError::ZeroChannelCount);
        }
        if config.addr.port() == 0 {
            return Err(ResolverError::InvalidPort);
        }
        self.0.borrow_mut().pending.push(config);
        Ok(())
    }

    /// Construct all I/O channels and start periodic maintenance (§6
    /// `Resolver::init`).
    pub fn init(&self) -> Result<()> {
        {
            let inner = self.0.borrow();
            if inner.initialized {
                return Err(ResolverError::AlreadyInitialized);
            }
            if inner.driver.is_none() {
                return Err(ResolverError::NoAsyncDriver);
            }
            if inner.pending.is_empty() {
                return Err(ResolverError::NoServers);
            }
        }

        let pending = std::mem::take(&mut self.0.borrow_mut().pending);
        for cfg in pending {
            let server = ServerHandle::new(
                cfg.addr.ip().to_string(),
                cfg.addr.ip(),
                cfg.addr.port(),
                cfg.priority,
                cfg.tcp_channels,
            );
            let mut udp_channels = Vec::with_capacity(cfg.udp_channels as usize);
            for _ in 0..cfg.udp_channels {
                let channel = udp::new_channel(cfg.addr, server.downgrade())?;
                self.register_read_for_channel(&channel);
                udp_channels.push(channel);
            }
            server.set_udp_channels(udp_channels);
            self.0.borrow_mut().servers.push(server);
            debug!(addr = %cfg.addr, "registered upstream server");
        }

        let (period, driver) = {
            let mut inner = self.0.borrow_mut();
            inner.initialized = true;
            (inner.opts.ioc_check_period, inner.driver.clone().unwrap())
        };
        if let Some(period) = period {
            let resolver = self.clone();
            let cb: PeriodicCallback = Rc::new(move || resolver.run_maintenance_sweep());
            let handle = driver.add_periodic(period, cb);
            self.0.borrow_mut().maintenance_handle = Some(handle);
        }
        Ok(())
    }

    /// Build and dispatch a request (§6 `Resolver::make_request`).
    pub fn make_request(
        &self,
        queries: Vec<(String, RecordType)>,
        timeout: Duration,
        repeats: u32,
        callback: Box<dyn FnOnce(Reply)>,
    ) -> Result<RequestHandle> {
        if !self.0.borrow().initialized {
            return Err(ResolverError::NoAsyncDriver);
        }
        if queries.is_empty() {
            return Err(ResolverError::NoQueries);
        }
        if queries.iter().any(|(name, _)| name.is_empty()) {
            return Err(ResolverError::EmptyName);
        }

        let (codec, dnssec) = {
            let inner = self.0.borrow();
            (inner.codec.clone(), inner.opts.dnssec)
        };
        let id = random_query_id();
        let packet = codec.encode_query(id, &queries, dnssec);
        let (name0, type0) = queries[0].clone();
        // `repeats` counts total transmit attempts; the first transmission
        // isn't itself a retransmit, so the internal budget is one less
        // (see DESIGN.md's Open Question decisions — this reconciles §4.3's
        // retransmit-counter semantics with the literal send/timer counts
        // in §8's E4 scenario and the "retransmit budget of 1" boundary case).
        let req = RequestHandle::new(id, packet, queries, repeats.saturating_sub(1), timeout, callback);

        let fake = self.0.borrow_mut().fake_replies.lookup(&name0, type0);
        if let Some(reply) = fake {
            trace!(name = %name0, "fake reply short-circuit");
            req.set_fake_reply(reply);
            req.set_state(RequestState::Fake);
            if let Some(driver) = self.driver() {
                let handle = driver.add_timer(Duration::ZERO, TimerWaiter(req.clone()));
                req.set_event(Some(RequestEvent::Timer(handle)));
            }
            return Ok(req);
        }

        let server = self.select_server(&name0, false, None);
        let server = match server {
            Some(s) => s,
            None => {
                warn!("no upstream available for fresh request");
                req.set_state(RequestState::Replied);
                req.deliver(Reply::new(Rcode::ServFailNoUpstream));
                return Ok(req);
            }
        };
        self.dispatch_with_failover(&req, &name0, server);
        Ok(req)
    }

    /// Dispatch entry point: the driver calls this when `waiter`'s channel
    /// becomes readable (§6).
    pub fn process_read(&self, waiter: ReadWaiter) {
        let ReadWaiter(channel) = waiter;
        if channel.is_tcp() {
            loop {
                match tcp::read_frame(&channel) {
                    Ok(tcp::ReadOutcome::Frame(bytes)) => {
                        if !bytes.is_empty() {
                            self.handle_reply_bytes(&channel, bytes);
                        }
                    }
                    Ok(tcp::ReadOutcome::Pending) => break,
                    Ok(tcp::ReadOutcome::Eof) => {
                        debug!("TCP channel closed by peer");
                        self.reset_channel(&channel);
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "TCP read error, resetting channel");
                        self.reset_channel(&channel);
                        break;
                    }
                }
            }
        } else {
            match udp::recv(&channel) {
                Ok(Some(bytes)) => {
                    // If a curve plugin is registered but doesn't recognize
                    // this datagram as one of its own encrypted frames, fall
                    // back to treating it as plaintext (§1, §4.8).
                    let bytes = match self.curve_plugin() {
                        Some(plugin) => plugin.decrypt(&bytes).unwrap_or(bytes),
                        None => bytes,
                    };
                    self.handle_reply_bytes(&channel, bytes);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "UDP read error"),
            }
        }
    }

    /// Dispatch entry point: the driver calls this when `waiter` becomes
    /// writable, or when a deferred fake-reply timer fires (§6).
    pub fn process_write(&self, waiter: WriteWaiter) {
        match waiter {
            WriteWaiter::Request(req) => self.handle_request_write_ready(req),
            WriteWaiter::Channel(channel) => self.handle_channel_write_ready(channel),
        }
    }

    /// Dispatch entry point: the driver calls this when `waiter`'s timer
    /// fires (§6).
    pub fn process_timer(&self, waiter: TimerWaiter) {
        let TimerWaiter(req) = waiter;

        if req.state() == RequestState::Fake {
            req.take_event();
            req.set_state(RequestState::Replied);
            if let Some(reply) = req.take_fake_reply() {
                req.deliver(reply);
            }
            return;
        }

        // A request rescheduled over TCP (§4.5) times out immediately on
        // its next timer fire, with no retransmit-count check and no retry
        // on the TCP channel (§4.3 TCP row).
        if req.state() == RequestState::Tcp {
            req.take_event();
            self.fail_request_timeout(&req);
            return;
        }

        let timer_handle = match req.take_event() {
            Some(RequestEvent::Timer(h)) => h,
            _ => return,
        };

        if req.retransmits() == 0 {
            if let Some(driver) = self.driver() {
                driver.del_timer(timer_handle);
            }
            self.fail_request_timeout(&req);
            return;
        }

        let remaining = req.decrement_retransmits();
        let channel = match req.io() {
            Some(c) => c,
            None => {
                if let Some(driver) = self.driver() {
                    driver.del_timer(timer_handle);
                }
                return;
            }
        };

        let more_than_one_upstream = self.0.borrow().servers.len() > 1;
        let should_rotate = !channel.is_active() || (remaining == 0 && more_than_one_upstream);

        if should_rotate {
            if let Some(driver) = self.driver() {
                driver.del_timer(timer_handle);
            }
            debug!(id = req.id(), "rotating upstream on retransmit");
            self.rotate_and_resend(&req, &channel);
        } else {
            if let Some(driver) = self.driver() {
                driver.repeat_timer(timer_handle);
            }
            req.set_event(Some(RequestEvent::Timer(timer_handle)));
            trace!(id = req.id(), "retransmitting on same channel");
            self.resend_same_channel(&req, &channel);
        }
    }

    // -- internal orchestration -------------------------------------------------

    fn driver(&self) -> Option<Rc<dyn AsyncDriver>> {
        self.0.borrow().driver.clone()
    }

    fn codec(&self) -> Rc<dyn PacketCodec> {
        self.0.borrow().codec.clone()
    }

    fn curve_plugin(&self) -> Option<Rc<dyn CurvePlugin>> {
        self.0.borrow().curve_plugin.clone()
    }

    /// Send `packet` over `channel`, through the curve plugin if one is
    /// registered (§4.2 "If no curve plugin: ... `sendto`/`send`"),
    /// otherwise over the raw UDP socket.
    fn send_udp(&self, channel: &ChannelHandle, packet: &[u8]) -> io::Result<udp::SendOutcome> {
        match self.curve_plugin() {
            Some(plugin) => match plugin.send(packet, Some(channel.peer_addr())) {
                Ok(Some(_)) => Ok(udp::SendOutcome::Sent),
                Ok(None) => Ok(udp::SendOutcome::WouldBlock),
                Err(e) => Err(e),
            },
            None => udp::send(channel, packet),
        }
    }

    fn select_server(
        &self,
        name: &str,
        is_retransmit: bool,
        prev: Option<UpstreamElement>,
    ) -> Option<ServerHandle> {
        let inner = self.0.borrow();
        if let Some(selector) = &inner.selector {
            let elt = if is_retransmit {
                selector.select_retransmit(name, prev.unwrap_or(UpstreamElement { server_index: 0 }))
            } else {
                selector.select(name)
            };
            if let Some(elt) = elt {
                if let Some(server) = inner.servers.get(elt.server_index) {
                    return Some(server);
                }
            }
        }
        inner.servers.round_robin_select(Instant::now())
    }

    fn register_read_for_channel(&self, channel: &ChannelHandle) {
        if let Some(driver) = self.driver() {
            let handle = driver.add_read(channel.fd(), ReadWaiter(channel.clone()));
            channel.set_read_handle(Some(handle));
        }
    }

    fn register_write_for_channel(&self, channel: &ChannelHandle) {
        if let Some(driver) = self.driver() {
            let handle = driver.add_write(channel.fd(), WriteWaiter::Channel(channel.clone()));
            channel.set_write_handle(Some(handle));
        }
    }

    fn register_write_for_request(&self, req: &RequestHandle, channel: &ChannelHandle) {
        if let Some(driver) = self.driver() {
            let handle = driver.add_write(channel.fd(), WriteWaiter::Request(req.clone()));
            req.set_event(Some(RequestEvent::Write(handle)));
        }
    }

    fn arm_timer(&self, req: &RequestHandle) {
        if let Some(driver) = self.driver() {
            let handle = driver.add_timer(req.timeout(), TimerWaiter(req.clone()));
            req.set_event(Some(RequestEvent::Timer(handle)));
        }
    }

    /// NEW-state dispatch over UDP, and the `renew=true` half of retransmit
    /// rotation (§4.3). A failed send here is terminal for this request:
    /// unlike [`Resolver::dispatch_with_failover`], it does not try another
    /// upstream.
    fn dispatch_over_udp(&self, req: &RequestHandle, channel: ChannelHandle) {
        if !self.try_dispatch_over_udp(req, &channel) {
            req.set_state(RequestState::Replied);
            req.deliver(Reply::new(Rcode::NetErr));
        }
    }

    /// Attempt to send `req` over `channel`. Returns `true` once the request
    /// has moved to `WaitReply`/`WaitSend` (live); `false` on a send error,
    /// in which case the request's table entry and I/O handle have already
    /// been cleaned up and the caller decides what happens next.
    fn try_dispatch_over_udp(&self, req: &RequestHandle, channel: &ChannelHandle) -> bool {
        let codec = self.codec();
        if let Err(e) = channel.table_insert(req, codec.as_ref()) {
            warn!(error = %e, "ID space exhausted on channel");
            return false;
        }
        req.set_io(Some(channel.clone()));
        channel.bump_uses();
        let outcome = {
            let packet = req.packet();
            self.send_udp(channel, &packet)
        };
        match outcome {
            Ok(udp::SendOutcome::Sent) => {
                req.set_state(RequestState::WaitReply);
                self.arm_timer(req);
                true
            }
            Ok(udp::SendOutcome::WouldBlock) => {
                req.set_state(RequestState::WaitSend);
                self.register_write_for_request(req, channel);
                true
            }
            Err(e) => {
                warn!(error = %e, "UDP send failed");
                channel.table_remove(req);
                req.set_io(None);
                if let Some(server) = channel.server().upgrade() {
                    server.mark_failed(Instant::now());
                }
                false
            }
        }
    }

    /// First dispatch of a fresh request (§8 scenario "two upstreams, first
    /// send fails"): try every configured upstream in turn before finally
    /// giving up. Each individual attempt still behaves like a single
    /// `dispatch_over_udp` — only the cross-upstream looping is additional.
    fn dispatch_with_failover(&self, req: &RequestHandle, name: &str, first_server: ServerHandle) {
        let total = self.0.borrow().servers.len().max(1);
        let mut current = Some(first_server);
        for _ in 0..total {
            let server = match current.take() {
                Some(s) => s,
                None => break,
            };
            if let Some(channel) = server.random_udp_channel() {
                if self.try_dispatch_over_udp(req, &channel) {
                    return;
                }
            }
            current = self.select_server(name, true, None);
        }
        req.set_state(RequestState::Replied);
        req.deliver(Reply::new(Rcode::NetErr));
    }

    fn handle_request_write_ready(&self, req: RequestHandle) {
        if let Some(RequestEvent::Write(handle)) = req.take_event() {
            if let Some(driver) = self.driver() {
                driver.del_write(handle);
            }
        }
        let channel = match req.io() {
            Some(c) => c,
            None => return,
        };
        if channel.is_tcp() {
            // A retransmit scheduled on a TCP channel only ever waits on
            // the channel's own write registration, not the request's.
            return;
        }
        let outcome = {
            let packet = req.packet();
            self.send_udp(&channel, &packet)
        };
        match outcome {
            Ok(udp::SendOutcome::Sent) => {
                req.set_state(RequestState::WaitReply);
                self.arm_timer(&req);
            }
            Ok(udp::SendOutcome::WouldBlock) => {
                self.register_write_for_request(&req, &channel);
            }
            Err(e) => {
                warn!(error = %e, "UDP send failed on write-ready retry");
                channel.table_remove(&req);
                req.set_io(None);
                if let Some(server) = channel.server().upgrade() {
                    server.mark_failed(Instant::now());
                }
                req.set_state(RequestState::Replied);
                req.deliver(Reply::new(Rcode::NetErr));
            }
        }
    }

    fn handle_channel_write_ready(&self, channel: ChannelHandle) {
        if !channel.is_active() {
            channel.set_active(true);
            self.register_read_for_channel(&channel);
        }
        match tcp::flush(&channel) {
            Ok(true) => {
                if let Some(handle) = channel.take_write_handle() {
                    if let Some(driver) = self.driver() {
                        driver.del_write(handle);
                    }
                }
            }
            Ok(false) => self.register_write_for_channel(&channel),
            Err(e) => {
                warn!(error = %e, "TCP write error, resetting channel");
                self.reset_channel(&channel);
            }
        }
    }

    fn fail_request_timeout(&self, req: &RequestHandle) {
        if let Some(channel) = req.io() {
            channel.table_remove(req);
        }
        req.set_io(None);
        req.set_state(RequestState::Replied);
        req.deliver(Reply::new(Rcode::Timeout));
    }

    fn resend_same_channel(&self, req: &RequestHandle, channel: &ChannelHandle) {
        channel.bump_uses();
        if channel.is_tcp() {
            let packet = req.packet();
            tcp::enqueue(channel, &packet);
            drop(packet);
            self.register_write_for_channel(channel);
            return;
        }
        let outcome = {
            let packet = req.packet();
            self.send_udp(channel, &packet)
        };
        match outcome {
            Ok(udp::SendOutcome::Sent) => {}
            Ok(udp::SendOutcome::WouldBlock) => {
                req.set_state(RequestState::WaitSend);
                self.register_write_for_request(req, channel);
            }
            Err(e) => {
                warn!(error = %e, "UDP retransmit send failed");
                channel.table_remove(req);
                req.set_io(None);
                if let Some(server) = channel.server().upgrade() {
                    server.mark_failed(Instant::now());
                }
                req.set_state(RequestState::Replied);
                req.deliver(Reply::new(Rcode::NetErr));
            }
        }
    }

    fn rotate_and_resend(&self, req: &RequestHandle, old_channel: &ChannelHandle) {
        old_channel.table_remove(req);
        req.set_io(None);
        let name = req
            .queries()
            .first()
            .map(|(n, _)| n.clone())
            .unwrap_or_default();
        let server = self.select_server(&name, true, None);
        let server = match server {
            Some(s) => s,
            None => {
                req.set_state(RequestState::Replied);
                req.deliver(Reply::new(Rcode::ServFailNoUpstream));
                return;
            }
        };
        let channel = match server.random_udp_channel() {
            Some(c) => c,
            None => {
                req.set_state(RequestState::Replied);
                req.deliver(Reply::new(Rcode::ServFailNoUpstream));
                return;
            }
        };
        self.dispatch_over_udp(req, channel);
    }

    /// §4.5: move a truncated UDP reply's request onto a TCP channel.
    /// Returns `true` if the reschedule succeeded (caller must not also
    /// deliver the truncated reply).
    fn reschedule_over_tcp(&self, req: &RequestHandle) -> bool {
        let old_channel = match req.io() {
            Some(c) => c,
            None => return false,
        };
        let server = match old_channel.server().upgrade() {
            Some(s) => s,
            None => return false,
        };
        let tcp_channel = match self.get_or_create_tcp_channel(&server) {
            Some(c) => c,
            None => return false,
        };

        old_channel.table_remove(req);

        {
            let packet = req.packet();
            tcp::enqueue(&tcp_channel, &packet);
        }
        let codec = self.codec();
        if tcp_channel.table_insert(req, codec.as_ref()).is_err() {
            warn!("ID space exhausted rescheduling over TCP");
            return false;
        }
        req.set_io(Some(tcp_channel.clone()));
        req.set_state(RequestState::Tcp);
        self.arm_timer(req);
        self.register_write_for_channel(&tcp_channel);
        true
    }

    fn get_or_create_tcp_channel(&self, server: &ServerHandle) -> Option<ChannelHandle> {
        if server.tcp_channel_count() < server.tcp_capacity() as usize {
            let channel = tcp::new_channel(server.addr(), server.downgrade()).ok()?;
            self.register_read_for_channel(&channel);
            server.push_tcp_channel(channel.clone());
            Some(channel)
        } else {
            server.random_tcp_channel()
        }
    }

    fn handle_reply_bytes(&self, channel: &ChannelHandle, bytes: Vec<u8>) {
        let header = match parse_header(&bytes) {
            Some(h) => h,
            None => return,
        };
        if !header.qr {
            return;
        }
        let id = u16::from_be_bytes([bytes[0], bytes[1]]);
        let req = match channel.table_lookup(id) {
            Some(r) => r,
            None => {
                channel.bump_uses();
                trace!(id, "reply for unknown transaction ID, dropped");
                return;
            }
        };

        let requested: Vec<(String, RecordType)> = req.queries().clone();
        if header.qdcount as usize != requested.len() {
            return;
        }

        let codec = self.codec();
        let mut pos = 12usize;
        for index in 0..requested.len() {
            match codec.compare_question(&bytes, pos, &requested, index) {
                QuestionMatch::Matched(next_pos) => pos = next_pos,
                QuestionMatch::Mismatch => return,
            }
        }

        channel.table_remove(&req);
        if let Some(RequestEvent::Timer(h)) = req.take_event() {
            if let Some(driver) = self.driver() {
                driver.del_timer(h);
            }
        }
        if let Some(server) = channel.server().upgrade() {
            server.mark_ok();
        }

        let mut reply = Reply::new(header.rcode);
        if header.ad {
            reply.flags |= ReplyFlags::AUTH;
        }
        if header.tc {
            reply.flags |= ReplyFlags::TRUNCATED;
        }

        let requested_type = requested[0].1;
        let mut matched_requested_type = false;
        for _ in 0..header.ancount {
            match codec.parse_record(&bytes, pos) {
                ParsedRecord::Matched(entry, next_pos) => {
                    if entry.record_type == requested_type || requested_type == RecordType::Any {
                        matched_requested_type = true;
                    }
                    reply.entries.push(entry);
                    pos = next_pos;
                }
                ParsedRecord::Skipped(next_pos) => pos = next_pos,
                ParsedRecord::Incomplete => break,
            }
        }
        if !matched_requested_type && requested_type != RecordType::Any && reply.code == Rcode::NoError {
            reply.code = Rcode::NoRec;
        }

        if reply.flags.contains(ReplyFlags::TRUNCATED) && !channel.is_tcp() {
            req.set_io(Some(channel.clone()));
            if self.reschedule_over_tcp(&req) {
                return;
            }
        }

        req.set_io(None);
        req.set_state(RequestState::Replied);
        req.deliver(reply);
    }

    /// Channel reset (§5 "Cancellation", §8 invariant 6): every request in
    /// `channel`'s table is failed with a network error, and the channel's
    /// event registrations are cancelled.
    fn reset_channel(&self, channel: &ChannelHandle) {
        let requests = channel.take_all_requests();
        let driver = self.driver();
        for req in requests {
            if let Some(event) = req.take_event() {
                if let Some(driver) = &driver {
                    match event {
                        RequestEvent::Timer(h) => driver.del_timer(h),
                        RequestEvent::Write(h) => driver.del_write(h),
                    }
                }
            }
            req.set_io(None);
            req.set_state(RequestState::Replied);
            req.deliver(Reply::new(Rcode::NetErr));
        }
        if let Some(handle) = channel.take_read_handle() {
            if let Some(driver) = &driver {
                driver.del_read(handle);
            }
        }
        if let Some(handle) = channel.take_write_handle() {
            if let Some(driver) = &driver {
                driver.del_write(handle);
            }
        }
        channel.set_active(false);
    }

    /// Periodic maintenance (§4.9 channel recycling, §4.4 TCP recycle).
    fn run_maintenance_sweep(&self) {
        let max_uses = self.0.borrow().opts.max_ioc_uses;
        let servers: Vec<ServerHandle> = self.0.borrow().servers.iter().cloned().collect();
        for server in &servers {
            if max_uses > 0 {
                for idx in 0..server.udp_channel_count() {
                    let channel = server.udp_channel_at(idx);
                    if channel.uses() > max_uses {
                        debug!(uses = channel.uses(), "recycling UDP channel");
                        channel.set_active(false);
                        if let Some(old_read) = channel.take_read_handle() {
                            if let Some(driver) = self.driver() {
                                driver.del_read(old_read);
                            }
                        }
                        if let Ok(fresh) = udp::new_channel(server.addr(), server.downgrade()) {
                            self.register_read_for_channel(&fresh);
                            server.replace_udp_channel(idx, fresh);
                        }
                    }
                }
            }
            for idx in 0..server.tcp_channel_count() {
                let channel = server.tcp_channel_at(idx);
                if channel.requests_is_empty() && channel.is_active() {
                    debug!("recycling idle TCP channel");
                    self.reset_channel(&channel);
                }
            }
        }
    }
}

/// Test-only accessors so scenario tests can drive a [`crate::tests::mock_driver::MockAsyncDriver`]
/// against real channel file descriptors without a real event loop.
#[cfg(any(test, feature = "testing"))]
impl Resolver {
    /// The raw fd of UDP channel `channel_idx` on server `server_idx`.
    pub fn test_udp_channel_fd(&self, server_idx: usize, channel_idx: usize) -> Option<std::os::unix::io::RawFd> {
        let inner = self.0.borrow();
        let server = inner.servers.get(server_idx)?;
        if channel_idx >= server.udp_channel_count() {
            return None;
        }
        Some(server.udp_channel_at(channel_idx).fd())
    }

    /// The raw fd of TCP channel `channel_idx` on server `server_idx`, if it
    /// has been created yet (TCP channels are lazy — see [`Resolver::get_or_create_tcp_channel`]).
    pub fn test_tcp_channel_fd(&self, server_idx: usize, channel_idx: usize) -> Option<std::os::unix::io::RawFd> {
        let inner = self.0.borrow();
        let server = inner.servers.get(server_idx)?;
        if channel_idx >= server.tcp_channel_count() {
            return None;
        }
        Some(server.tcp_channel_at(channel_idx).fd())
    }

    /// Number of TCP channels server `server_idx` has created so far.
    pub fn test_tcp_channel_count(&self, server_idx: usize) -> usize {
        let inner = self.0.borrow();
        match inner.servers.get(server_idx) {
            Some(server) => server.tcp_channel_count(),
            None => 0,
        }
    }
}
