// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One configured upstream, and the ordered registry of all of them
//! (§3 "Server", §4.8 "Upstream Selection").

use std::cell::{Cell, RefCell};
use std::net::IpAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::channel::ChannelHandle;

/// How long a failed upstream is skipped before being tried again (§4.9's
/// sibling sweep in the original: `UPSTREAM_REVIVE_TIME`).
const DEFAULT_REVIVE_AFTER: Duration = Duration::from_secs(60);
/// Consecutive failures before an upstream is treated as down.
const FAIL_THRESHOLD: u32 = 2;

pub(crate) struct ServerData {
    pub(crate) name: String,
    pub(crate) addr: IpAddr,
    pub(crate) port: u16,
    pub(crate) priority: u8,
    pub(crate) udp_channels: Vec<ChannelHandle>,
    pub(crate) tcp_channels: Vec<ChannelHandle>,
    /// How many TCP channels this server is configured for (§4.5 "if the
    /// server has at least one TCP channel"). TCP channels are created
    /// lazily on first reschedule, unlike UDP channels which are all
    /// constructed up front by `Resolver::init`.
    tcp_capacity: u16,
    fail_count: u32,
    dead_since: Option<Instant>,
}

/// A reference-counted handle to one configured upstream.
#[derive(Clone)]
pub struct ServerHandle(pub(crate) Rc<RefCell<ServerData>>);

impl ServerHandle {
    pub(crate) fn new(name: String, addr: IpAddr, port: u16, priority: u8, tcp_capacity: u16) -> Self {
        Self(Rc::new(RefCell::new(ServerData {
            name,
            addr,
            port,
            priority,
            udp_channels: Vec::new(),
            tcp_channels: Vec::new(),
            tcp_capacity,
            fail_count: 0,
            dead_since: None,
        })))
    }

    pub fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    pub fn priority(&self) -> u8 {
        self.0.borrow().priority
    }

    pub(crate) fn set_udp_channels(&self, channels: Vec<ChannelHandle>) {
        self.0.borrow_mut().udp_channels = channels;
    }

    pub(crate) fn set_tcp_channels(&self, channels: Vec<ChannelHandle>) {
        self.0.borrow_mut().tcp_channels = channels;
    }

    pub(crate) fn udp_channel_count(&self) -> usize {
        self.0.borrow().udp_channels.len()
    }

    pub(crate) fn tcp_channel_count(&self) -> usize {
        self.0.borrow().tcp_channels.len()
    }

    pub(crate) fn udp_channel_at(&self, index: usize) -> ChannelHandle {
        self.0.borrow().udp_channels[index].clone()
    }

    pub(crate) fn tcp_channel_at(&self, index: usize) -> ChannelHandle {
        self.0.borrow().tcp_channels[index].clone()
    }

    pub(crate) fn tcp_capacity(&self) -> u16 {
        self.0.borrow().tcp_capacity
    }

    pub(crate) fn push_tcp_channel(&self, channel: ChannelHandle) {
        self.0.borrow_mut().tcp_channels.push(channel);
    }

    pub(crate) fn addr(&self) -> std::net::SocketAddr {
        let data = self.0.borrow();
        std::net::SocketAddr::new(data.addr, data.port)
    }

    pub(crate) fn replace_udp_channel(&self, index: usize, channel: ChannelHandle) {
        self.0.borrow_mut().udp_channels[index] = channel;
    }

    /// Pick a random I/O channel on this server (§4.3 "pick a random I/O
    /// channel on that server", §4.5 "pick one TCP channel at random").
    pub(crate) fn random_udp_channel(&self) -> Option<ChannelHandle> {
        let data = self.0.borrow();
        if data.udp_channels.is_empty() {
            return None;
        }
        let idx = rand::random::<usize>() % data.udp_channels.len();
        Some(data.udp_channels[idx].clone())
    }

    pub(crate) fn random_tcp_channel(&self) -> Option<ChannelHandle> {
        let data = self.0.borrow();
        if data.tcp_channels.is_empty() {
            return None;
        }
        let idx = rand::random::<usize>() % data.tcp_channels.len();
        Some(data.tcp_channels[idx].clone())
    }

    /// `UPSTREAM_OK`: reset the failure counter (§4.2 "mark the upstream
    /// healthy").
    pub(crate) fn mark_ok(&self) {
        let mut data = self.0.borrow_mut();
        data.fail_count = 0;
        data.dead_since = None;
    }

    /// `UPSTREAM_FAIL`: bump the failure counter; once it crosses
    /// [`FAIL_THRESHOLD`] the server is skipped by selection until revived.
    pub(crate) fn mark_failed(&self, now: Instant) {
        let mut data = self.0.borrow_mut();
        data.fail_count += 1;
        if data.fail_count >= FAIL_THRESHOLD && data.dead_since.is_none() {
            data.dead_since = Some(now);
        }
    }

    /// `UPSTREAM_RESCAN`-equivalent liveness check used by round robin.
    pub(crate) fn is_usable(&self, now: Instant) -> bool {
        match self.0.borrow().dead_since {
            None => true,
            Some(since) => now.duration_since(since) >= DEFAULT_REVIVE_AFTER,
        }
    }

    pub(crate) fn downgrade(&self) -> ServerWeak {
        ServerWeak(Rc::downgrade(&self.0))
    }

    pub(crate) fn ptr_eq(&self, other: &ServerHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// A non-owning back-reference from a channel to its server (§3 "server
/// back-reference").
#[derive(Clone)]
pub(crate) struct ServerWeak(Weak<RefCell<ServerData>>);

impl ServerWeak {
    pub(crate) fn upgrade(&self) -> Option<ServerHandle> {
        self.0.upgrade().map(ServerHandle)
    }
}

/// The ordered collection of configured upstreams, with a round-robin
/// cursor (§2 "Upstream Registry").
#[derive(Default)]
pub struct UpstreamRegistry {
    servers: Vec<ServerHandle>,
    cursor: Cell<usize>,
}

impl UpstreamRegistry {
    pub(crate) fn new() -> Self {
        Self {
            servers: Vec::new(),
            cursor: Cell::new(0),
        }
    }

    pub(crate) fn push(&mut self, server: ServerHandle) {
        self.servers.push(server);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ServerHandle> {
        self.servers.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.servers.len()
    }

    /// Resolve an [`crate::plugin::UpstreamElement`]'s index back to a
    /// server (§4.8).
    pub(crate) fn get(&self, index: usize) -> Option<ServerHandle> {
        self.servers.get(index).cloned()
    }

    /// The built-in fallback selection policy when no [`crate::plugin::UpstreamSelector`]
    /// is registered, or it declines to pick (§4.8): round robin, skipping
    /// servers that are still within their revival window.
    pub(crate) fn round_robin_select(&self, now: Instant) -> Option<ServerHandle> {
        if self.servers.is_empty() {
            return None;
        }
        let len = self.servers.len();
        let start = self.cursor.get();
        for offset in 0..len {
            let idx = (start + offset) % len;
            let candidate = &self.servers[idx];
            if candidate.is_usable(now) {
                self.cursor.set((idx + 1) % len);
                return Some(candidate.clone());
            }
        }
        // Every server is down: still return one so the caller can try and
        // fail rather than refuse to send at all.
        let idx = start % len;
        self.cursor.set((idx + 1) % len);
        Some(self.servers[idx].clone())
    }
}
