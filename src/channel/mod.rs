// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single socket bound to one upstream, pooled on a [`crate::server::Server`]
//! (§3 "I/O Channel").
//!
//! This module only models the bookkeeping shared by both transports (use
//! counter, request table, flags, back-references); the UDP-specific and
//! TCP-specific I/O lives in [`udp`] and [`tcp`].

pub mod tcp;
pub mod udp;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::request::RequestTable;
use crate::runtime::EventHandle;
use crate::server::ServerWeak;

pub(crate) enum ChannelSocket {
    Udp(udp::UdpChannelState),
    Tcp(tcp::TcpChannelState),
}

impl ChannelSocket {
    pub(crate) fn is_tcp(&self) -> bool {
        matches!(self, ChannelSocket::Tcp(_))
    }
}

pub(crate) struct ChannelData {
    pub(crate) socket: ChannelSocket,
    /// `RDNS_CHANNEL_CONNECTED` (§3): UDP sets this after the first
    /// successful `sendto`+`connect`; TCP sets it once the connect
    /// handshake completes.
    pub(crate) connected: bool,
    /// `RDNS_CHANNEL_ACTIVE` (§3, §4.3 "if the current channel is
    /// inactive"): false only while a channel is mid-refresh-swap (§4.9) or
    /// (TCP) before its first connect.
    pub(crate) active: bool,
    pub(crate) uses: u64,
    pub(crate) requests: RequestTable,
    pub(crate) server: ServerWeak,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) read_handle: Option<EventHandle>,
    pub(crate) write_handle: Option<EventHandle>,
}

/// A reference-counted handle to one I/O channel.
///
/// Shared between its server's channel array slot and every [`crate::request::RequestHandle`]
/// currently bound to it (§3 "Lifetimes"); `Rc`'s clone/drop replaces the
/// C original's `REF_RETAIN`/`REF_RELEASE` pair.
#[derive(Clone)]
pub struct ChannelHandle(pub(crate) Rc<RefCell<ChannelData>>);

impl ChannelHandle {
    pub(crate) fn new(socket: ChannelSocket, peer_addr: SocketAddr, server: ServerWeak) -> Self {
        let active = !socket.is_tcp();
        Self(Rc::new(RefCell::new(ChannelData {
            socket,
            connected: false,
            active,
            uses: 0,
            requests: RequestTable::new(),
            server,
            peer_addr,
            read_handle: None,
            write_handle: None,
        })))
    }

    pub fn is_tcp(&self) -> bool {
        self.0.borrow().socket.is_tcp()
    }

    pub fn is_connected(&self) -> bool {
        self.0.borrow().connected
    }

    pub fn is_active(&self) -> bool {
        self.0.borrow().active
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.0.borrow_mut().active = active;
    }

    pub fn uses(&self) -> u64 {
        self.0.borrow().uses
    }

    pub(crate) fn bump_uses(&self) {
        self.0.borrow_mut().uses += 1;
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.0.borrow().peer_addr
    }

    pub(crate) fn server(&self) -> ServerWeak {
        self.0.borrow().server.clone()
    }

    pub(crate) fn requests_is_empty(&self) -> bool {
        self.0.borrow().requests.is_empty()
    }

    pub(crate) fn table_lookup(&self, id: u16) -> Option<crate::request::RequestHandle> {
        self.0.borrow().requests.lookup(id)
    }

    pub(crate) fn table_insert(
        &self,
        req: &crate::request::RequestHandle,
        codec: &dyn crate::codec::PacketCodec,
    ) -> crate::error::Result<()> {
        self.0.borrow_mut().requests.insert(req, codec)
    }

    pub(crate) fn table_remove(&self, req: &crate::request::RequestHandle) {
        self.0.borrow_mut().requests.remove(req);
    }

    pub(crate) fn take_all_requests(&self) -> Vec<crate::request::RequestHandle> {
        self.0.borrow_mut().requests.take_all()
    }

    pub(crate) fn set_read_handle(&self, handle: Option<EventHandle>) {
        self.0.borrow_mut().read_handle = handle;
    }

    pub(crate) fn take_read_handle(&self) -> Option<EventHandle> {
        self.0.borrow_mut().read_handle.take()
    }

    pub(crate) fn set_write_handle(&self, handle: Option<EventHandle>) {
        self.0.borrow_mut().write_handle = handle;
    }

    pub(crate) fn take_write_handle(&self) -> Option<EventHandle> {
        self.0.borrow_mut().write_handle.take()
    }

    pub(crate) fn ptr_eq(&self, other: &ChannelHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn downgrade(&self) -> ChannelWeak {
        ChannelWeak(Rc::downgrade(&self.0))
    }

    /// The raw file descriptor to register with an [`crate::runtime::AsyncDriver`]
    /// (§6 "add_read/add_write take a raw fd").
    pub fn fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        let data = self.0.borrow();
        match &data.socket {
            ChannelSocket::Udp(udp) => udp.as_raw_fd(),
            ChannelSocket::Tcp(tcp) => tcp.as_raw_fd(),
        }
    }
}

/// A non-owning reference to a channel, used where a strong cycle would
/// otherwise form (the `ReadWaiter`/`WriteWaiter` callback arguments are
/// the exception: they are strong, matching §3's rule that cyclic
/// ownership is broken at the request-table boundary, not the event-
/// registration boundary).
#[derive(Clone)]
pub(crate) struct ChannelWeak(Weak<RefCell<ChannelData>>);

impl ChannelWeak {
    pub(crate) fn upgrade(&self) -> Option<ChannelHandle> {
        self.0.upgrade().map(ChannelHandle)
    }
}
