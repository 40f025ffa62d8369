// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The host event loop collaborator.
//!
//! The resolver never polls a socket itself and never blocks the calling
//! thread. Instead it registers interest with whatever reactor the embedder
//! runs (an epoll/kqueue loop, a `mio::Poll`, anything) through this trait,
//! and the embedder calls back into [`crate::resolver::Resolver`] when an
//! event fires. This mirrors `RuntimeProvider`/`Time` in hickory-proto, which
//! play the same "externally supplied capability" role for a future-based
//! client instead of a callback-based one.

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::channel::ChannelHandle;
use crate::request::RequestHandle;

/// Opaque token returned by every `add_*` registration, and required by the
/// matching `del_*`/`repeat_timer` call. The resolver never inspects its
/// contents; only the driver implementation assigns meaning to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// Argument delivered to a registered read callback: always a channel, since
/// only channels (never individual requests) are readable.
#[derive(Clone)]
pub struct ReadWaiter(pub ChannelHandle);

/// Argument delivered to a registered write callback.
///
/// The C original (`librdns`) registers a single write callback for both UDP
/// retransmits and TCP channels, and discriminates the two cases at runtime
/// by comparing the first eight bytes of the argument against a sentinel
/// (`RDNS_IO_CHANNEL_TAG`) — a workaround for a single untyped `void *add_write`
/// signature, and an architectural wart worth designing away (§4.7/§9).
/// Rust has no need for the workaround: the two
/// cases are distinct enum variants, matched exhaustively, at zero runtime
/// cost.
#[derive(Clone)]
pub enum WriteWaiter {
    /// A UDP request retrying a send that previously returned `WouldBlock`.
    Request(RequestHandle),
    /// A TCP channel draining its write queue, or completing its connect
    /// handshake.
    Channel(ChannelHandle),
}

/// Argument delivered to a registered timer callback: always the request
/// whose retransmit/timeout deadline elapsed.
#[derive(Clone)]
pub struct TimerWaiter(pub RequestHandle);

/// A periodic maintenance callback, invoked with no arguments on its own
/// schedule. `Resolver` installs these for the upstream-revival/TCP-recycle
/// sweep (§4.4 "Recycle") and the channel-refresh sweep (§4.9); embedders
/// never construct one directly.
pub type PeriodicCallback = Rc<dyn Fn()>;

/// The host event loop, as seen by the resolver.
///
/// Implementations are expected to be cheap to clone (an `Rc` around a
/// `mio`/`epoll` registry, typically) since the resolver holds one for the
/// lifetime of every channel and request it creates.
pub trait AsyncDriver {
    /// Register interest in readability of `fd`. Only ever one outstanding
    /// read registration per channel.
    fn add_read(&self, fd: RawFd, arg: ReadWaiter) -> EventHandle;
    /// Cancel a previous `add_read`.
    fn del_read(&self, handle: EventHandle);

    /// Register interest in writability of `fd`.
    fn add_write(&self, fd: RawFd, arg: WriteWaiter) -> EventHandle;
    /// Cancel a previous `add_write`.
    fn del_write(&self, handle: EventHandle);

    /// Arm a one-shot timer that fires after `dur`.
    fn add_timer(&self, dur: Duration, arg: TimerWaiter) -> EventHandle;
    /// Re-arm a timer previously returned by `add_timer`/`repeat_timer` for
    /// another full `dur` from now, without changing its argument.
    fn repeat_timer(&self, handle: EventHandle);
    /// Cancel a previous `add_timer`.
    fn del_timer(&self, handle: EventHandle);

    /// Register a recurring callback that fires every `dur` until cancelled.
    fn add_periodic(&self, dur: Duration, cb: PeriodicCallback) -> EventHandle;
    /// Cancel a previous `add_periodic`.
    fn del_periodic(&self, handle: EventHandle);
}
