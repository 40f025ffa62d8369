// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A hand-driven [`AsyncDriver`] for scenario tests (§8): no real reactor,
//! no timer wheel. Registrations are kept in plain maps and a test fires
//! them explicitly by calling `fire_read_for_fd`/`take_write_for_fd`/
//! `any_timer`, then feeds the returned waiter straight to the matching
//! `Resolver::process_*` method.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::runtime::{AsyncDriver, EventHandle, PeriodicCallback, ReadWaiter, TimerWaiter, WriteWaiter};

/// A registered read/write/timer/periodic entry, keyed by the `u64` inside
/// its [`EventHandle`].
#[derive(Default)]
struct Registry {
    reads: HashMap<u64, (RawFd, ReadWaiter)>,
    writes: HashMap<u64, (RawFd, WriteWaiter)>,
    timers: HashMap<u64, (Duration, TimerWaiter)>,
    periodics: HashMap<u64, (Duration, PeriodicCallback)>,
}

/// A test double for [`AsyncDriver`]. Real sockets still do real I/O (the
/// scenario tests bind loopback UDP/TCP sockets); only the *registration*
/// side — "tell me when fd 7 is readable" — is hand-driven instead of
/// backed by epoll/kqueue.
#[derive(Default)]
pub struct MockAsyncDriver {
    next: Cell<u64>,
    registry: RefCell<Registry>,
}

impl MockAsyncDriver {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    fn next_handle(&self) -> EventHandle {
        let id = self.next.get();
        self.next.set(id + 1);
        EventHandle(id)
    }

    /// Read registrations persist until the resolver explicitly cancels
    /// them (channel reset), so firing one just clones its waiter rather
    /// than consuming the registration.
    pub fn fire_read_for_fd(&self, fd: RawFd) -> Option<ReadWaiter> {
        self.registry
            .borrow()
            .reads
            .values()
            .find(|(f, _)| *f == fd)
            .map(|(_, waiter)| waiter.clone())
    }

    /// Write registrations are one-shot in this crate's usage: every write-
    /// ready handler either cancels or replaces its registration before
    /// doing anything else, so firing one consumes it.
    pub fn take_write_for_fd(&self, fd: RawFd) -> Option<WriteWaiter> {
        let mut registry = self.registry.borrow_mut();
        let key = registry.writes.iter().find(|(_, (f, _))| *f == fd).map(|(k, _)| *k)?;
        registry.writes.remove(&key).map(|(_, waiter)| waiter)
    }

    /// The single earliest-registered timer, if any. Scenario tests only
    /// ever have one request in flight at a time, so "earliest" and "only"
    /// coincide; tests with more than one in-flight request should use
    /// [`MockAsyncDriver::timer_for`] instead.
    pub fn any_timer(&self) -> Option<(EventHandle, TimerWaiter)> {
        let registry = self.registry.borrow();
        let mut entries: Vec<_> = registry.timers.iter().collect();
        entries.sort_by_key(|(id, _)| **id);
        entries.first().map(|(id, (_, waiter))| (EventHandle(**id), waiter.clone()))
    }

    pub fn pending_timer_count(&self) -> usize {
        self.registry.borrow().timers.len()
    }

    pub fn pending_write_count(&self) -> usize {
        self.registry.borrow().writes.len()
    }

    pub fn fire_periodic(&self, index: usize) {
        let cb = self.registry.borrow().periodics.values().nth(index).map(|(_, cb)| cb.clone());
        if let Some(cb) = cb {
            cb();
        }
    }
}

impl AsyncDriver for MockAsyncDriver {
    fn add_read(&self, fd: RawFd, arg: ReadWaiter) -> EventHandle {
        let handle = self.next_handle();
        self.registry.borrow_mut().reads.insert(handle.0, (fd, arg));
        handle
    }

    fn del_read(&self, handle: EventHandle) {
        self.registry.borrow_mut().reads.remove(&handle.0);
    }

    fn add_write(&self, fd: RawFd, arg: WriteWaiter) -> EventHandle {
        let handle = self.next_handle();
        self.registry.borrow_mut().writes.insert(handle.0, (fd, arg));
        handle
    }

    fn del_write(&self, handle: EventHandle) {
        self.registry.borrow_mut().writes.remove(&handle.0);
    }

    fn add_timer(&self, dur: Duration, arg: TimerWaiter) -> EventHandle {
        let handle = self.next_handle();
        self.registry.borrow_mut().timers.insert(handle.0, (dur, arg));
        handle
    }

    fn repeat_timer(&self, _handle: EventHandle) {
        // The registration already persists until `del_timer`; there is
        // nothing to re-arm in a hand-driven registry.
    }

    fn del_timer(&self, handle: EventHandle) {
        self.registry.borrow_mut().timers.remove(&handle.0);
    }

    fn add_periodic(&self, dur: Duration, cb: PeriodicCallback) -> EventHandle {
        let handle = self.next_handle();
        self.registry.borrow_mut().periodics.insert(handle.0, (dur, cb));
        handle
    }

    fn del_periodic(&self, handle: EventHandle) {
        self.registry.borrow_mut().periodics.remove(&handle.0);
    }
}
