// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The crypto-transport and upstream-selection collaborators (§1, §4.8, §9).

use std::net::SocketAddr;

/// An encrypted-transport plugin (§1 "curve plugin", §9 "Global plugin
/// slot").
///
/// The original C resolver accepts at most one of these in a single global
/// slot on the resolver struct. Here it is simply a field on [`crate::resolver::Resolver`]
/// the embedder can attach at construction time — a capability, not a
/// write-once global (§9).
pub trait CurvePlugin {
    /// Send `packet` to `peer` over the encrypted transport, returning the
    /// number of bytes sent on success. Mirrors the `sendto`/`send`
    /// semantics of §4.2: `Ok(None)` means "would block, register a write
    /// callback", `Err` means a hard failure.
    fn send(&self, packet: &[u8], peer: Option<SocketAddr>) -> std::io::Result<Option<usize>>;

    /// Attempt to decrypt one inbound datagram. Returns `None` if `buf`
    /// does not contain a complete encrypted frame recognized by this
    /// plugin (the caller then falls back to treating `buf` as plaintext,
    /// per the unconditional `rdns_find_dns_request` fallback in the
    /// original's `rdns_process_udp_read`).
    fn decrypt(&self, buf: &[u8]) -> Option<Vec<u8>>;
}

/// Opaque identity for one upstream, as handed back by an
/// [`UpstreamSelector`]. The index is into whatever server list the
/// resolver passed the plugin at construction time (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamElement {
    pub server_index: usize,
}

/// An upstream health/selection policy plugin (§1 "upstream selector",
/// §4.8).
///
/// When absent, `Resolver` falls back to the built-in round-robin-with-
/// revival-timer policy in [`crate::server::UpstreamRegistry`]. Kept
/// object-safe (no associated types) so it can live behind `Rc<dyn
/// UpstreamSelector>` the way the curve plugin does.
pub trait UpstreamSelector {
    /// Choose an upstream for a fresh request to `name`.
    fn select(&self, name: &str) -> Option<UpstreamElement>;

    /// Choose an upstream for a retransmit, given the element used last
    /// time.
    fn select_retransmit(&self, name: &str, prev: UpstreamElement) -> Option<UpstreamElement>;
}
