// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Embedder-facing configuration, filled in before [`crate::resolver::Resolver::init`]
//! (ambient stack addition; mirrors the `name_server`/`timeout`/`bind_addr`
//! builder fields on hickory-proto's `UdpClientStream`).

use std::net::SocketAddr;
use std::time::Duration;

/// Per-server settings passed to `Resolver::add_server` (§6).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub priority: u8,
    pub udp_channels: u16,
    pub tcp_channels: u16,
}

/// Resolver-wide tunables (§4.9, §1 "Configuration").
#[derive(Debug, Clone)]
pub struct ResolverOpts {
    /// Per-channel use cap before recycling; `0` disables the sweep
    /// entirely (§4.9).
    pub max_ioc_uses: u64,
    /// How often the maintenance sweep (channel recycling, TCP idle reset)
    /// runs. `None` if `max_ioc_uses` is `0` and no TCP channels are
    /// ever configured, though `Resolver::init` still arms a default
    /// period if TCP channels exist, since TCP recycling (§4.4 "Recycle")
    /// does not depend on `max_ioc_uses`.
    pub ioc_check_period: Option<Duration>,
    /// Sets the EDNS DO bit on outgoing queries (§6 `set_dnssec`).
    pub dnssec: bool,
}

impl Default for ResolverOpts {
    fn default() -> Self {
        Self {
            max_ioc_uses: 0,
            ioc_check_period: Some(Duration::from_secs(60)),
            dnssec: false,
        }
    }
}

/// Top-level resolver configuration (§1 "Configuration").
#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    pub opts: ResolverOpts,
}
