// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::net::AddrParseError;

/// Errors surfaced synchronously from the resolver's construction and
/// configuration API.
///
/// These never touch the request state machine: a request that fails after
/// being accepted is reported to its callback as a [`crate::reply::Rcode`],
/// not through this type.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// Underlying socket operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// `add_server` was given a name that is neither a valid IPv4 nor IPv6
    /// literal.
    #[error("invalid upstream address: {0}")]
    InvalidAddress(#[from] AddrParseError),

    /// `init` was called with no servers registered.
    #[error("no DNS servers configured")]
    NoServers,

    /// `init` was called before `bind_async`.
    #[error("no async driver bound")]
    NoAsyncDriver,

    /// A query name was empty after stripping leading/trailing dots.
    #[error("empty name to resolve")]
    EmptyName,

    /// `add_server` was given a zero UDP channel count.
    #[error("zero IO channel count for server")]
    ZeroChannelCount,

    /// `add_server` was given a zero or out-of-range port.
    #[error("invalid port")]
    InvalidPort,

    /// 32 consecutive transaction IDs collided with in-flight requests on
    /// the same channel.
    #[error("transaction ID space exhausted for this channel")]
    IdSpaceExhausted,

    /// `make_request` was called with no query tuples.
    #[error("at least one (name, type) query is required")]
    NoQueries,

    /// `init` was called twice, or a mutating call was made after `init`
    /// that requires a fresh resolver.
    #[error("resolver already initialized")]
    AlreadyInitialized,
}

/// Convenience alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, ResolverError>;
