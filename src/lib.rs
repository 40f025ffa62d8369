// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

// LIBRARY WARNINGS
#![warn(
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::unimplemented,
    missing_docs,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    unreachable_pub
)]

//! An asynchronous stub DNS resolver client library.
//!
//! Given one or more upstream recursive servers, this crate issues
//! queries, retransmits on timeout, falls back from UDP to TCP on
//! truncation, and delivers parsed replies to user callbacks. It does not
//! own an event loop: the embedder drives it by implementing
//! [`runtime::AsyncDriver`] and forwarding readiness/timer events to
//! [`resolver::Resolver::process_read`], [`resolver::Resolver::process_write`],
//! and [`resolver::Resolver::process_timer`].
//!
//! Wire-format encoding/decoding, encrypted transport, and upstream health
//! policy are all external collaborators (see [`codec`], [`plugin`]) rather
//! than built into this crate — see each module's documentation for the
//! contract it expects.

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod fake;
pub mod plugin;
pub mod reply;
pub mod request;
pub mod resolver;
pub mod runtime;
pub mod server;

#[cfg(any(test, feature = "testing"))]
pub mod tests;

pub use error::{ResolverError, Result};
pub use resolver::Resolver;
