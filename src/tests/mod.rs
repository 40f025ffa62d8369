// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Test tooling, gated behind `cfg(test)` or the `testing` feature so other
//! crates can reuse the mock driver/codec in their own integration tests
//! (the same shape as hickory-proto's `#[cfg(test)] tests` modules, lifted
//! to a real feature since this crate has no owned event loop to test
//! against without one).

pub mod mock_driver;

#[cfg(test)]
mod scenarios;
