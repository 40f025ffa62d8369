// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Pre-registered replies that short-circuit the network entirely (§4.10).

use std::collections::HashMap;

use crate::reply::{RecordType, Reply};

/// Names longer than this are rejected by [`FakeReplyTable::register`]
/// (§4.10 "a name past this length is rejected rather than silently
/// truncated").
pub const MAX_FAKE_NAME: usize = 253;

/// Lowercased name plus record type: the same two-part key
/// `rdns_make_request_full`'s fake-reply lookup hashes on (§4.10).
#[derive(PartialEq, Eq, Hash, Clone)]
struct FakeKey {
    name: String,
    record_type: RecordType,
}

/// A resolver-instance-local table of canned replies, checked before a
/// fresh request is ever sent (§4.10; resolved as per-`Resolver`, not
/// process-global — see DESIGN.md's Open Question decisions).
#[derive(Default)]
pub struct FakeReplyTable {
    entries: HashMap<FakeKey, Reply>,
}

impl FakeReplyTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a canned `reply` for `(name, record_type)`, matched
    /// case-insensitively. If an entry already exists for this key, `reply`'s
    /// entries are appended onto it and its rcode replaces the stored one,
    /// rather than discarding what was registered before. Returns `false`
    /// (and registers nothing) if `name` exceeds [`MAX_FAKE_NAME`].
    pub fn register(&mut self, name: &str, record_type: RecordType, reply: Reply) -> bool {
        if name.len() > MAX_FAKE_NAME {
            return false;
        }
        let key = FakeKey {
            name: name.to_ascii_lowercase(),
            record_type,
        };
        match self.entries.get_mut(&key) {
            Some(existing) => {
                existing.code = reply.code;
                existing.flags = reply.flags;
                existing.entries.extend(reply.entries);
            }
            None => {
                self.entries.insert(key, reply);
            }
        }
        true
    }

    pub fn unregister(&mut self, name: &str, record_type: RecordType) {
        self.entries.remove(&FakeKey {
            name: name.to_ascii_lowercase(),
            record_type,
        });
    }

    /// Look up a canned reply for the first query in a request's query list
    /// (§4.10 "the fake-reply lookup only ever consults the first query").
    pub(crate) fn lookup(&self, name: &str, record_type: RecordType) -> Option<Reply> {
        self.entries
            .get(&FakeKey {
                name: name.to_ascii_lowercase(),
                record_type,
            })
            .cloned()
    }
}
