// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The wire-format collaborator.
//!
//! Encoding/decoding of DNS names, resource records, EDNS, and name
//! compression is explicitly out of scope for this crate (§1). What the
//! request lifecycle needs from that machinery is a small, stable contract;
//! this module is that contract, not an implementation of it. Production
//! embedders plug in a real codec (e.g. a `hickory-proto`-style `Message`
//! encoder); the `testing` feature ships [`crate::tests::mock_codec::MockCodec`],
//! a deliberately minimal stand-in used only by this crate's own scenario
//! tests.

use crate::reply::RecordType;

/// Result of comparing one question in a reply against the corresponding
/// requested name, per §4.6 rule 3.
pub enum QuestionMatch {
    /// The question matched; advance past it by this many bytes.
    Matched(usize),
    /// The question did not match what was requested.
    Mismatch,
}

/// Result of parsing one answer-section resource record, per §4.6 rule 5.
pub enum ParsedRecord {
    /// The record was parsed and should be appended to the reply. Carries
    /// the parsed entry and the number of bytes consumed.
    Matched(crate::reply::ReplyEntry, usize),
    /// The record parsed but isn't of interest (`no match` in §4.6): skip
    /// it, but keep walking with the given byte count consumed.
    Skipped(usize),
    /// The buffer ended mid-record; stop parsing the remaining answers
    /// without treating it as an error (`incomplete` in §4.6).
    Incomplete,
}

/// The external wire-format collaborator (§1, §4.6).
///
/// An implementation owns all knowledge of the DNS wire format: name
/// compression, record parsing, and EDNS option construction. The request
/// state machine only ever calls through this trait; it never inspects
/// message bytes itself beyond the fixed 12-byte header and the 2-byte
/// transaction ID prefix (§4.1, §4.4), both of which stay outside the
/// codec's remit.
pub trait PacketCodec {
    /// Build the DNS wire packet for an outgoing query: header, one
    /// question per `(name, type)` pair (name-compressed when there is more
    /// than one), and an EDNS OPT record with the DO bit set iff `dnssec`.
    /// The returned buffer's first two bytes are the transaction ID.
    fn encode_query(&self, id: u16, queries: &[(String, RecordType)], dnssec: bool) -> Vec<u8>;

    /// Rewrite the transaction ID in an already-encoded packet, in place,
    /// without touching anything else. Used when ID regeneration happens
    /// after the packet was built (§4.1, §4.5).
    fn rewrite_id(&self, packet: &mut [u8], id: u16);

    /// Compare one question, found at `pos` in `reply`, against
    /// `requested[index]`. Returns the byte offset to resume parsing at on
    /// a match.
    fn compare_question(
        &self,
        reply: &[u8],
        pos: usize,
        requested: &[(String, RecordType)],
        index: usize,
    ) -> QuestionMatch;

    /// Parse one answer-section record at `pos` in `reply`.
    fn parse_record(&self, reply: &[u8], pos: usize) -> ParsedRecord;
}
