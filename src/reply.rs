// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The reply data model (§3 "Reply").

/// A DNS record type, as carried in a question or answer.
///
/// This is the minimal subset of RFC 1035 §3.2.2 the state machine itself
/// inspects (`ANY` is the one type with special handling in §4.6 rule 6);
/// the actual resource-record wire format is the external codec's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RecordType {
    A,
    Aaaa,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Srv,
    /// RFC 1035 §3.2.3: matches a record of any type.
    Any,
    /// An unrecognized or not-yet-modeled type, keeping the numeric value.
    Other(u16),
}

/// Standard DNS response codes, plus the synthetic ones this library adds
/// for conditions that never occur on the wire (§6 "User-visible rcodes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Rcode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    /// Synthetic: the reply had `NOERROR` but no answer of the requested
    /// type (§4.6 rule 6).
    NoRec,
    /// Synthetic: the retransmit budget was exhausted with no reply.
    Timeout,
    /// Synthetic: a send failed for a reason other than `WouldBlock`.
    NetErr,
    /// Synthetic: no upstream was available to serve the request.
    ServFailNoUpstream,
    /// An rcode value not modeled above, keeping the wire value.
    Other(u8),
}

impl Rcode {
    pub(crate) fn from_wire(value: u8) -> Self {
        match value {
            0 => Self::NoError,
            1 => Self::FormErr,
            2 => Self::ServFail,
            3 => Self::NxDomain,
            4 => Self::NotImp,
            5 => Self::Refused,
            other => Self::Other(other),
        }
    }
}

bitflags::bitflags! {
    /// Flags surfaced on a [`Reply`], lifted from the DNS header (§3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReplyFlags: u8 {
        /// The header's AD bit: authenticated data. DNSSEC is surfaced, not
        /// verified (§1 Non-goals).
        const AUTH = 0b01;
        /// The header's TC bit: the reply was truncated and should be
        /// retried over TCP (§4.5).
        const TRUNCATED = 0b10;
    }
}

/// One parsed answer record, as produced by the external [`crate::codec::PacketCodec`].
#[derive(Debug, Clone)]
pub struct ReplyEntry {
    pub name: String,
    pub record_type: RecordType,
    pub ttl: u32,
    /// Opaque record data; interpreting it is the codec's/caller's job.
    pub rdata: Vec<u8>,
}

/// The result delivered to a request's callback.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: Rcode,
    pub flags: ReplyFlags,
    pub entries: Vec<ReplyEntry>,
}

impl Reply {
    pub(crate) fn new(code: Rcode) -> Self {
        Self {
            code,
            flags: ReplyFlags::empty(),
            entries: Vec::new(),
        }
    }
}
