// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The length-prefixed TCP I/O channel (§4.4, §4.5).

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use super::{ChannelHandle, ChannelSocket};

/// Read buffer starts at this size and doubles as frames demand more,
/// capped at [`MAX_READ_BUF`] (§4.4 "growable read buffer").
const INITIAL_READ_BUF: usize = 512;
/// Largest a single reply frame (and thus the read buffer) is allowed to
/// grow to; a frame length prefix beyond this is a protocol violation.
const MAX_READ_BUF: usize = 65536;
/// A frame shorter than a DNS header cannot carry a valid reply; the
/// prefix is rejected outright rather than read as a malformed body.
const MIN_FRAME_LEN: usize = 12;

/// Where the read-assembly state machine currently is (§4.4).
enum ReadState {
    /// Waiting for the 2-byte big-endian length prefix; `have` bytes of it
    /// have arrived so far (0 or 1).
    Prefix { have: usize, buf: [u8; 2] },
    /// Waiting for `len` bytes of frame body; `have` have arrived so far.
    Body { len: usize, have: usize },
}

pub(crate) struct TcpChannelState {
    stream: TcpStream,
    read_state: ReadState,
    read_buf: Vec<u8>,
    /// Outbound frames not yet fully written, each already carrying its
    /// 2-byte length prefix (§4.4 "write queue").
    output_chain: VecDeque<Vec<u8>>,
    /// Bytes of `output_chain`'s front element already written.
    write_progress: usize,
}

impl AsRawFd for TcpChannelState {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Connect a fresh TCP channel to `peer` (§4.5 "reschedule over TCP",
/// §4.9 "freshly constructed channel").
///
/// The connect itself is performed synchronously before the socket is
/// switched to non-blocking mode for all subsequent I/O; unlike the
/// original's `EINPROGRESS`-driven async connect, this trades a small
/// one-time blocking call for not depending on an extra raw-socket crate
/// (see DESIGN.md).
pub(crate) fn new_channel(
    peer: SocketAddr,
    server: crate::server::ServerWeak,
) -> io::Result<ChannelHandle> {
    let stream = TcpStream::connect(peer)?;
    stream.set_nonblocking(true)?;
    let state = TcpChannelState {
        stream,
        read_state: ReadState::Prefix {
            have: 0,
            buf: [0; 2],
        },
        read_buf: Vec::with_capacity(INITIAL_READ_BUF),
        output_chain: VecDeque::new(),
        write_progress: 0,
    };
    let handle = ChannelHandle::new(ChannelSocket::Tcp(state), peer, server);
    // The connect above already completed, unlike the original's
    // `EINPROGRESS`-driven handshake (see the doc comment above).
    handle.0.borrow_mut().connected = true;
    Ok(handle)
}

/// Queue `frame` (the raw DNS packet, without its length prefix) for
/// sending, prefixing it with its big-endian `u16` length (§4.4 "the write
/// queue carries already-framed buffers").
pub(crate) fn enqueue(channel: &ChannelHandle, frame: &[u8]) {
    let mut framed = Vec::with_capacity(frame.len() + 2);
    framed.extend_from_slice(&(frame.len() as u16).to_be_bytes());
    framed.extend_from_slice(frame);
    let mut data = channel.0.borrow_mut();
    if let ChannelSocket::Tcp(tcp) = &mut data.socket {
        tcp.output_chain.push_back(framed);
    }
}

pub(crate) fn has_pending_writes(channel: &ChannelHandle) -> bool {
    let data = channel.0.borrow();
    match &data.socket {
        ChannelSocket::Tcp(tcp) => !tcp.output_chain.is_empty(),
        ChannelSocket::Udp(_) => false,
    }
}

/// Drain as much of the write queue as the socket will currently accept
/// (§4.4 "drain the write queue"). Returns `Ok(true)` once the queue is
/// fully flushed, `Ok(false)` if a `WouldBlock` was hit with data still
/// queued (caller should keep the write event registered).
pub(crate) fn flush(channel: &ChannelHandle) -> io::Result<bool> {
    loop {
        let (front_is_some, chunk) = {
            let data = channel.0.borrow();
            match &data.socket {
                ChannelSocket::Tcp(tcp) => match tcp.output_chain.front() {
                    Some(front) => (true, front[tcp.write_progress..].to_vec()),
                    None => (false, Vec::new()),
                },
                ChannelSocket::Udp(_) => unreachable!("tcp::flush called on a UDP channel"),
            }
        };
        if !front_is_some {
            return Ok(true);
        }
        let write_result = {
            let data = channel.0.borrow();
            match &data.socket {
                ChannelSocket::Tcp(tcp) => tcp.stream.write(&chunk),
                ChannelSocket::Udp(_) => unreachable!(),
            }
        };
        match write_result {
            Ok(0) => return Ok(true),
            Ok(n) => {
                let mut data = channel.0.borrow_mut();
                if let ChannelSocket::Tcp(tcp) = &mut data.socket {
                    tcp.write_progress += n;
                    let front_len = tcp.output_chain.front().map(|f| f.len()).unwrap_or(0);
                    if tcp.write_progress >= front_len {
                        tcp.output_chain.pop_front();
                        tcp.write_progress = 0;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Result of one read-assembly attempt (§4.4 "read path").
pub(crate) enum ReadOutcome {
    /// No complete frame yet; caller should wait for the next readable
    /// event.
    Pending,
    /// One complete frame (length prefix stripped) is ready.
    Frame(Vec<u8>),
    /// The peer closed the connection (`read` returned `0`).
    Eof,
}

/// Pump one readable-event's worth of bytes through the assembly state
/// machine, growing the buffer as frame sizes demand (§4.4
/// `rdns_tcp_maybe_realloc_read_buf`, `rdns_process_tcp_read`).
///
/// Only ever assembles a single frame per call; the caller loops on
/// [`ReadOutcome::Frame`] being returned to drain further frames already
/// buffered from the same `read`.
pub(crate) fn read_frame(channel: &ChannelHandle) -> io::Result<ReadOutcome> {
    let mut data = channel.0.borrow_mut();
    let tcp = match &mut data.socket {
        ChannelSocket::Tcp(tcp) => tcp,
        ChannelSocket::Udp(_) => unreachable!("tcp::read_frame called on a UDP channel"),
    };

    match &mut tcp.read_state {
        ReadState::Prefix { have, buf } => {
            while *have < 2 {
                match tcp.stream.read(&mut buf[*have..2]) {
                    Ok(0) => return Ok(ReadOutcome::Eof),
                    Ok(n) => *have += n,
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        return Ok(ReadOutcome::Pending)
                    }
                    Err(e) => return Err(e),
                }
            }
            let len = u16::from_be_bytes(*buf) as usize;
            if len < MIN_FRAME_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "TCP frame length below DNS header size",
                ));
            }
            if len > MAX_READ_BUF {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "TCP frame length exceeds maximum",
                ));
            }
            if tcp.read_buf.capacity() < len {
                let grown = (tcp.read_buf.capacity().max(INITIAL_READ_BUF) * 2).min(MAX_READ_BUF).max(len);
                tcp.read_buf.reserve(grown - tcp.read_buf.len());
            }
            tcp.read_buf.clear();
            tcp.read_buf.resize(len, 0);
            tcp.read_state = ReadState::Body { len, have: 0 };
            read_body(tcp)
        }
        ReadState::Body { .. } => read_body(tcp),
    }
}

fn read_body(tcp: &mut TcpChannelState) -> io::Result<ReadOutcome> {
    let (len, have) = match tcp.read_state {
        ReadState::Body { len, have } => (len, have),
        ReadState::Prefix { .. } => unreachable!(),
    };
    if len == 0 {
        tcp.read_state = ReadState::Prefix {
            have: 0,
            buf: [0; 2],
        };
        return Ok(ReadOutcome::Frame(Vec::new()));
    }
    let mut have = have;
    loop {
        match tcp.stream.read(&mut tcp.read_buf[have..len]) {
            Ok(0) => return Ok(ReadOutcome::Eof),
            Ok(n) => {
                have += n;
                if have >= len {
                    let frame = std::mem::take(&mut tcp.read_buf);
                    tcp.read_state = ReadState::Prefix {
                        have: 0,
                        buf: [0; 2],
                    };
                    return Ok(ReadOutcome::Frame(frame));
                }
                tcp.read_state = ReadState::Body { len, have };
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                tcp.read_state = ReadState::Body { len, have };
                return Ok(ReadOutcome::Pending);
            }
            Err(e) => return Err(e),
        }
    }
}
