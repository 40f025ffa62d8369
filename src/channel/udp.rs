// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The UDP I/O channel (§4.2).

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use super::{ChannelHandle, ChannelSocket};

/// Maximum size of a single UDP datagram we'll `recv` (§4.2, §8 boundary
/// cases operate within this).
pub const UDP_PACKET_SIZE: usize = 4096;

pub(crate) struct UdpChannelState {
    socket: UdpSocket,
}

impl AsRawFd for UdpChannelState {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// Outcome of a send attempt, mirroring the `>0`/`0`/`-1` three-way split
/// `rdns_send_request` makes on the return of `sendto`/`send` (§4.3's state
/// table keys off exactly this split).
pub(crate) enum SendOutcome {
    Sent,
    WouldBlock,
}

/// Bind a fresh, non-blocking UDP socket to `peer` and wrap it as a new
/// channel (§4.9 "freshly constructed channel", `rdns_ioc_new`).
pub(crate) fn new_channel(
    peer: SocketAddr,
    server: crate::server::ServerWeak,
) -> io::Result<ChannelHandle> {
    let bind_addr: SocketAddr = if peer.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr)?;
    socket.set_nonblocking(true)?;
    Ok(ChannelHandle::new(
        ChannelSocket::Udp(UdpChannelState { socket }),
        peer,
        server,
    ))
}

/// Send `packet` on `channel`, per §4.2 "Send path".
///
/// On the first successful send from an unconnected channel, `connect`s the
/// socket so later sends can use the cheaper `send` path — this is the
/// "transitions to connected-peer after first successful send" rule in §3.
pub(crate) fn send(channel: &ChannelHandle, packet: &[u8]) -> io::Result<SendOutcome> {
    let (result, peer, already_connected) = {
        let data = channel.0.borrow();
        let peer = data.peer_addr;
        let udp = match &data.socket {
            ChannelSocket::Udp(udp) => udp,
            ChannelSocket::Tcp(_) => unreachable!("udp::send called on a TCP channel"),
        };
        let result = if data.connected {
            udp.socket.send(packet)
        } else {
            udp.socket.send_to(packet, peer)
        };
        (result, peer, data.connected)
    };

    match result {
        Ok(_) => {
            if !already_connected {
                let data = channel.0.borrow();
                if let ChannelSocket::Udp(udp) = &data.socket {
                    // Best-effort: a failed connect just means we keep using
                    // send_to on the next send, matching the C original's
                    // tolerance of a failed post-send connect (§4.2).
                    let _ = udp.socket.connect(peer);
                }
                drop(data);
                channel.0.borrow_mut().connected = true;
            }
            Ok(SendOutcome::Sent)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
            Ok(SendOutcome::WouldBlock)
        }
        Err(e) => Err(e),
    }
}

/// Read one datagram off `channel` (§4.2 "Receive path"). Returns `None` if
/// the socket would block (spurious wakeup) or the datagram was too short
/// to plausibly carry a header and a question.
pub(crate) fn recv(channel: &ChannelHandle) -> io::Result<Option<Vec<u8>>> {
    let data = channel.0.borrow();
    let udp = match &data.socket {
        ChannelSocket::Udp(udp) => udp,
        ChannelSocket::Tcp(_) => unreachable!("udp::recv called on a TCP channel"),
    };
    let mut buf = vec![0u8; UDP_PACKET_SIZE];
    match udp.socket.recv(&mut buf) {
        Ok(len) => {
            const MIN_LEN: usize = 12 + 5; // header + minimal question
            if len < MIN_LEN {
                return Ok(None);
            }
            buf.truncate(len);
            Ok(Some(buf))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
