// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenario tests (§8) and boundary cases, driven over real
//! loopback sockets with [`MockAsyncDriver`] standing in for the event
//! loop. Every test is single-threaded: a "fake upstream" socket owned by
//! the test plays both roles — it sends/receives on its own schedule, and
//! the test fires the resolver's registered callbacks by hand in between.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{TcpListener, UdpSocket};
use std::rc::Rc;
use std::time::Duration;

use crate::channel::tcp;
use crate::codec::PacketCodec;
use crate::config::{ResolverOpts, ServerConfig};
use crate::reply::{Rcode, RecordType, Reply};
use crate::request::RequestTable;
use crate::resolver::Resolver;
use crate::server::ServerHandle;
use crate::tests::mock_codec::{build_reply, MockAnswer, MockCodec};
use crate::tests::mock_driver::MockAsyncDriver;

/// Install a `tracing` subscriber driven by `RUST_LOG`, once per process.
/// Harmless to call more than once since only the first `try_init` wins.
fn subscribe() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn new_resolver() -> (Resolver, Rc<MockAsyncDriver>) {
    let codec = Rc::new(MockCodec);
    let resolver = Resolver::new(codec, ResolverOpts::default());
    let driver = MockAsyncDriver::new();
    resolver.bind_async(driver.clone());
    (resolver, driver)
}

fn capture() -> (Box<dyn FnOnce(Reply)>, Rc<RefCell<Option<Reply>>>) {
    let slot = Rc::new(RefCell::new(None));
    let slot2 = slot.clone();
    (Box::new(move |reply| *slot2.borrow_mut() = Some(reply)), slot)
}

const A_QUERY: &str = "example.com";

fn a_answer() -> MockAnswer {
    MockAnswer {
        name: A_QUERY.to_string(),
        record_type: RecordType::A,
        ttl: 300,
        rdata: vec![93, 184, 216, 34],
    }
}

#[test]
fn e1_basic_udp_round_trip() {
    subscribe();
    let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = upstream.local_addr().unwrap();

    let (resolver, driver) = new_resolver();
    resolver
        .add_server(ServerConfig {
            addr,
            priority: 0,
            udp_channels: 1,
            tcp_channels: 0,
        })
        .unwrap();
    resolver.init().unwrap();

    let (cb, result) = capture();
    resolver
        .make_request(vec![(A_QUERY.to_string(), RecordType::A)], Duration::from_secs(5), 1, cb)
        .unwrap();

    let mut buf = [0u8; 512];
    let (n, peer) = upstream.recv_from(&mut buf).unwrap();
    assert!(n >= 12);
    let id = u16::from_be_bytes([buf[0], buf[1]]);

    let reply_bytes = build_reply(
        id,
        &[(A_QUERY.to_string(), RecordType::A)],
        0,
        false,
        false,
        &[a_answer()],
    );
    upstream.send_to(&reply_bytes, peer).unwrap();

    let fd = resolver.test_udp_channel_fd(0, 0).unwrap();
    let waiter = driver.fire_read_for_fd(fd).unwrap();
    resolver.process_read(waiter);

    let reply = result.borrow_mut().take().expect("reply delivered");
    assert_eq!(reply.code, Rcode::NoError);
    assert_eq!(reply.entries.len(), 1);
    assert_eq!(driver.pending_timer_count(), 0);
}

#[test]
fn e2_truncated_without_tcp_channels_delivers_as_is() {
    subscribe();
    let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = upstream.local_addr().unwrap();

    let (resolver, driver) = new_resolver();
    resolver
        .add_server(ServerConfig {
            addr,
            priority: 0,
            udp_channels: 1,
            tcp_channels: 0,
        })
        .unwrap();
    resolver.init().unwrap();

    let (cb, result) = capture();
    resolver
        .make_request(vec![(A_QUERY.to_string(), RecordType::A)], Duration::from_secs(5), 1, cb)
        .unwrap();

    let mut buf = [0u8; 512];
    let (_, peer) = upstream.recv_from(&mut buf).unwrap();
    let id = u16::from_be_bytes([buf[0], buf[1]]);

    let reply_bytes = build_reply(
        id,
        &[(A_QUERY.to_string(), RecordType::A)],
        0,
        true,
        false,
        &[a_answer()],
    );
    upstream.send_to(&reply_bytes, peer).unwrap();

    let fd = resolver.test_udp_channel_fd(0, 0).unwrap();
    let waiter = driver.fire_read_for_fd(fd).unwrap();
    resolver.process_read(waiter);

    let reply = result.borrow_mut().take().expect("reply delivered despite truncation");
    assert!(reply.flags.contains(crate::reply::ReplyFlags::TRUNCATED));
    assert_eq!(driver.pending_timer_count(), 0);
}

#[test]
fn e3_truncated_reschedules_over_tcp() {
    subscribe();
    let upstream_udp = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = upstream_udp.local_addr().unwrap();
    let tcp_listener = TcpListener::bind(addr).unwrap();

    let (resolver, driver) = new_resolver();
    resolver
        .add_server(ServerConfig {
            addr,
            priority: 0,
            udp_channels: 1,
            tcp_channels: 1,
        })
        .unwrap();
    resolver.init().unwrap();

    let (cb, result) = capture();
    resolver
        .make_request(vec![(A_QUERY.to_string(), RecordType::A)], Duration::from_secs(5), 1, cb)
        .unwrap();

    let mut buf = [0u8; 512];
    let (_, peer) = upstream_udp.recv_from(&mut buf).unwrap();
    let id = u16::from_be_bytes([buf[0], buf[1]]);

    let truncated = build_reply(id, &[(A_QUERY.to_string(), RecordType::A)], 0, true, false, &[]);
    upstream_udp.send_to(&truncated, peer).unwrap();

    let udp_fd = resolver.test_udp_channel_fd(0, 0).unwrap();
    let waiter = driver.fire_read_for_fd(udp_fd).unwrap();
    resolver.process_read(waiter);

    assert!(result.borrow().is_none(), "truncated reply must not be delivered yet");
    assert_eq!(resolver.test_tcp_channel_count(0), 1, "TCP channel created lazily on reschedule");

    let (mut stream, _) = tcp_listener.accept().unwrap();

    let tcp_fd = resolver.test_tcp_channel_fd(0, 0).unwrap();
    let write_waiter = driver.take_write_for_fd(tcp_fd).expect("write registered to flush the TCP query");
    resolver.process_write(write_waiter);

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).unwrap();
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut query = vec![0u8; len];
    stream.read_exact(&mut query).unwrap();
    assert_eq!(u16::from_be_bytes([query[0], query[1]]), id);

    let reply_bytes = build_reply(
        id,
        &[(A_QUERY.to_string(), RecordType::A)],
        0,
        false,
        false,
        &[a_answer()],
    );
    let mut framed = (reply_bytes.len() as u16).to_be_bytes().to_vec();
    framed.extend_from_slice(&reply_bytes);
    stream.write_all(&framed).unwrap();

    let read_waiter = driver.fire_read_for_fd(tcp_fd).unwrap();
    resolver.process_read(read_waiter);

    let reply = result.borrow_mut().take().expect("reply delivered over TCP");
    assert_eq!(reply.code, Rcode::NoError);
    assert_eq!(reply.entries.len(), 1);
}

#[test]
fn e4_retransmit_then_timeout() {
    subscribe();
    let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = upstream.local_addr().unwrap();

    let (resolver, driver) = new_resolver();
    resolver
        .add_server(ServerConfig {
            addr,
            priority: 0,
            udp_channels: 1,
            tcp_channels: 0,
        })
        .unwrap();
    resolver.init().unwrap();

    let (cb, result) = capture();
    resolver
        .make_request(vec![(A_QUERY.to_string(), RecordType::A)], Duration::from_millis(50), 2, cb)
        .unwrap();

    let mut buf = [0u8; 512];
    upstream.recv_from(&mut buf).unwrap(); // initial send

    let (_, first_waiter) = driver.any_timer().expect("timer armed after initial send");
    resolver.process_timer(first_waiter);
    upstream.recv_from(&mut buf).unwrap(); // one retransmit
    assert!(result.borrow().is_none());

    let (_, second_waiter) = driver.any_timer().expect("timer still armed after retransmit");
    resolver.process_timer(second_waiter);

    let reply = result.borrow_mut().take().expect("timeout delivered");
    assert_eq!(reply.code, Rcode::Timeout);
    assert_eq!(driver.pending_timer_count(), 0);
}

#[test]
fn e5_failed_first_upstream_rotates_to_second() {
    subscribe();
    // Sending to 0.0.0.0 is rejected synchronously (EINVAL) rather than
    // silently queued, which is what makes this upstream a reliable stand-in
    // for "first send returns -1" without needing OS-level fault injection.
    let bad_addr: std::net::SocketAddr = "0.0.0.0:53".parse().unwrap();
    let good_upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
    let good_addr = good_upstream.local_addr().unwrap();

    let (resolver, driver) = new_resolver();
    resolver
        .add_server(ServerConfig {
            addr: bad_addr,
            priority: 0,
            udp_channels: 1,
            tcp_channels: 0,
        })
        .unwrap();
    resolver
        .add_server(ServerConfig {
            addr: good_addr,
            priority: 0,
            udp_channels: 1,
            tcp_channels: 0,
        })
        .unwrap();
    resolver.init().unwrap();

    let (cb, result) = capture();
    resolver
        .make_request(vec![(A_QUERY.to_string(), RecordType::A)], Duration::from_secs(5), 1, cb)
        .unwrap();

    let mut buf = [0u8; 512];
    let (_, peer) = good_upstream.recv_from(&mut buf).unwrap();
    let id = u16::from_be_bytes([buf[0], buf[1]]);

    let reply_bytes = build_reply(
        id,
        &[(A_QUERY.to_string(), RecordType::A)],
        0,
        false,
        false,
        &[a_answer()],
    );
    good_upstream.send_to(&reply_bytes, peer).unwrap();

    let fd = resolver.test_udp_channel_fd(1, 0).unwrap();
    let waiter = driver.fire_read_for_fd(fd).unwrap();
    resolver.process_read(waiter);

    let reply = result.borrow_mut().take().expect("reply delivered from the second upstream");
    assert_eq!(reply.code, Rcode::NoError);
}

#[test]
fn e6_fake_reply_short_circuits_without_any_network_io() {
    subscribe();
    let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = upstream.local_addr().unwrap();

    let (resolver, driver) = new_resolver();
    resolver
        .add_server(ServerConfig {
            addr,
            priority: 0,
            udp_channels: 1,
            tcp_channels: 0,
        })
        .unwrap();

    let mut fake = Reply::new(Rcode::NoError);
    fake.entries.push(crate::reply::ReplyEntry {
        name: "fake.internal".to_string(),
        record_type: RecordType::A,
        ttl: 60,
        rdata: vec![127, 0, 0, 1],
    });
    assert!(resolver.set_fake_reply("fake.internal", RecordType::A, fake));

    resolver.init().unwrap();

    let (cb, result) = capture();
    resolver
        .make_request(
            vec![("fake.internal".to_string(), RecordType::A)],
            Duration::from_secs(5),
            1,
            cb,
        )
        .unwrap();

    // No datagram should have been sent at all.
    upstream.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 512];
    assert!(upstream.recv_from(&mut buf).is_err(), "fake reply must bypass the network");

    let (_, waiter) = driver.any_timer().expect("fake reply delivered via a deferred zero-duration timer");
    resolver.process_timer(waiter);

    let reply = result.borrow_mut().take().expect("fake reply delivered");
    assert_eq!(reply.entries.len(), 1);
    assert_eq!(reply.entries[0].rdata, vec![127, 0, 0, 1]);
}

#[test]
fn boundary_noerror_zero_answers_rewrites_to_norec() {
    subscribe();
    let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = upstream.local_addr().unwrap();

    let (resolver, driver) = new_resolver();
    resolver
        .add_server(ServerConfig {
            addr,
            priority: 0,
            udp_channels: 1,
            tcp_channels: 0,
        })
        .unwrap();
    resolver.init().unwrap();

    let (cb, result) = capture();
    resolver
        .make_request(vec![(A_QUERY.to_string(), RecordType::A)], Duration::from_secs(5), 1, cb)
        .unwrap();

    let mut buf = [0u8; 512];
    let (_, peer) = upstream.recv_from(&mut buf).unwrap();
    let id = u16::from_be_bytes([buf[0], buf[1]]);

    let reply_bytes = build_reply(id, &[(A_QUERY.to_string(), RecordType::A)], 0, false, false, &[]);
    upstream.send_to(&reply_bytes, peer).unwrap();

    let fd = resolver.test_udp_channel_fd(0, 0).unwrap();
    let waiter = driver.fire_read_for_fd(fd).unwrap();
    resolver.process_read(waiter);

    let reply = result.borrow_mut().take().expect("reply delivered");
    assert_eq!(reply.code, Rcode::NoRec);
    assert!(reply.entries.is_empty());
}

#[test]
fn boundary_retransmit_budget_of_one_fails_without_a_resend() {
    subscribe();
    let upstream = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = upstream.local_addr().unwrap();

    let (resolver, driver) = new_resolver();
    resolver
        .add_server(ServerConfig {
            addr,
            priority: 0,
            udp_channels: 1,
            tcp_channels: 0,
        })
        .unwrap();
    resolver.init().unwrap();

    let (cb, result) = capture();
    resolver
        .make_request(vec![(A_QUERY.to_string(), RecordType::A)], Duration::from_millis(20), 1, cb)
        .unwrap();

    let mut buf = [0u8; 512];
    upstream.recv_from(&mut buf).unwrap();

    let (_, waiter) = driver.any_timer().expect("timer armed");
    resolver.process_timer(waiter);

    let reply = result.borrow_mut().take().expect("timeout delivered on the very first timer fire");
    assert_eq!(reply.code, Rcode::Timeout);

    // No second datagram should ever have been sent.
    upstream.set_nonblocking(true).unwrap();
    assert!(upstream.recv_from(&mut buf).is_err());
}

#[test]
fn boundary_tcp_frame_assembles_across_single_byte_reads() {
    subscribe();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ServerHandle::new("test".to_string(), addr.ip(), addr.port(), 0, 1);
    let channel = tcp::new_channel(addr, server.downgrade()).unwrap();
    let (mut stream, _) = listener.accept().unwrap();

    let payload = vec![0xABu8; 5];
    let len_bytes = (payload.len() as u16).to_be_bytes();

    stream.write_all(&len_bytes[0..1]).unwrap();
    assert!(matches!(tcp::read_frame(&channel), Ok(tcp::ReadOutcome::Pending)));

    stream.write_all(&len_bytes[1..2]).unwrap();
    stream.write_all(&payload[0..1]).unwrap();
    assert!(matches!(tcp::read_frame(&channel), Ok(tcp::ReadOutcome::Pending)));

    stream.write_all(&payload[1..]).unwrap();
    match tcp::read_frame(&channel) {
        Ok(tcp::ReadOutcome::Frame(bytes)) => assert_eq!(bytes, payload),
        other => panic!("expected a complete frame, got {}", matches_label(&other)),
    }
}

fn matches_label(outcome: &std::io::Result<tcp::ReadOutcome>) -> &'static str {
    match outcome {
        Ok(tcp::ReadOutcome::Pending) => "Pending",
        Ok(tcp::ReadOutcome::Frame(_)) => "Frame",
        Ok(tcp::ReadOutcome::Eof) => "Eof",
        Err(_) => "Err",
    }
}

#[test]
fn boundary_id_space_exhaustion_after_max_collisions() {
    subscribe();
    let codec = MockCodec;
    let mut table = RequestTable::new();
    for id in 0u32..=65535u32 {
        let req = crate::request::RequestHandle::new(id as u16, Vec::new(), Vec::new(), 0, Duration::ZERO, Box::new(|_| {}));
        table.insert(&req, &codec).unwrap();
    }
    let overflow = crate::request::RequestHandle::new(0, Vec::new(), Vec::new(), 0, Duration::ZERO, Box::new(|_| {}));
    let err = table.insert(&overflow, &codec).unwrap_err();
    assert!(matches!(err, crate::error::ResolverError::IdSpaceExhausted));
}
