// Copyright 2024 The Pppp Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end exercise of the session layer and file-transfer pipeline over
//! real loopback UDP sockets, standing in for spec.md §8's S1 (handshake
//! success), S2 (handshake timeout) and S3 (rate-limited upload) scenarios
//! and invariants 3/4.
//!
//! `Session::connect_lan` always dials the fixed `LAN_PORT`, so every test's
//! simulated peer must bind that exact port. `PORT_LOCK` serialises the
//! tests in this file so two of them never race to bind it at once — that
//! would be a test-harness flake, not a property of the code under test.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pppp_core::file_transfer::{send_file, FileUploadInfo};
use pppp_core::protocol::{Codec, DefaultCodec, Duid, FrameType, Packet, LAN_PORT};
use pppp_core::session::{ConnState, Session};

static PORT_LOCK: Mutex<()> = Mutex::new(());

fn peer_socket() -> UdpSocket {
	let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, LAN_PORT)))
		.expect("bind simulated peer on LAN_PORT");
	socket.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
	socket
}

#[test]
fn handshake_then_rate_limited_upload_end_to_end() {
	let _ = env_logger::try_init();
	let _guard = PORT_LOCK.lock().unwrap();

	let peer = peer_socket();
	let peer_codec = DefaultCodec::new();
	let peer_thread = thread::spawn(move || {
		let mut buf = [0u8; 65536];
		let mut client_addr = None;

		// Handshake: wait for LanSearch (resent periodically by the client
		// until acked), then ack it and complete.
		loop {
			match peer.recv_from(&mut buf) {
				Ok((n, from)) => {
					client_addr = Some(from);
					if let Ok(Packet::LanSearch) = peer_codec.decode(&buf[..n]) {
						break;
					}
				}
				Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
					continue;
				}
				Err(e) => panic!("recv LanSearch failed: {e}"),
			}
		}
		let client_addr = client_addr.unwrap();
		peer.send_to(&peer_codec.encode(&Packet::LanSearchAck).unwrap(), client_addr)
			.unwrap();
		peer.send_to(&peer_codec.encode(&Packet::HandshakeComplete).unwrap(), client_addr)
			.unwrap();

		// Collect every Aabb frame until END.
		let mut frames = Vec::new();
		loop {
			match peer.recv_from(&mut buf) {
				Ok((n, _)) => match peer_codec.decode(&buf[..n]) {
					Ok(pkt @ Packet::Aabb { frame_type, .. }) => {
						let is_end = frame_type == FrameType::End;
						frames.push(pkt);
						if is_end {
							break;
						}
					}
					Ok(Packet::JsonCmd { .. }) => {}
					Ok(other) => panic!("unexpected packet during transfer: {other:?}"),
					Err(e) => panic!("decode error: {e}"),
				},
				Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
					continue;
				}
				Err(e) => panic!("recv transfer frame failed: {e}"),
			}
		}
		frames
	});

	let duid = Duid::from_string("ABCDEFGH123456789012").unwrap();
	let session = Session::new(Ipv4Addr::LOCALHOST, duid, Arc::new(DefaultCodec::new()), None).unwrap();

	let deadline = Instant::now() + Duration::from_secs(5);
	session.connect_lan(deadline).expect("handshake should succeed");
	assert_eq!(session.state(), ConnState::Connected);

	// S3: 100 KiB of random bytes at 1 Mbps should take noticeably longer
	// than an un-throttled send (bounded-but-real wall clock, not simulated
	// time).
	use rand::RngCore;
	let mut data = vec![0u8; 100 * 1024];
	rand::thread_rng().fill_bytes(&mut data);
	let fui = FileUploadInfo::from_data("firmware.bin", &data, "tester", "u1", "m1");
	assert_eq!(fui.size, data.len() as u64);

	let start = Instant::now();
	send_file(&session, &fui, data.clone(), 1).expect("transfer should succeed");
	let elapsed = start.elapsed();
	assert!(
		elapsed >= Duration::from_millis(700),
		"a 1 Mbps cap over 100 KiB should take close to 0.8s, took {elapsed:?}"
	);

	let frames = peer_thread.join().expect("peer thread panicked");

	let mut begins = 0;
	let mut ends = 0;
	let mut data_frames = Vec::new();
	for frame in &frames {
		if let Packet::Aabb { frame_type, position, payload, .. } = frame {
			match frame_type {
				FrameType::Begin => begins += 1,
				FrameType::End => ends += 1,
				FrameType::Data => data_frames.push((*position, payload.len())),
			}
		}
	}

	assert_eq!(begins, 1, "exactly one BEGIN frame");
	assert_eq!(ends, 1, "exactly one END frame");

	let expected_frames = data.len().div_ceil(32 * 1024);
	assert_eq!(data_frames.len(), expected_frames);

	let total_bytes: usize = data_frames.iter().map(|(_, len)| *len).sum();
	assert_eq!(total_bytes, data.len(), "DATA byte sum must equal the original length");

	let positions: Vec<u32> = data_frames.iter().map(|(pos, _)| *pos).collect();
	let expected_positions: Vec<u32> = (0..expected_frames as u32).map(|i| i * 32 * 1024).collect();
	assert_eq!(positions, expected_positions, "DATA offsets must be 0, 32768, 65536, ...");
}

#[test]
fn handshake_times_out_when_peer_is_silent() {
	let _ = env_logger::try_init();
	let _guard = PORT_LOCK.lock().unwrap();

	// A decoy peer socket so the LAN-search probe has somewhere to land
	// without anyone ever replying (S2's silent peer).
	let decoy = peer_socket();
	let stop = Arc::new(AtomicBool::new(false));
	let decoy_stop = stop.clone();
	let decoy_thread = thread::spawn(move || {
		let mut buf = [0u8; 4096];
		while !decoy_stop.load(Ordering::Relaxed) {
			let _ = decoy.recv_from(&mut buf);
		}
	});

	let duid = Duid::from_string("ABCDEFGH123456789012").unwrap();
	let session = Session::new(Ipv4Addr::LOCALHOST, duid, Arc::new(DefaultCodec::new()), None).unwrap();
	let deadline = Instant::now() + Duration::from_millis(800);
	let err = session.connect_lan(deadline).unwrap_err();
	assert!(matches!(err, pppp_core::Error::Timeout(_)));
	assert_eq!(session.state(), ConnState::Closing);

	stop.store(true, Ordering::Relaxed);
	decoy_thread.join().unwrap();
}
