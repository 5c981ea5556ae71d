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

//! The P2P session (component B): a UDP socket, handshake state machine,
//! multiplexed logical channels, and framed send/recv. Modelled on the
//! teacher's `p2p::conn::listen`/`poll` reader-writer thread pair, adapted
//! from a connection-oriented TCP stream to a connectionless UDP socket
//! that still needs exactly one peer and one handshake.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::protocol::{ChannelId, Codec, Direction, Duid, FrameType, P2PCmdType, Packet, PacketWriter};

/// Size of the bounded queue feeding the writer thread. Generous enough to
/// absorb a burst of control-channel commands without the caller blocking;
/// file-transfer chunks are rate-limited by the caller before they ever
/// reach `send_bulk`, so they never fill this up in practice.
const OUTBOUND_QUEUE_CAP: usize = 64;
/// Depth of the decoded-packet queue `recv()` drains.
const INBOUND_QUEUE_CAP: usize = 256;
/// Socket read timeout used by the reader thread between stop-flag checks.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How many times `Session::new` retries a bind that failed with
/// `AddrInUse`.
const BIND_RETRIES: u32 = 3;
const BIND_RETRY_WAIT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
	Idle,
	LanSearching,
	Connecting,
	Connected,
	Closing,
	Stopped,
}

/// An exclusive-use handoff token for one bulk (file) transfer on a single
/// channel, per §5's serialisation requirement. Held by the caller across
/// BEGIN/DATA.../END; dropping it (including on an early error return)
/// releases the channel for the next transfer.
pub struct BulkToken<'a> {
	_guard: MutexGuard<'a, ()>,
	pub channel: ChannelId,
}

pub struct Session {
	socket: Arc<UdpSocket>,
	peer_addr: SocketAddr,
	duid: Duid,
	codec: Arc<dyn Codec>,
	state: RwLock<ConnState>,
	channels: Vec<Channel>,
	stopping: Arc<AtomicBool>,
	dumper: Option<Arc<Mutex<PacketWriter>>>,
	outbound_tx: Sender<Vec<u8>>,
	inbound_rx: Receiver<Packet>,
	reader_thread: Option<JoinHandle<()>>,
	writer_thread: Option<JoinHandle<()>>,
}

fn bind_socket() -> Result<UdpSocket> {
	use socket2::{Domain, Protocol, Socket, Type};

	for attempt in 0..BIND_RETRIES {
		let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
		socket.set_reuse_address(false)?;
		#[cfg(unix)]
		{
			let _ = socket.set_reuse_port(false);
		}
		#[cfg(not(target_os = "windows"))]
		{
			socket.set_linger(Some(Duration::from_secs(0)))?;
		}
		let addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into();
		match socket.bind(&addr.into()) {
			Ok(()) => return Ok(socket.into()),
			Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt + 1 < BIND_RETRIES => {
				log::warn!("bind attempt {} failed with AddrInUse, retrying", attempt + 1);
				thread::sleep(BIND_RETRY_WAIT);
			}
			Err(e) => return Err(e.into()),
		}
	}
	// Every loop iteration above returns: the last attempt's `AddrInUse` guard
	// is false (attempt + 1 == BIND_RETRIES), so it falls into the `Err(e) =>
	// return` arm instead of looping again.
	unreachable!("bind_socket: last attempt does not retry")
}

impl Session {
	/// Binds a fresh UDP socket, sets the socket options required by the
	/// design (`SO_REUSEADDR=0`, `SO_REUSEPORT=0`, `SO_LINGER={1,0}` on
	/// non-Windows), and spins up the reader/writer threads. The session
	/// starts in `Idle`; call `connect_lan` to perform the handshake.
	pub fn new(
		peer_ip: Ipv4Addr,
		duid: Duid,
		codec: Arc<dyn Codec>,
		dumper: Option<PacketWriter>,
	) -> Result<Self> {
		let socket = bind_socket()?;
		socket.set_read_timeout(Some(SOCKET_POLL_INTERVAL))?;
		let peer_addr = SocketAddr::V4(SocketAddrV4::new(peer_ip, crate::protocol::LAN_PORT));

		let socket = Arc::new(socket);
		let dumper = dumper.map(|d| Arc::new(Mutex::new(d)));
		let stopping = Arc::new(AtomicBool::new(false));

		let (outbound_tx, outbound_rx) = bounded::<Vec<u8>>(OUTBOUND_QUEUE_CAP);
		let (inbound_tx, inbound_rx) = bounded::<Packet>(INBOUND_QUEUE_CAP);

		let channels = (0..ChannelId::MAX_CHANNELS)
			.map(|i| Channel::new(ChannelId(i)))
			.collect();

		let writer_thread = spawn_writer(socket.clone(), peer_addr, outbound_rx, stopping.clone(), dumper.clone());
		let reader_thread = spawn_reader(
			socket.clone(),
			codec.clone(),
			inbound_tx,
			stopping.clone(),
			dumper.clone(),
		);

		Ok(Self {
			socket,
			peer_addr,
			duid,
			codec,
			state: RwLock::new(ConnState::Idle),
			channels,
			stopping,
			dumper,
			outbound_tx,
			inbound_rx,
			reader_thread: Some(reader_thread),
			writer_thread: Some(writer_thread),
		})
	}

	pub fn state(&self) -> ConnState {
		*self.state.read()
	}

	pub fn duid(&self) -> Duid {
		self.duid
	}

	pub fn peer_addr(&self) -> SocketAddr {
		self.peer_addr
	}

	pub fn stopped(&self) -> bool {
		self.state() == ConnState::Stopped
	}

	fn set_state(&self, s: ConnState) {
		*self.state.write() = s;
	}

	/// Performs the LAN handshake: binds (already done in `new`), probes,
	/// and waits for the peer to complete the handshake before `deadline`.
	pub fn connect_lan(&self, deadline: Instant) -> Result<()> {
		self.set_state(ConnState::LanSearching);
		self.send(Packet::LanSearch)?;

		let mut last_probe = Instant::now();
		loop {
			if Instant::now() >= deadline {
				self.set_state(ConnState::Closing);
				return Err(Error::Timeout("connect_lan deadline elapsed".into()));
			}
			let remaining = deadline.saturating_duration_since(Instant::now());
			let slice = remaining.min(Duration::from_millis(500));

			match self.recv(slice)? {
				Some(Packet::ConnectReject) => {
					self.set_state(ConnState::Closing);
					return Err(Error::ConnectionRefused("peer rejected handshake".into()));
				}
				Some(packet) => {
					self.process(&packet)?;
					if self.state() == ConnState::Connected {
						return Ok(());
					}
				}
				None => {
					// Resend the probe periodically while we wait; lost
					// UDP datagrams are otherwise fatal during handshake.
					if self.state() == ConnState::LanSearching && last_probe.elapsed() > Duration::from_secs(1) {
						self.send(Packet::LanSearch)?;
						last_probe = Instant::now();
					}
				}
			}
		}
	}

	/// Sends a single packet. Non-blocking in practice: this just enqueues
	/// the encoded bytes for the writer thread.
	pub fn send(&self, packet: Packet) -> Result<()> {
		let bytes = self.codec.encode(&packet)?;
		if let Some(dumper) = &self.dumper {
			let _ = dumper.lock().record(Direction::Tx, &bytes);
		}
		self.outbound_tx
			.send(bytes)
			.map_err(|_| Error::ConnectionReset("writer thread gone".into()))
	}

	/// Encodes a command packet carrying a JSON or binary payload on the
	/// given channel (normally channel 0, the control channel).
	pub fn send_framed(&self, payload: &[u8], channel: ChannelId, command: P2PCmdType) -> Result<()> {
		self.send(Packet::JsonCmd {
			channel,
			command,
			payload: payload.to_vec(),
		})
	}

	/// Acquires the exclusive bulk-transfer token for `channel`, blocking
	/// until any other in-flight transfer on that channel releases it.
	pub fn acquire_bulk_token(&self, channel: ChannelId) -> BulkToken<'_> {
		let guard = self.channels[channel.0 as usize].lock_bulk();
		BulkToken {
			_guard: guard,
			channel,
		}
	}

	/// Sends one frame of a bulk (file) transfer. The caller must hold the
	/// `BulkToken` for `channel` for the whole BEGIN/DATA*/END sequence so
	/// frames from concurrent transfers cannot interleave.
	pub fn send_bulk(
		&self,
		token: &BulkToken<'_>,
		frame_type: FrameType,
		position: u32,
		payload: &[u8],
	) -> Result<()> {
		debug_assert_eq!(token.channel, ChannelId::CONTROL, "bulk transfers run on the control channel");
		self.channels[token.channel.0 as usize].next_seq();
		self.send(Packet::Aabb {
			channel: token.channel,
			frame_type,
			position,
			payload: payload.to_vec(),
		})
	}

	/// Returns the next decoded inbound packet, or `None` on a benign
	/// timeout. Never raises on a timeout.
	pub fn recv(&self, timeout: Duration) -> Result<Option<Packet>> {
		match self.inbound_rx.recv_timeout(timeout) {
			Ok(packet) => Ok(Some(packet)),
			Err(RecvTimeoutError::Timeout) => Ok(None),
			Err(RecvTimeoutError::Disconnected) => {
				self.set_state(ConnState::Closing);
				Err(Error::ConnectionReset("reader thread exited".into()))
			}
		}
	}

	/// Side-effect-only dispatch: updates channel buffers and session
	/// state. Must not block.
	pub fn process(&self, packet: &Packet) -> Result<()> {
		match packet {
			Packet::LanSearchAck => {
				if self.state() == ConnState::LanSearching {
					self.set_state(ConnState::Connecting);
				}
			}
			Packet::HandshakeComplete => {
				if matches!(self.state(), ConnState::Connecting | ConnState::LanSearching) {
					self.set_state(ConnState::Connected);
				}
			}
			Packet::Close => {
				self.set_state(ConnState::Closing);
			}
			Packet::Xzyh { channel, payload } | Packet::Aabb { channel, payload, .. } => {
				if let Some(chan) = self.channels.get(channel.0 as usize) {
					chan.push_inbound(payload.clone());
				}
			}
			Packet::JsonCmd { channel, payload, .. } => {
				if let Some(chan) = self.channels.get(channel.0 as usize) {
					chan.push_inbound(payload.clone());
				}
			}
			Packet::LanSearch | Packet::ConnectReject => {}
		}
		Ok(())
	}

	/// Deterministic, idempotent teardown of the transport: best-effort
	/// close packet, stop the reader/writer threads, close every channel's
	/// buffers, apply `SO_LINGER` + `shutdown`, then mark the session
	/// Stopped. Safe to call more than once.
	pub fn close(&mut self) {
		if self.stopped() {
			return;
		}
		if self.state() != ConnState::Closing {
			let _ = self.send(Packet::Close);
		}
		self.set_state(ConnState::Closing);

		self.stopping.store(true, Ordering::Relaxed);
		if let Some(t) = self.reader_thread.take() {
			let _ = t.join();
		}
		if let Some(t) = self.writer_thread.take() {
			let _ = t.join();
		}

		for chan in &self.channels {
			chan.close();
		}

		#[cfg(not(target_os = "windows"))]
		{
			if let Err(e) = set_linger_abort(&self.socket) {
				log::warn!("failed to set SO_LINGER before close: {e}");
			}
		}
		if let Err(e) = self.socket.shutdown(std::net::Shutdown::Both) {
			log::debug!("socket shutdown error (already closed?): {e}");
		}

		self.set_state(ConnState::Stopped);
	}
}

#[cfg(not(target_os = "windows"))]
fn set_linger_abort(socket: &UdpSocket) -> std::io::Result<()> {
	use socket2::SockRef;
	SockRef::from(socket).set_linger(Some(Duration::from_secs(0)))
}

impl Drop for Session {
	/// Runs the same teardown as an explicit `close()` — idempotent (it
	/// checks `stopped()` first), so a caller that already closed the
	/// session pays nothing here, and a caller who only ever drops a
	/// borrowed `Arc<Session>` (e.g. `cleanup_connection` losing the
	/// teardown race to a concurrent borrower) still gets the full
	/// best-effort Close packet, channel teardown, and socket
	/// shutdown, not just the reader/writer threads stopped.
	fn drop(&mut self) {
		self.close();
	}
}

fn spawn_writer(
	socket: Arc<UdpSocket>,
	peer_addr: SocketAddr,
	outbound_rx: Receiver<Vec<u8>>,
	stopping: Arc<AtomicBool>,
	_dumper: Option<Arc<Mutex<PacketWriter>>>,
) -> JoinHandle<()> {
	thread::Builder::new()
		.name("pppp-writer".into())
		.spawn(move || loop {
			if stopping.load(Ordering::Relaxed) {
				break;
			}
			match outbound_rx.recv_timeout(SOCKET_POLL_INTERVAL) {
				Ok(bytes) => {
					if let Err(e) = socket.send_to(&bytes, peer_addr) {
						log::warn!("pppp-writer: send_to failed: {e}");
					}
				}
				Err(RecvTimeoutError::Timeout) => continue,
				Err(RecvTimeoutError::Disconnected) => break,
			}
		})
		.expect("spawn pppp-writer thread")
}

fn spawn_reader(
	socket: Arc<UdpSocket>,
	codec: Arc<dyn Codec>,
	inbound_tx: Sender<Packet>,
	stopping: Arc<AtomicBool>,
	dumper: Option<Arc<Mutex<PacketWriter>>>,
) -> JoinHandle<()> {
	thread::Builder::new()
		.name("pppp-reader".into())
		.spawn(move || {
			let mut buf = [0u8; 65536];
			loop {
				if stopping.load(Ordering::Relaxed) {
					break;
				}
				match socket.recv_from(&mut buf) {
					Ok((n, _from)) => {
						if let Some(d) = &dumper {
							let _ = d.lock().record(Direction::Rx, &buf[..n]);
						}
						match codec.decode(&buf[..n]) {
							Ok(packet) => {
								if inbound_tx.send(packet).is_err() {
									break;
								}
							}
							Err(e) => log::debug!("pppp-reader: decode error: {e}"),
						}
					}
					Err(e)
						if e.kind() == std::io::ErrorKind::WouldBlock
							|| e.kind() == std::io::ErrorKind::TimedOut =>
					{
						continue;
					}
					Err(e) => {
						log::warn!("pppp-reader: socket error, stopping: {e}");
						break;
					}
				}
			}
		})
		.expect("spawn pppp-reader thread")
}
