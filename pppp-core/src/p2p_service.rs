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

//! The P2P service (component D): a supervised worker that owns a
//! `Session`, sends heartbeats, tears down and reconnects on failure, and
//! fans inbound packets out to registered handlers. Grounded on
//! `original_source/web/service/pppp.py`'s `PPPPService`.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::config::Printer;
use crate::error::{Error, Result};
use crate::protocol::{Codec, DefaultCodec, Duid, Packet, PacketWriter};
use crate::registry::Context;
use crate::service::Service;
use crate::session::{ConnState, Session};
use crate::util::{sleep_interruptible, StopState};

/// How often a heartbeat is sent while connected.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Consecutive heartbeat failures before the connection is torn down.
const HEARTBEAT_FAIL_THRESHOLD: u32 = 3;
/// Minimum gap after a cleanup before attempting to open a new session.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Pause `worker_start` gives a just-cleaned-up session before rebuilding.
const CLEANUP_WAIT: Duration = Duration::from_millis(250);
/// Deadline for one handshake attempt.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(15);

/// A non-owning subscriber invoked for every packet the session receives.
/// Errors are logged and never propagate — one bad handler must not take
/// down the others or the service itself.
pub type PacketHandler = Box<dyn Fn(&Packet) -> Result<()> + Send + Sync>;

/// Identifies one registered handler so its owner can deregister exactly
/// that handler (and no other) from `worker_stop`, mirroring the original's
/// `self.pppp.handlers.remove(self._handler)` removal by identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Wraps a `Session` with heartbeats, reconnect-on-failure, and a handler
/// registry. All mutable state lives behind locks/atomics rather than
/// requiring `&mut self`, because the supervisor drives its lifecycle on
/// one thread while video/file-transfer callers reach it concurrently from
/// others via a shared `Arc`.
pub struct PppService {
	printer: Printer,
	duid: Duid,
	codec: Arc<dyn Codec>,
	dump_path: Option<PathBuf>,
	stop: Arc<StopState>,

	session: Mutex<Option<Arc<Session>>>,
	handlers: Mutex<Vec<(HandlerId, PacketHandler)>>,
	next_handler_id: AtomicU64,

	last_heartbeat: Mutex<Option<Instant>>,
	heartbeat_fail_count: AtomicU32,
	last_cleanup_time: Mutex<Option<Instant>>,
	restart_pending: AtomicBool,
}

impl PppService {
	pub fn new(printer: Printer, dump_path: Option<PathBuf>, stop: Arc<StopState>) -> Result<Arc<Self>> {
		let duid = printer.duid()?;
		let svc = Arc::new(Self {
			printer,
			duid,
			codec: Arc::new(DefaultCodec::new()),
			dump_path,
			stop,
			session: Mutex::new(None),
			handlers: Mutex::new(Vec::new()),
			next_handler_id: AtomicU64::new(0),
			last_heartbeat: Mutex::new(None),
			heartbeat_fail_count: AtomicU32::new(0),
			last_cleanup_time: Mutex::new(None),
			restart_pending: AtomicBool::new(false),
		});
		crate::registry::default_registry().register(&svc);
		Ok(svc)
	}

	/// Also registers `self` in `ctx`'s (test-replaceable) registry by weak
	/// reference, per §9's non-owning diagnostics table. `new` already
	/// registers in the process-wide default; call this too when a caller
	/// threads its own `Context` and wants diagnostics scoped to it.
	pub fn register(self: &Arc<Self>, ctx: &Context<PppService>) {
		ctx.registry.register(self);
	}

	/// A clone of the current session, if one is open. Cloning the `Arc`
	/// lets a caller hold a stable reference across a reconnect — if
	/// `worker_start` later replaces `self.session`, the caller's clone
	/// still points at the (now-closing) old one, which is exactly the
	/// identity-change signal the video consumer relies on.
	pub fn session(&self) -> Option<Arc<Session>> {
		self.session.lock().clone()
	}

	pub fn connected(&self) -> bool {
		match self.session() {
			Some(s) => !s.stopped() && s.state() == ConnState::Connected,
			None => false,
		}
	}

	/// Registers a non-owning handler, invoked for every packet the P2P
	/// service receives, and returns an id the caller can later pass to
	/// `remove_handler` to deregister just this one. Append-only otherwise
	/// while the service is running; all handlers are also cleared in bulk
	/// by `cleanup_connection`.
	pub fn add_handler(&self, handler: PacketHandler) -> HandlerId {
		let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::SeqCst));
		self.handlers.lock().push((id, handler));
		id
	}

	/// Removes exactly the handler `id` identifies, if still present. A
	/// no-op if it was already removed by a prior call or by
	/// `cleanup_connection`.
	pub fn remove_handler(&self, id: HandlerId) {
		self.handlers.lock().retain(|(hid, _)| *hid != id);
	}

	/// Sends `{commandType, ...kwargs}` as a JSON command on the control
	/// channel. Fails with `NotConnected` if there is no open, connected
	/// session.
	pub fn api_command(&self, command_type: &str, mut kwargs: Value) -> Result<()> {
		let session = self.session().ok_or(Error::NotConnected)?;
		if session.stopped() || session.state() != ConnState::Connected {
			return Err(Error::NotConnected);
		}

		let obj = kwargs
			.as_object_mut()
			.ok_or_else(|| Error::Codec("api_command kwargs must be a JSON object".into()))?;
		obj.insert("commandType".to_string(), json!(command_type));

		session.send_framed(
			serde_json::to_vec(&kwargs).map_err(|e| Error::Codec(e.to_string()))?.as_slice(),
			crate::protocol::ChannelId::CONTROL,
			crate::protocol::P2PCmdType::JsonCmd,
		)
	}

	pub fn send_heartbeat(&self) -> Result<()> {
		match self.api_command("heartbeat", json!({})) {
			Ok(()) => {
				self.heartbeat_fail_count.store(0, Ordering::SeqCst);
				Ok(())
			}
			Err(e) => {
				self.heartbeat_fail_count.fetch_add(1, Ordering::SeqCst);
				Err(e)
			}
		}
	}

	fn heartbeat_fail_count(&self) -> u32 {
		self.heartbeat_fail_count.load(Ordering::SeqCst)
	}

	/// Idempotent, best-effort teardown. Every step is logged-and-swallowed
	/// on failure; control always reaches the end so invariant 1 holds
	/// regardless of how many inner steps fail.
	pub fn cleanup_connection(&self) {
		let maybe_session = self.session.lock().take();
		if let Some(session) = maybe_session {
			// `Arc::try_unwrap` only succeeds if we hold the last reference;
			// otherwise a concurrent borrower (e.g. an in-flight file
			// transfer) is still using it and we just let its `Drop` finish
			// the teardown once it releases its clone.
			match Arc::try_unwrap(session) {
				Ok(mut session) => session.close(),
				Err(session) => {
					log::debug!("cleanup_connection: session still borrowed, deferring close to its Drop");
					drop(session);
				}
			}
		}

		self.handlers.lock().clear();
		*self.last_cleanup_time.lock() = Some(Instant::now());
		self.heartbeat_fail_count.store(0, Ordering::SeqCst);
		*self.last_heartbeat.lock() = None;
	}
}

impl Service for Arc<PppService> {
	fn worker_start(&mut self) -> Result<()> {
		self.cleanup_connection();
		sleep_interruptible(&self.stop, CLEANUP_WAIT.saturating_mul(2));

		let ip = self
			.printer
			.ip_addr
			.ok_or_else(|| Error::ServiceStopped("printer IP address not available".into()))?;

		let dumper = match &self.dump_path {
			Some(path) => Some(PacketWriter::open(path)?),
			None => None,
		};

		let mut session = Session::new(ip, self.duid, self.codec.clone(), dumper)?;
		let deadline = Instant::now() + HANDSHAKE_DEADLINE;

		match session.connect_lan(deadline) {
			Ok(()) => {
				*self.session.lock() = Some(Arc::new(session));
				self.restart_pending.store(false, Ordering::SeqCst);
				Ok(())
			}
			Err(e) => {
				// `self.session` was never populated with this attempt, so
				// `self.cleanup_connection()` would find nothing to tear
				// down; close the half-open local session directly instead.
				session.close();
				Err(e)
			}
		}
	}

	fn worker_run(&mut self, timeout: Duration) -> Result<()> {
		if self.stop.is_stopped() {
			return Ok(());
		}

		let session = match self.session() {
			Some(s) => s,
			None => {
				let idle = self
					.last_cleanup_time
					.lock()
					.map(|t| t.elapsed())
					.unwrap_or(RECONNECT_DELAY);
				if idle < RECONNECT_DELAY {
					sleep_interruptible(&self.stop, RECONNECT_DELAY - idle);
					return Ok(());
				}
				self.restart_pending.store(true, Ordering::SeqCst);
				return Ok(());
			}
		};

		if session.stopped() {
			self.cleanup_connection();
			self.restart_pending.store(true, Ordering::SeqCst);
			return Ok(());
		}

		let need_heartbeat = self
			.last_heartbeat
			.lock()
			.map(|t| t.elapsed() >= HEARTBEAT_INTERVAL)
			.unwrap_or(true);
		if need_heartbeat {
			let _ = self.send_heartbeat();
			*self.last_heartbeat.lock() = Some(Instant::now());
			if self.heartbeat_fail_count() >= HEARTBEAT_FAIL_THRESHOLD {
				self.cleanup_connection();
				self.restart_pending.store(true, Ordering::SeqCst);
				return Ok(());
			}
		}

		let slice = timeout.min(HEARTBEAT_INTERVAL);
		match session.recv(slice) {
			Ok(Some(packet)) => {
				session.process(&packet)?;
				for (_, handler) in self.handlers.lock().iter() {
					if let Err(e) = handler(&packet) {
						log::warn!("packet handler failed: {e}");
					}
				}
			}
			Ok(None) => {}
			Err(Error::ConnectionReset(reason)) => {
				log::warn!("connection reset: {reason}");
				self.cleanup_connection();
				self.restart_pending.store(true, Ordering::SeqCst);
			}
			Err(e) => return Err(e),
		}

		if self.restart_pending.load(Ordering::SeqCst) && !self.stop.is_stopped() {
			return Err(Error::ServiceRestart("reconnect requested".into()));
		}

		Ok(())
	}

	fn worker_stop(&mut self) {
		self.cleanup_connection();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn printer(ip: Option<Ipv4Addr>) -> Printer {
		Printer {
			name: "test-printer".into(),
			ip_addr: ip,
			p2p_duid: "ABCDEFGH123456789012".into(),
		}
	}

	#[test]
	fn worker_start_fails_permanently_without_an_ip() {
		let stop = Arc::new(StopState::new());
		let svc = PppService::new(printer(None), None, stop).unwrap();
		let mut worker = svc.clone();
		let err = Service::worker_start(&mut worker).unwrap_err();
		assert!(err.is_stopped());
	}

	#[test]
	fn cleanup_connection_is_idempotent_with_no_session() {
		let stop = Arc::new(StopState::new());
		let svc = PppService::new(printer(None), None, stop).unwrap();
		svc.cleanup_connection();
		svc.cleanup_connection();
		assert!(!svc.connected());
		assert!(svc.handlers.lock().is_empty());
	}

	#[test]
	fn api_command_fails_without_connection() {
		let stop = Arc::new(StopState::new());
		let svc = PppService::new(printer(Some(Ipv4Addr::new(127, 0, 0, 1))), None, stop).unwrap();
		let err = svc.api_command("heartbeat", json!({})).unwrap_err();
		assert!(matches!(err, Error::NotConnected));
	}
}
