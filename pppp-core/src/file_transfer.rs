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

//! The rate-limited chunked upload pipeline (component E), grounded on
//! `original_source/web/service/filetransfer.py`'s `FileTransferService`
//! and `original_source/test_transfer.py`'s `send_file`.

use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use serde::Serialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::protocol::{ChannelId, FrameType, P2PCmdType};
use crate::session::{ConnState, Session};

/// Bulk-frame payload size. Fixed by the wire protocol, not configurable.
const CHUNK_SIZE: usize = 32 * 1024;
/// Polling interval while waiting for the session to reach `Connected`.
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long `send_file` waits for the session to connect before giving up.
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Metadata the device needs ahead of a file's bytes, derived once from the
/// bytes themselves plus caller-supplied identity fields.
#[derive(Debug, Clone, Serialize)]
pub struct FileUploadInfo {
	pub name: String,
	pub size: u64,
	pub md5: String,
	pub user_name: String,
	pub user_id: String,
	pub machine_id: String,
}

impl FileUploadInfo {
	pub fn from_data(name: impl Into<String>, data: &[u8], user_name: impl Into<String>, user_id: impl Into<String>, machine_id: impl Into<String>) -> Self {
		let mut hasher = Md5::new();
		hasher.update(data);
		let md5 = hex::encode(hasher.finalize());

		Self {
			name: name.into(),
			size: data.len() as u64,
			md5,
			user_name: user_name.into(),
			user_id: user_id.into(),
			machine_id: machine_id.into(),
		}
	}

	/// The opaque byte blob the device expects, followed by a single zero
	/// byte. The real device-facing encoding is owned by the codec
	/// dependency; JSON is this crate's stand-in.
	pub fn to_wire_bytes(&self) -> Result<Vec<u8>> {
		let mut bytes = serde_json::to_vec(self).map_err(|e| Error::Codec(e.to_string()))?;
		bytes.push(0);
		Ok(bytes)
	}
}

/// First 16 ASCII characters of a fresh UUIDv4, as the device-facing
/// transfer identifier.
fn generate_transfer_id() -> String {
	uuid::Uuid::new_v4().simple().to_string()[..16].to_owned()
}

/// Streams `data` to the device over `session` as one rate-limited bulk
/// transfer. Waits for the session to be `Connected`, then emits a
/// `SEND_FILE` command followed by BEGIN/DATA.../END bulk frames.
///
/// Any transport error aborts the transfer; there is no automatic retry —
/// reconnection is the caller's service's responsibility. The cached
/// `data` buffer is always dropped on return, success or failure.
pub fn send_file(session: &Session, fui: &FileUploadInfo, data: Vec<u8>, rate_limit_mbps: u32) -> Result<()> {
	let result = send_file_inner(session, fui, &data, rate_limit_mbps);
	drop(data);
	result
}

fn send_file_inner(session: &Session, fui: &FileUploadInfo, data: &[u8], rate_limit_mbps: u32) -> Result<()> {
	wait_for_connected(session)?;

	let transfer_id = generate_transfer_id();
	log::info!("starting transfer {transfer_id} ({} bytes)", data.len());

	session.send_framed(
		json!({ "transfer_id": transfer_id }).to_string().as_bytes(),
		ChannelId::CONTROL,
		P2PCmdType::SendFile,
	)?;

	let token = session.acquire_bulk_token(ChannelId::CONTROL);

	session.send_bulk(&token, FrameType::Begin, 0, &fui.to_wire_bytes()?)?;

	let total = data.len();
	let mut rate_limiter = crate::rate_limiter::RateLimiter::new(rate_limit_mbps);
	let mut sent: usize = 0;
	let mut last_reported_decile = 0u32;

	let mut pos = 0usize;
	while pos < total {
		let end = (pos + CHUNK_SIZE).min(total);
		let chunk = &data[pos..end];

		rate_limiter.wait(chunk.len());
		session.send_bulk(&token, FrameType::Data, pos as u32, chunk)?;

		sent += chunk.len();
		pos = end;

		if total > 0 {
			let decile = (sent * 10 / total) as u32;
			if decile > last_reported_decile {
				last_reported_decile = decile;
				log::info!("transfer {transfer_id}: {}% ({sent}/{total} bytes)", decile * 10);
			}
		}
	}

	session.send_bulk(&token, FrameType::End, total as u32, &[])?;
	drop(token);

	log::info!("transfer {transfer_id} complete");
	Ok(())
}

fn wait_for_connected(session: &Session) -> Result<()> {
	let deadline = Instant::now() + CONNECT_WAIT_TIMEOUT;
	loop {
		if session.state() == ConnState::Connected {
			return Ok(());
		}
		if session.stopped() {
			return Err(Error::TransferAborted("session stopped before connecting".into()));
		}
		if Instant::now() >= deadline {
			return Err(Error::Timeout("timed out waiting for session to connect".into()));
		}
		std::thread::sleep(CONNECT_POLL_INTERVAL);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_data_computes_size_and_md5() {
		let data = b"hello printer".to_vec();
		let fui = FileUploadInfo::from_data("firmware.bin", &data, "alice", "u1", "m1");
		let mut hasher = Md5::new();
		hasher.update(&data);
		assert_eq!(fui.size, data.len() as u64);
		assert_eq!(fui.md5, hex::encode(hasher.finalize()));
	}

	#[test]
	fn transfer_id_is_sixteen_ascii_characters() {
		let id = generate_transfer_id();
		assert_eq!(id.len(), 16);
		assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
	}

	#[test]
	fn wire_bytes_end_in_a_trailing_zero_byte() {
		let fui = FileUploadInfo::from_data("a", b"x", "u", "1", "m");
		let bytes = fui.to_wire_bytes().unwrap();
		assert_eq!(*bytes.last().unwrap(), 0u8);
	}
}
