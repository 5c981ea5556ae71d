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

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};

use crate::protocol::ChannelId;

/// Back-pressured capacity of a channel's inbound byte-chunk buffer.
const CHANNEL_BUFFER_CAP: usize = 256;

/// One of a session's (up to 8) logical channels: a send-sequence counter,
/// an inbound ordered byte-chunk buffer, and the mutex that backs the
/// exclusive-use bulk-transfer token (§5's "serialise concurrent callers of
/// send_bulk").
pub struct Channel {
	pub id: ChannelId,
	seq: AtomicU32,
	inbound_tx: Sender<Vec<u8>>,
	inbound_rx: Receiver<Vec<u8>>,
	bulk_token: Mutex<()>,
}

impl Channel {
	pub fn new(id: ChannelId) -> Self {
		let (inbound_tx, inbound_rx) = crossbeam_channel::bounded(CHANNEL_BUFFER_CAP);
		Self {
			id,
			seq: AtomicU32::new(0),
			inbound_tx,
			inbound_rx,
			bulk_token: Mutex::new(()),
		}
	}

	/// Allocates the next send-sequence number for this channel.
	pub fn next_seq(&self) -> u32 {
		self.seq.fetch_add(1, Ordering::SeqCst)
	}

	/// Appends a chunk to the inbound buffer. Non-blocking: a full buffer
	/// drops the chunk and returns `false` so `process()` never stalls the
	/// receive path.
	pub fn push_inbound(&self, chunk: Vec<u8>) -> bool {
		self.inbound_tx.try_send(chunk).is_ok()
	}

	/// Drains one inbound chunk without blocking, if any is queued.
	pub fn try_recv_inbound(&self) -> Option<Vec<u8>> {
		self.inbound_rx.try_recv().ok()
	}

	/// Closes both inbound and outbound ends of this channel's buffers.
	/// Dropping the only sender/receiver pair we hold does this already;
	/// this method exists so `cleanup_connection` has an explicit,
	/// independently-orderable step to call per channel, as spec'd.
	pub fn close(&self) {
		// Drain whatever is left so readers see the buffer as empty rather
		// than stuck holding stale chunks after teardown.
		while self.inbound_rx.try_recv().is_ok() {}
	}

	/// Acquires the exclusive bulk-transfer token for this channel, blocking
	/// until any concurrent transfer releases it.
	pub fn lock_bulk(&self) -> MutexGuard<'_, ()> {
		self.bulk_token.lock()
	}
}
