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

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Append-only packet dump sink: one record per packet, both directions,
/// matching the wire behaviour required of a `pppp_dump` file.
pub struct PacketWriter {
	file: File,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
	Tx,
	Rx,
}

impl Direction {
	fn tag(self) -> &'static str {
		match self {
			Direction::Tx => "TX",
			Direction::Rx => "RX",
		}
	}
}

impl PacketWriter {
	pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
		let file = OpenOptions::new().create(true).append(true).open(path)?;
		Ok(Self { file })
	}

	/// Writes one record: a timestamp, direction tag, length, and raw bytes.
	/// Best-effort — callers treat dump failures as non-fatal (§4.3
	/// cleanup_connection swallows them).
	pub fn record(&mut self, dir: Direction, bytes: &[u8]) -> io::Result<()> {
		let ts = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_micros();
		writeln!(self.file, "{ts} {} {}", dir.tag(), bytes.len())?;
		self.file.write_all(bytes)?;
		self.file.write_all(b"\n")?;
		self.file.flush()
	}

	pub fn close(self) -> io::Result<()> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn appends_records_for_both_directions() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("dump.log");
		{
			let mut w = PacketWriter::open(&path).unwrap();
			w.record(Direction::Tx, b"hello").unwrap();
			w.record(Direction::Rx, b"world").unwrap();
		}
		let contents = std::fs::read_to_string(&path).unwrap();
		assert!(contents.contains("TX 5"));
		assert!(contents.contains("RX 5"));
	}
}
