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

//! Token-bucket-equivalent rate limiter used by the file-transfer pipeline.
//! A smoothed average over a rolling 1-second window, not per-packet
//! pacing — ported from `original_source/test_transfer.py`'s `RateLimiter`.

use std::thread;
use std::time::{Duration, Instant};

pub struct RateLimiter {
	rate_bytes_per_sec: f64,
	window_start: Instant,
	bytes_sent_in_window: u64,
}

impl RateLimiter {
	pub fn new(rate_mbps: u32) -> Self {
		Self::with_rate_bytes_per_sec(rate_mbps as f64 * 1_000_000.0 / 8.0)
	}

	fn with_rate_bytes_per_sec(rate_bytes_per_sec: f64) -> Self {
		Self {
			rate_bytes_per_sec,
			window_start: Instant::now(),
			bytes_sent_in_window: 0,
		}
	}

	/// Charges `n` bytes against the current window, sleeping first if
	/// sending them now would exceed the configured rate.
	pub fn wait(&mut self, n: usize) {
		let now = Instant::now();
		let elapsed = now.duration_since(self.window_start);

		if elapsed >= Duration::from_secs(1) {
			self.bytes_sent_in_window = 0;
			self.window_start = now;
		} else if (self.bytes_sent_in_window + n as u64) as f64 > self.rate_bytes_per_sec {
			let remaining = Duration::from_secs(1) - elapsed;
			thread::sleep(remaining);
			self.bytes_sent_in_window = 0;
			self.window_start = Instant::now();
		}

		self.bytes_sent_in_window += n as u64;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn does_not_sleep_while_under_the_limit() {
		let mut rl = RateLimiter::with_rate_bytes_per_sec(1_000_000.0);
		let start = Instant::now();
		for _ in 0..10 {
			rl.wait(1024);
		}
		assert!(start.elapsed() < Duration::from_millis(200));
	}

	#[test]
	fn throttles_once_the_window_budget_is_exceeded() {
		// 200 bytes/sec budget, two 150-byte chunks: the second must wait
		// for the window to roll over.
		let mut rl = RateLimiter::with_rate_bytes_per_sec(200.0);
		let start = Instant::now();
		rl.wait(150);
		rl.wait(150);
		assert!(start.elapsed() >= Duration::from_millis(700));
	}
}
