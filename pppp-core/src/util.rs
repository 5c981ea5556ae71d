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

//! Small shared primitives, kept separate the way the teacher keeps a thin
//! `util` crate of cross-cutting helpers rather than importing `parking_lot`
//! directly all over the place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

pub use parking_lot::{Mutex, RwLock};

/// Granularity of `sleep_interruptible`'s polling loop.
const SLEEP_STEP: Duration = Duration::from_millis(100);

/// Sleeps up to `dur`, but wakes early and returns as soon as `stop` fires.
/// Every blocking wait in the crate that isn't already a socket/channel
/// timeout goes through this instead of a bare `thread::sleep`.
pub fn sleep_interruptible(stop: &StopState, dur: Duration) {
	let mut remaining = dur;
	while remaining > Duration::ZERO {
		if stop.is_stopped() {
			return;
		}
		let step = remaining.min(SLEEP_STEP);
		thread::sleep(step);
		remaining = remaining.saturating_sub(step);
	}
}

/// A cooperative stop flag, observed between iterations of every blocking
/// loop in the crate (recv loop, rate limiter, worker_run). Cloneable via
/// `Arc` at the call site; this type itself just wraps the atomic.
#[derive(Default)]
pub struct StopState {
	stopped: AtomicBool,
}

impl StopState {
	pub fn new() -> Self {
		Self {
			stopped: AtomicBool::new(false),
		}
	}

	pub fn stop(&self) {
		self.stopped.store(true, Ordering::Relaxed);
	}

	pub fn is_stopped(&self) -> bool {
		self.stopped.load(Ordering::Relaxed)
	}

	/// Resets the flag so a stopped session/service struct can be reused by
	/// a fresh worker_start. Session state itself is never reused per spec
	/// ("a Stopped session cannot be reused"); this is for the service-level
	/// flag only.
	pub fn reset(&self) {
		self.stopped.store(false, Ordering::Relaxed);
	}
}
