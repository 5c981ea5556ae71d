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

//! The generic supervised worker runtime (component C): a service is any
//! type implementing four lifecycle hooks, and `Supervisor` drives them in
//! a loop with exponential backoff, turning episodic failures into bounded,
//! logged restarts instead of cascading crashes. Grounded on the teacher's
//! `sync::syncer::SyncRunner` (a dedicated named thread looping until a
//! shared stop flag fires) generalised to also own restart/backoff policy.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::util::{sleep_interruptible, StopState};

/// Initial backoff delay after the first failed `worker_start`/`worker_run`.
pub const INITIAL_RETRY_DELAY_SECS: u64 = 2;
/// Backoff multiplier.
pub const RETRY_MULTIPLIER: u64 = 2;
/// Backoff ceiling.
pub const MAX_RETRY_INTERVAL_SECS: u64 = 30;
/// Named in the original design as the point at which the retry counter
/// resets; superseded by the single reset rule below (see DESIGN.md, Open
/// Question 2). Kept as a documented constant, not applied operationally.
pub const MAX_RETRY_COUNT: u32 = 5;
/// Default slice passed to `worker_run`, and the granularity at which the
/// supervisor re-checks the external stop flag.
pub const WORKER_RUN_SLICE: Duration = Duration::from_secs(1);
/// How long the supervisor sleeps at a time while a service is fatally
/// disabled, just to re-check the external stop flag promptly.
const DISABLED_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
	Stopped,
	Starting,
	Running,
	Stopping,
}

/// Per-service bookkeeping the supervisor maintains and exposes for
/// diagnostics and tests.
#[derive(Debug, Clone)]
pub struct WorkerState {
	pub runstate: RunState,
	pub restart_pending: bool,
	pub retry_count: u32,
	pub last_attempt_time: Option<Instant>,
	pub last_success_time: Option<Instant>,
	pub total_restarts: u64,
	/// Set once a hook raises `ServiceStopped`: the service is fatally
	/// disabled until something external reconstructs the supervisor.
	disabled: bool,
}

impl Default for WorkerState {
	fn default() -> Self {
		Self {
			runstate: RunState::Stopped,
			restart_pending: false,
			retry_count: 0,
			last_attempt_time: None,
			last_success_time: None,
			total_restarts: 0,
			disabled: false,
		}
	}
}

impl WorkerState {
	/// The single backoff rule the design settled on: reset on success, or
	/// when idle longer than `MAX_RETRY_INTERVAL_SECS`; otherwise `initial *
	/// multiplier^(retry_count - 1)`, capped. `retry_count` counts completed
	/// failures (1 after the first), so the delay *before* the Nth attempt
	/// is indexed by the N-1 failures already observed — shifting by
	/// `retry_count` itself would double-count the first failure and delay
	/// 4s instead of 2s before the second attempt.
	fn backoff_interval(&mut self) -> Duration {
		if let Some(last) = self.last_attempt_time {
			if last.elapsed() > Duration::from_secs(MAX_RETRY_INTERVAL_SECS) {
				self.retry_count = 0;
			}
		}
		let shift = self.retry_count.saturating_sub(1).min(16);
		let secs = INITIAL_RETRY_DELAY_SECS.saturating_mul(RETRY_MULTIPLIER.saturating_pow(shift));
		Duration::from_secs(secs.min(MAX_RETRY_INTERVAL_SECS))
	}
}

/// The four lifecycle hooks a supervised worker implements.
pub trait Service: Send {
	/// Runs once, the first time the supervisor activates this service.
	fn worker_init(&mut self) {}

	/// Brings the worker up. `Err(ServiceStopped)` is fatal; any other
	/// error schedules a backoff-delayed restart.
	fn worker_start(&mut self) -> Result<(), Error>;

	/// One slice of work, bounded by `timeout`. May return normally, raise
	/// `ServiceRestart` to request a stop/start cycle, or raise
	/// `ServiceStopped` to disable the service.
	fn worker_run(&mut self, timeout: Duration) -> Result<(), Error>;

	/// Tears the worker down. The runtime guarantees this runs exactly once
	/// per successful `worker_start`, including when `worker_run` unwinds
	/// via an error or a panic.
	fn worker_stop(&mut self);
}

/// Drives a `Service` through init/start/run/stop with restart backoff.
pub struct Supervisor<S: Service> {
	service: S,
	state: WorkerState,
	stop: Arc<StopState>,
}

impl<S: Service + 'static> Supervisor<S> {
	pub fn new(service: S) -> Self {
		Self {
			service,
			state: WorkerState::default(),
			stop: Arc::new(StopState::new()),
		}
	}

	pub fn state(&self) -> &WorkerState {
		&self.state
	}

	pub fn stop_handle(&self) -> Arc<StopState> {
		self.stop.clone()
	}

	/// Spawns the supervisor loop on its own named OS thread and returns a
	/// join handle plus the stop flag used to request a deterministic,
	/// bounded shutdown.
	pub fn spawn(service: S, thread_name: &str) -> (JoinHandle<()>, Arc<StopState>) {
		let sup = Self::new(service);
		let stop = sup.stop_handle();
		let handle = thread::Builder::new()
			.name(thread_name.to_owned())
			.spawn(move || sup.run())
			.expect("spawn supervisor thread");
		(handle, stop)
	}

	/// Like `spawn`, but shares a caller-supplied stop flag instead of
	/// minting a fresh one — needed when the service itself must observe
	/// the same flag mid-`worker_run` (e.g. while sleeping) rather than
	/// only at the top of the supervisor's own loop.
	pub fn spawn_with_stop(service: S, thread_name: &str, stop: Arc<StopState>) -> JoinHandle<()> {
		let sup = Self {
			service,
			state: WorkerState::default(),
			stop,
		};
		thread::Builder::new()
			.name(thread_name.to_owned())
			.spawn(move || sup.run())
			.expect("spawn supervisor thread")
	}

	/// Runs the supervised loop to completion (until the stop flag fires or
	/// the service is fatally disabled). Blocking; normally called from a
	/// dedicated thread via `spawn`.
	pub fn run(mut self) {
		self.service.worker_init();

		loop {
			if self.stop.is_stopped() {
				if self.state.runstate == RunState::Running {
					self.service.worker_stop();
				}
				self.state.runstate = RunState::Stopped;
				break;
			}

			match self.state.runstate {
				RunState::Stopped if self.state.disabled => {
					// Fatal until something external reconstructs us.
					sleep_interruptible(&self.stop, DISABLED_POLL_INTERVAL);
				}
				RunState::Stopped => {
					self.state.runstate = RunState::Starting;
				}
				RunState::Starting => {
					let interval = self.state.backoff_interval();
					let elapsed = self
						.state
						.last_attempt_time
						.map(|t| t.elapsed())
						.unwrap_or(interval);
					if elapsed < interval {
						sleep_interruptible(&self.stop, interval - elapsed);
						continue;
					}

					self.state.last_attempt_time = Some(Instant::now());
					self.state.total_restarts += 1;
					match self.service.worker_start() {
						Ok(()) => {
							self.state.retry_count = 0;
							self.state.last_success_time = Some(Instant::now());
							self.state.restart_pending = false;
							self.state.runstate = RunState::Running;
						}
						Err(Error::ServiceStopped(reason)) => {
							log::warn!("worker_start: service stopped permanently: {reason}");
							self.state.disabled = true;
							self.state.runstate = RunState::Stopped;
						}
						Err(e) => {
							log::warn!("worker_start failed, scheduling retry: {e}");
							self.state.retry_count += 1;
							self.state.runstate = RunState::Stopped;
						}
					}
				}
				RunState::Running => {
					let result = panic::catch_unwind(AssertUnwindSafe(|| {
						self.service.worker_run(WORKER_RUN_SLICE)
					}));
					match result {
						Ok(Ok(())) => {}
						Ok(Err(Error::ServiceRestart(reason))) => {
							log::info!("service restart requested: {reason}");
							self.service.worker_stop();
							self.state.runstate = RunState::Stopped;
						}
						Ok(Err(Error::ServiceStopped(reason))) => {
							log::warn!("worker_run: service stopped permanently: {reason}");
							self.service.worker_stop();
							self.state.disabled = true;
							self.state.runstate = RunState::Stopped;
						}
						Ok(Err(e)) => {
							log::warn!("worker_run error, restarting: {e}");
							self.service.worker_stop();
							self.state.runstate = RunState::Stopped;
						}
						Err(panic_payload) => {
							log::error!(
								"worker_run panicked, forcing stop+restart: {}",
								panic_message(&panic_payload)
							);
							self.service.worker_stop();
							self.state.runstate = RunState::Stopped;
						}
					}
				}
				RunState::Stopping => {
					// Only ever set transiently; the top-of-loop stop check
					// handles the transition directly.
					self.state.runstate = RunState::Stopped;
				}
			}
		}
	}
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	struct FlakyService {
		fail_until: u32,
		attempts: Arc<AtomicU32>,
		stops: Arc<AtomicU32>,
	}

	impl Service for FlakyService {
		fn worker_start(&mut self) -> Result<(), Error> {
			let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
			if n <= self.fail_until {
				Err(Error::ConnectionRefused("not yet".into()))
			} else {
				Ok(())
			}
		}

		fn worker_run(&mut self, _timeout: Duration) -> Result<(), Error> {
			Err(Error::ServiceStopped("done".into()))
		}

		fn worker_stop(&mut self) {
			self.stops.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[test]
	fn worker_stop_runs_once_per_successful_start() {
		let attempts = Arc::new(AtomicU32::new(0));
		let stops = Arc::new(AtomicU32::new(0));
		let svc = FlakyService {
			fail_until: 0,
			attempts: attempts.clone(),
			stops: stops.clone(),
		};
		let mut sup = Supervisor::new(svc);
		// Drive the loop directly (no thread) for a deterministic test:
		// one failed-free start, then worker_run fatally stops it.
		sup.state.runstate = RunState::Starting;
		sup.run_n_iterations(4);

		assert_eq!(attempts.load(Ordering::SeqCst), 1);
		assert_eq!(stops.load(Ordering::SeqCst), 1);
	}

	impl<S: Service + 'static> Supervisor<S> {
		/// Test-only: execute a bounded number of loop bodies instead of
		/// `run`'s unbounded loop, so tests terminate deterministically.
		fn run_n_iterations(&mut self, n: usize) {
			for _ in 0..n {
				if self.stop.is_stopped() {
					break;
				}
				match self.state.runstate {
					RunState::Stopped if self.state.disabled => break,
					RunState::Stopped => self.state.runstate = RunState::Starting,
					RunState::Starting => {
						self.state.last_attempt_time = Some(Instant::now());
						self.state.total_restarts += 1;
						match self.service.worker_start() {
							Ok(()) => {
								self.state.retry_count = 0;
								self.state.last_success_time = Some(Instant::now());
								self.state.runstate = RunState::Running;
							}
							Err(Error::ServiceStopped(_)) => {
								self.state.disabled = true;
								self.state.runstate = RunState::Stopped;
							}
							Err(_) => {
								self.state.retry_count += 1;
								self.state.runstate = RunState::Stopped;
							}
						}
					}
					RunState::Running => match self.service.worker_run(WORKER_RUN_SLICE) {
						Ok(()) => {}
						Err(Error::ServiceRestart(_)) => {
							self.service.worker_stop();
							self.state.runstate = RunState::Stopped;
						}
						Err(Error::ServiceStopped(_)) => {
							self.service.worker_stop();
							self.state.disabled = true;
							self.state.runstate = RunState::Stopped;
						}
						Err(_) => {
							self.service.worker_stop();
							self.state.runstate = RunState::Stopped;
						}
					},
					RunState::Stopping => self.state.runstate = RunState::Stopped,
				}
			}
		}
	}

	#[test]
	fn backoff_sequence_matches_2_4_8_16_30_30() {
		// Mirrors the operational call pattern: `retry_count` is incremented
		// by a failed `worker_start` *before* the next `Starting` iteration
		// computes the delay, so the first backoff (after one failure) is
		// computed with retry_count == 1, not 0.
		let mut state = WorkerState::default();
		let mut got = Vec::new();
		for _ in 0..6 {
			state.retry_count += 1;
			state.last_attempt_time = Some(Instant::now());
			got.push(state.backoff_interval().as_secs());
		}
		assert_eq!(got, vec![2, 4, 8, 16, 30, 30]);
	}

	#[test]
	fn backoff_resets_after_idle_period() {
		let mut state = WorkerState::default();
		state.retry_count = 4;
		state.last_attempt_time = Some(Instant::now() - Duration::from_secs(MAX_RETRY_INTERVAL_SECS + 1));
		let interval = state.backoff_interval();
		assert_eq!(interval.as_secs(), 2);
		assert_eq!(state.retry_count, 0);
	}
}
