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

//! Process-wide, non-owning bookkeeping of live services (§9's "cyclic/back
//! references" design note) plus the explicit `Context` that threads it
//! (and a shared `Config`) through constructors instead of reaching for a
//! bare global everywhere. A `lazy_static` default exists only so a
//! top-level binary has somewhere to start from; tests always build their
//! own `Context`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// A weak-reference table keyed by object identity. Entries are inserted
/// when a service is constructed and pruned lazily whenever the table is
/// read — nothing here keeps a service alive, and nothing needs to run on
/// `Drop` to keep that true.
pub struct Registry<T> {
	live: Mutex<HashMap<usize, Weak<T>>>,
}

impl<T> Default for Registry<T> {
	fn default() -> Self {
		Self {
			live: Mutex::new(HashMap::new()),
		}
	}
}

impl<T> Registry<T> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a weak reference to `service`, keyed by its `Arc` pointer
	/// identity.
	pub fn register(&self, service: &Arc<T>) {
		let key = Arc::as_ptr(service) as usize;
		self.live.lock().insert(key, Arc::downgrade(service));
	}

	/// The number of entries whose referent is still alive, pruning dead
	/// ones as a side effect.
	pub fn live_count(&self) -> usize {
		let mut live = self.live.lock();
		live.retain(|_, weak| weak.strong_count() > 0);
		live.len()
	}

	/// Snapshots every currently-live service.
	pub fn snapshot(&self) -> Vec<Arc<T>> {
		let mut live = self.live.lock();
		live.retain(|_, weak| weak.strong_count() > 0);
		live.values().filter_map(Weak::upgrade).collect()
	}
}

/// Threaded through constructors instead of a bare global, so the test
/// suite can always substitute its own registry/config.
#[derive(Clone)]
pub struct Context<T> {
	pub registry: Arc<Registry<T>>,
	pub config: Arc<parking_lot::RwLock<crate::config::Config>>,
}

impl<T> Context<T> {
	pub fn new(config: crate::config::Config) -> Self {
		Self {
			registry: Arc::new(Registry::new()),
			config: Arc::new(parking_lot::RwLock::new(config)),
		}
	}
}

lazy_static::lazy_static! {
	/// The process-wide default registry of live `PppService`s, matching
	/// the original's global `app.svc` lookup (§9's "global state" note).
	/// Only used when a caller doesn't thread its own `Context` through;
	/// constructed lazily so tests never pay for it unless they opt in via
	/// `default_registry()`.
	static ref DEFAULT_PPPP_REGISTRY: Arc<Registry<crate::p2p_service::PppService>> =
		Arc::new(Registry::new());
}

/// The process-wide default registry, for callers (typically `pppp-cli`'s
/// `main`) that don't need a test-replaceable `Context`.
pub fn default_registry() -> Arc<Registry<crate::p2p_service::PppService>> {
	DEFAULT_PPPP_REGISTRY.clone()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dropped_services_disappear_without_being_kept_alive() {
		let registry: Registry<u32> = Registry::new();
		let a = Arc::new(1u32);
		registry.register(&a);
		assert_eq!(registry.live_count(), 1);
		drop(a);
		assert_eq!(registry.live_count(), 0);
	}
}
