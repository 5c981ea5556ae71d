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

use std::io;

/// Error kinds surfaced by the core, per the error handling design.
///
/// `ServiceRestart` and `ServiceStopped` are control signals rather than
/// user-visible failures: the service runtime (`crate::service`) intercepts
/// them and never lets them propagate past a worker boundary.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("timed out: {0}")]
	Timeout(String),

	#[error("not connected")]
	NotConnected,

	#[error("connection refused by peer: {0}")]
	ConnectionRefused(String),

	#[error("connection reset: {0}")]
	ConnectionReset(String),

	#[error("service restart requested: {0}")]
	ServiceRestart(String),

	#[error("service stopped: {0}")]
	ServiceStopped(String),

	#[error("transfer aborted: {0}")]
	TransferAborted(String),

	#[error("codec error: {0}")]
	Codec(String),

	#[error(transparent)]
	Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	pub fn is_restart(&self) -> bool {
		matches!(self, Error::ServiceRestart(_))
	}

	pub fn is_stopped(&self) -> bool {
		matches!(self, Error::ServiceStopped(_))
	}
}
