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

//! The configuration shape `pppp-core` consumes. On-disk layout is an
//! external collaborator; this is only the resolved struct a caller hands
//! the core after loading/parsing it however it likes.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::Duid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Printer {
	pub name: String,
	/// Required for LAN mode; absence fails `worker_start` with
	/// `ServiceStopped`.
	pub ip_addr: Option<Ipv4Addr>,
	/// 20-character device identifier.
	pub p2p_duid: String,
}

impl Printer {
	pub fn duid(&self) -> Result<Duid> {
		Duid::from_string(&self.p2p_duid)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	pub printers: Vec<Printer>,
	#[serde(default)]
	pub printer_index: usize,
	#[serde(default)]
	pub pppp_dump: Option<PathBuf>,
}

impl Config {
	/// The printer currently selected by `printer_index`.
	pub fn selected_printer(&self) -> Result<&Printer> {
		self.printers
			.get(self.printer_index)
			.ok_or_else(|| Error::ServiceStopped("printer index out of range".into()))
	}
}
