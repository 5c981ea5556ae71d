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

//! Config loading is an external collaborator per spec.md §1/§6 — real
//! on-disk layout is out of scope. This is a minimal JSON loader, useful for
//! manual runs and integration tests of this binary; nothing in
//! `pppp-core` depends on it.

use std::fs;
use std::path::Path;

use pppp_core::config::Config;

pub fn load(path: &Path) -> anyhow::Result<Config> {
	let text = fs::read_to_string(path)?;
	let config: Config = serde_json::from_str(&text)?;
	Ok(config)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn loads_printers_and_defaults_printer_index() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(
			file,
			r#"{{"printers": [{{"name": "office", "ip_addr": "192.0.2.10", "p2p_duid": "ABCDEFGH123456789012"}}]}}"#
		)
		.unwrap();
		let config = load(file.path()).unwrap();
		assert_eq!(config.printers.len(), 1);
		assert_eq!(config.printer_index, 0);
		assert_eq!(config.printers[0].name, "office");
	}

	#[test]
	fn missing_file_is_an_error() {
		assert!(load(Path::new("/nonexistent/pppp-cli-config.json")).is_err());
	}
}
