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

//! Process-level log formatter installed by `main`, distilled from
//! `original_source/cli/logfmt.py`'s `ColorFormatter`/`ExitOnExceptionHandler`
//! pair. `pppp-core` never installs a logger itself (see its crate docs) —
//! that is this binary's job alone.

use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

use log::{Level, Log, Metadata, Record};
use owo_colors::OwoColorize;

/// Log records tagged with this target and at `Level::Error` are treated as
/// "critical" (spec.md §6's "critical-level log (supervisor trap)") and exit
/// the process with code 127 after being printed. Nothing below `main` uses
/// this target; it exists only so the CLI can deliberately escalate a
/// terminal condition (e.g. the transfer aborting) into the documented exit
/// code.
pub const CRITICAL_TARGET: &str = "pppp_cli::critical";

static START: OnceLock<Instant> = OnceLock::new();

struct ColorLogger {
	max_level: Level,
}

fn marked(level: Level) -> String {
	match level {
		Level::Error => "E".red().bold().to_string(),
		Level::Warn => "W".yellow().bold().to_string(),
		Level::Info => "*".green().bold().to_string(),
		Level::Debug => "D".magenta().bold().to_string(),
		Level::Trace => "V".blue().bold().to_string(),
	}
}

impl Log for ColorLogger {
	fn enabled(&self, metadata: &Metadata) -> bool {
		metadata.level() <= self.max_level
	}

	fn log(&self, record: &Record) {
		if !self.enabled(record.metadata()) {
			return;
		}
		let elapsed = START.get_or_init(Instant::now).elapsed();

		eprintln!(
			"{}{}{} {} {}",
			"[".blue().bold(),
			marked(record.level()),
			"]".blue().bold(),
			format!("[{:.1}s]", elapsed.as_secs_f64()).cyan(),
			record.args(),
		);

		if record.level() == Level::Error && record.target() == CRITICAL_TARGET {
			std::process::exit(127);
		}
	}

	fn flush(&self) {
		let _ = std::io::stderr().flush();
	}
}

/// Installs the process-wide logger at `level` (`Info` by default, `Debug`
/// at `-v`, `Trace` at `-vv`, matching spec.md §9 Open Question (3)'s
/// collapse of the original's extra `VERBOSE` level into the ordinary
/// info/debug split — `-vv` maps onto `Trace` rather than inventing a fifth
/// level).
pub fn setup_logging(level: Level) {
	log::set_max_level(level.to_level_filter());
	log::set_boxed_logger(Box::new(ColorLogger { max_level: level }))
		.expect("logger already installed");
}

/// Logs at `Error` with the marker that makes `ColorLogger` exit(127) once
/// the message has been printed.
#[macro_export]
macro_rules! critical {
	($($arg:tt)+) => {
		log::error!(target: $crate::logfmt::CRITICAL_TARGET, $($arg)+)
	};
}
