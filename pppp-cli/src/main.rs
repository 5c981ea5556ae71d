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

//! Standalone file-transfer tool (spec.md §6's CLI surface), distilled from
//! `original_source/test_transfer.py`'s `main`. Wires a resolved `Config`
//! into `pppp-core::session`/`file_transfer` directly — no supervisor here,
//! since a one-shot upload doesn't need restart/backoff, just a single
//! handshake followed by one transfer.

mod config;
mod logfmt;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::Level;

use pppp_core::file_transfer::{self, FileUploadInfo};
use pppp_core::protocol::{Codec, DefaultCodec, PacketWriter};
use pppp_core::session::Session;

/// Deadline given to one handshake attempt from this tool, matching the
/// original's `pppp_open(config, printer, timeout=10.0)`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "pppp-cli", about = "Upload a file to a printer over the P2P link")]
struct Args {
	/// Increase log verbosity; repeatable (-v for debug, -vv for trace).
	#[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
	verbose: u8,

	/// Index into the config's printer list.
	#[arg(short = 'p', long = "printer", default_value_t = 0)]
	printer: usize,

	/// Upload rate limit in Mbps.
	#[arg(short = 'r', long = "rate", default_value_t = 10)]
	rate: u32,

	/// Path to a resolved config file (JSON).
	#[arg(short = 'c', long = "config")]
	config: PathBuf,

	/// File to upload.
	filename: PathBuf,
}

fn level_for(verbose: u8) -> Level {
	match verbose {
		0 => Level::Info,
		1 => Level::Debug,
		_ => Level::Trace,
	}
}

fn run(args: &Args) -> anyhow::Result<()> {
	let mut config = config::load(&args.config)?;
	config.printer_index = args.printer;
	let printer = config.selected_printer()?.clone();
	let duid = printer.duid()?;
	let ip: Ipv4Addr = printer
		.ip_addr
		.ok_or_else(|| anyhow::anyhow!("printer {:?} has no configured IP address", printer.name))?;

	log::debug!("loading file {:?}", args.filename);
	let data = std::fs::read(&args.filename)?;
	let fui = FileUploadInfo::from_data(
		args.filename
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_else(|| "upload.bin".into()),
		&data,
		"cli",
		"-",
		"-",
	);
	log::info!("uploading {} bytes as {:?}", fui.size, fui.name);
	log::debug!("file md5: {}", fui.md5);

	let codec: Arc<dyn Codec> = Arc::new(DefaultCodec::new());
	let dumper = match &config.pppp_dump {
		Some(path) => Some(PacketWriter::open(path)?),
		None => None,
	};

	log::info!("opening connection to {ip}...");
	let mut session = Session::new(ip, duid, codec, dumper)?;
	session.connect_lan(Instant::now() + CONNECT_TIMEOUT)?;
	log::info!("connected");

	let result = file_transfer::send_file(&session, &fui, data, args.rate);
	log::info!("closing connection...");
	session.close();
	result?;

	log::info!("upload complete");
	Ok(())
}

fn main() -> std::process::ExitCode {
	let args = Args::parse();
	logfmt::setup_logging(level_for(args.verbose));

	match run(&args) {
		Ok(()) => std::process::ExitCode::SUCCESS,
		Err(e) => {
			crate::critical!("{e}");
			// ColorLogger::log already exited(127) for this target; this
			// line only runs if a future change removes that escalation.
			std::process::ExitCode::FAILURE
		}
	}
}
