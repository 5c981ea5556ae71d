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

//! The packet codec is, per the design, an external collaborator: a real
//! deployment links against a crate that knows the device's exact byte
//! layout. This module is the seam that dependency plugs into — the wire
//! enums, the `Codec` trait, and a `DefaultCodec` concrete enough to drive
//! the session layer's own loopback tests.

mod codec;
mod dump;

pub use codec::{Codec, DefaultCodec};
pub use dump::{Direction, PacketWriter};

use std::fmt;

/// Fixed UDP port the peer accepts the LAN-search probe on.
pub const LAN_PORT: u16 = 6700;

/// Device unique identifier: a 20-character printable token.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Duid([u8; 20]);

impl Duid {
	pub fn from_string(s: &str) -> crate::error::Result<Self> {
		let bytes = s.as_bytes();
		if bytes.len() != 20 || !bytes.iter().all(|b| b.is_ascii_graphic()) {
			return Err(crate::error::Error::Codec(format!(
				"duid must be 20 printable ASCII characters, got {:?}",
				s
			)));
		}
		let mut buf = [0u8; 20];
		buf.copy_from_slice(bytes);
		Ok(Self(buf))
	}

	pub fn as_bytes(&self) -> &[u8; 20] {
		&self.0
	}
}

impl fmt::Display for Duid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", String::from_utf8_lossy(&self.0))
	}
}

impl fmt::Debug for Duid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Duid({})", self)
	}
}

/// Logical channel id. 0 is control/JSON, 1 is video; up to 8 total exist
/// per session (created at handshake, never mutated thereafter).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u8);

impl ChannelId {
	pub const CONTROL: ChannelId = ChannelId(0);
	pub const VIDEO: ChannelId = ChannelId(1);
	pub const MAX_CHANNELS: u8 = 8;
}

impl fmt::Debug for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ch{}", self.0)
	}
}

/// The three frame types of a bulk upload sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
	Begin,
	Data,
	End,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum P2PCmdType {
	JsonCmd,
	SendFile,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum P2PSubCmdType {
	Heartbeat,
	StartLive,
	CloseLive,
	LiveModeSet,
	LightStateSwitch,
}

impl P2PSubCmdType {
	pub fn command_type(self) -> &'static str {
		match self {
			P2PSubCmdType::Heartbeat => "heartbeat",
			P2PSubCmdType::StartLive => "START_LIVE",
			P2PSubCmdType::CloseLive => "CLOSE_LIVE",
			P2PSubCmdType::LiveModeSet => "LIVE_MODE_SET",
			P2PSubCmdType::LightStateSwitch => "LIGHT_STATE_SWITCH",
		}
	}
}

/// A decoded inbound (or to-be-encoded outbound) packet.
#[derive(Clone, Debug)]
pub enum Packet {
	/// Probe sent by the client during `connect_lan`.
	LanSearch,
	/// Peer's acknowledgement of the LAN-search probe.
	LanSearchAck,
	/// Handshake-complete marker from the peer.
	HandshakeComplete,
	/// Peer rejected the handshake outright.
	ConnectReject,
	/// Graceful close, either direction.
	Close,
	/// Video/data frame on a channel (the codec's `Xzyh` family).
	Xzyh { channel: ChannelId, payload: Vec<u8> },
	/// Bulk transfer frame (the codec's `Aabb` family).
	Aabb {
		channel: ChannelId,
		frame_type: FrameType,
		position: u32,
		payload: Vec<u8>,
	},
	/// A JSON/binary command on the control channel.
	JsonCmd {
		channel: ChannelId,
		command: P2PCmdType,
		payload: Vec<u8>,
	},
}

impl Packet {
	/// The logical channel this packet is addressed to, if any (handshake
	/// packets carry no channel).
	pub fn channel(&self) -> Option<ChannelId> {
		match self {
			Packet::Xzyh { channel, .. }
			| Packet::Aabb { channel, .. }
			| Packet::JsonCmd { channel, .. } => Some(*channel),
			_ => None,
		}
	}
}
