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

use super::{ChannelId, FrameType, P2PCmdType, Packet};
use crate::error::{Error, Result};

/// The seam a real device-specific wire codec plugs into. `pppp-core` only
/// depends on this trait; `DefaultCodec` is this repository's own concrete
/// implementation, used by the session layer's loopback tests and usable
/// standalone.
pub trait Codec: Send + Sync {
	fn encode(&self, packet: &Packet) -> Result<Vec<u8>>;
	fn decode(&self, bytes: &[u8]) -> Result<Packet>;
}

const TAG_LAN_SEARCH: u8 = 0;
const TAG_LAN_SEARCH_ACK: u8 = 1;
const TAG_HANDSHAKE_COMPLETE: u8 = 2;
const TAG_CLOSE: u8 = 3;
const TAG_XZYH: u8 = 4;
const TAG_AABB: u8 = 5;
const TAG_JSON_CMD: u8 = 6;
const TAG_CONNECT_REJECT: u8 = 7;

/// A length-prefixed little-endian wire format. Not the device's real byte
/// layout (that lives in the codec dependency this trait stands in for) but
/// a faithful enough stand-in to exercise every frame kind end to end.
#[derive(Default)]
pub struct DefaultCodec;

impl DefaultCodec {
	pub fn new() -> Self {
		Self
	}
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
	if bytes.len() < *pos + n {
		return Err(Error::Codec("packet truncated".into()));
	}
	let slice = &bytes[*pos..*pos + n];
	*pos += n;
	Ok(slice)
}

fn take_u8(bytes: &[u8], pos: &mut usize) -> Result<u8> {
	Ok(take(bytes, pos, 1)?[0])
}

fn take_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
	let s = take(bytes, pos, 4)?;
	Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

impl Codec for DefaultCodec {
	fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
		let mut out = Vec::new();
		match packet {
			Packet::LanSearch => out.push(TAG_LAN_SEARCH),
			Packet::LanSearchAck => out.push(TAG_LAN_SEARCH_ACK),
			Packet::HandshakeComplete => out.push(TAG_HANDSHAKE_COMPLETE),
			Packet::ConnectReject => out.push(TAG_CONNECT_REJECT),
			Packet::Close => out.push(TAG_CLOSE),
			Packet::Xzyh { channel, payload } => {
				out.push(TAG_XZYH);
				out.push(channel.0);
				out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
				out.extend_from_slice(payload);
			}
			Packet::Aabb {
				channel,
				frame_type,
				position,
				payload,
			} => {
				out.push(TAG_AABB);
				out.push(channel.0);
				out.push(match frame_type {
					FrameType::Begin => 0,
					FrameType::Data => 1,
					FrameType::End => 2,
				});
				out.extend_from_slice(&position.to_le_bytes());
				out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
				out.extend_from_slice(payload);
			}
			Packet::JsonCmd {
				channel,
				command,
				payload,
			} => {
				out.push(TAG_JSON_CMD);
				out.push(channel.0);
				out.push(match command {
					P2PCmdType::JsonCmd => 0,
					P2PCmdType::SendFile => 1,
				});
				out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
				out.extend_from_slice(payload);
			}
		}
		Ok(out)
	}

	fn decode(&self, bytes: &[u8]) -> Result<Packet> {
		let mut pos = 0usize;
		let tag = take_u8(bytes, &mut pos)?;
		match tag {
			TAG_LAN_SEARCH => Ok(Packet::LanSearch),
			TAG_LAN_SEARCH_ACK => Ok(Packet::LanSearchAck),
			TAG_HANDSHAKE_COMPLETE => Ok(Packet::HandshakeComplete),
			TAG_CONNECT_REJECT => Ok(Packet::ConnectReject),
			TAG_CLOSE => Ok(Packet::Close),
			TAG_XZYH => {
				let channel = ChannelId(take_u8(bytes, &mut pos)?);
				let len = take_u32(bytes, &mut pos)? as usize;
				let payload = take(bytes, &mut pos, len)?.to_vec();
				Ok(Packet::Xzyh { channel, payload })
			}
			TAG_AABB => {
				let channel = ChannelId(take_u8(bytes, &mut pos)?);
				let frame_type = match take_u8(bytes, &mut pos)? {
					0 => FrameType::Begin,
					1 => FrameType::Data,
					2 => FrameType::End,
					other => return Err(Error::Codec(format!("unknown frame type {other}"))),
				};
				let position = take_u32(bytes, &mut pos)?;
				let len = take_u32(bytes, &mut pos)? as usize;
				let payload = take(bytes, &mut pos, len)?.to_vec();
				Ok(Packet::Aabb {
					channel,
					frame_type,
					position,
					payload,
				})
			}
			TAG_JSON_CMD => {
				let channel = ChannelId(take_u8(bytes, &mut pos)?);
				let command = match take_u8(bytes, &mut pos)? {
					0 => P2PCmdType::JsonCmd,
					1 => P2PCmdType::SendFile,
					other => return Err(Error::Codec(format!("unknown command type {other}"))),
				};
				let len = take_u32(bytes, &mut pos)? as usize;
				let payload = take(bytes, &mut pos, len)?.to_vec();
				Ok(Packet::JsonCmd {
					channel,
					command,
					payload,
				})
			}
			other => Err(Error::Codec(format!("unknown packet tag {other}"))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_every_frame_kind() {
		let codec = DefaultCodec::new();
		let packets = vec![
			Packet::LanSearch,
			Packet::LanSearchAck,
			Packet::HandshakeComplete,
			Packet::ConnectReject,
			Packet::Close,
			Packet::Xzyh {
				channel: ChannelId::VIDEO,
				payload: vec![1, 2, 3],
			},
			Packet::Aabb {
				channel: ChannelId::CONTROL,
				frame_type: FrameType::Data,
				position: 32768,
				payload: vec![9; 64],
			},
			Packet::JsonCmd {
				channel: ChannelId::CONTROL,
				command: P2PCmdType::JsonCmd,
				payload: b"{}".to_vec(),
			},
		];
		for p in packets {
			let bytes = codec.encode(&p).unwrap();
			let back = codec.decode(&bytes).unwrap();
			assert_eq!(format!("{:?}", p), format!("{:?}", back));
		}
	}

	#[test]
	fn rejects_truncated_input() {
		let codec = DefaultCodec::new();
		assert!(codec.decode(&[TAG_XZYH, 1]).is_err());
	}
}
