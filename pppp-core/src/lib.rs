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

//! Client library for a consumer 3D printer's UDP-based P2P protocol: the
//! session transport, a generic supervised service runtime, and the three
//! workloads that run on top of it (P2P keep-alive, file transfer, video).

pub mod channel;
pub mod config;
pub mod error;
pub mod file_transfer;
pub mod p2p_service;
pub mod protocol;
pub mod rate_limiter;
pub mod registry;
pub mod service;
pub mod session;
pub mod util;
pub mod video;

pub use error::{Error, Result};
