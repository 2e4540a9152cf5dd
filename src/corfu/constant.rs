//! The crate `constant` defines a set constant used by corfu.

// Copyright 2021 The corfu Authors.
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

use crate::types::Address;

/// A special address used to mark an entry which hasn't been assigned a
/// position in the global log yet.
pub const UNCOMMITTED: Address = -1;

/// A special address used by readers to mark a stream which hasn't read
/// anything yet.
pub const NEVER_READ: Address = -2;

/// The backpointer of the first entry of a stream.
pub const NO_BACKPOINTER: Address = -1;

/// The global tail reported by a log unit which holds no entries.
pub const NON_ADDRESS: Address = -1;

/// The initial epoch of a bootstrapped cluster.
pub const INITIAL_EPOCH: u64 = 0;

/// The first address of the global log.
pub const FIRST_ADDRESS: Address = 0;

/// Magic number at the head of each log unit segment file, "CRFU".
pub const SEGMENT_MAGIC: u32 = 0x4352_4655;

/// The version of the on-disk segment file format.
pub const SEGMENT_FORMAT_VERSION: u16 = 1;

/// The default number of addresses covered by one segment file.
pub const DEFAULT_SEGMENT_WIDTH: u64 = 10_000;

/// The default number of times an append is retried before giving up.
pub const DEFAULT_WRITE_RETRIES: usize = 8;

/// The default number of times a request is resent to a disconnected endpoint.
pub const DEFAULT_TRANSPORT_RETRIES: usize = 3;

/// Whether `address` is a valid position in the global log.
#[inline(always)]
pub fn is_address(address: Address) -> bool {
    address >= FIRST_ADDRESS
}
