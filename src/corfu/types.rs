//! The crate `types` defines a set types used by corfu.

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

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constant::*;
use crate::error::Error;

/// A position in the global log. Non-negative values are valid positions,
/// negative values are sentinels (see `constant`).
pub type Address = i64;

/// The version of a cluster layout.
pub type Epoch = u64;

/// Streams are named by UUIDs.
pub type StreamId = Uuid;

/// A paxos ballot, ordered first by `rank` then by `client_id`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Rank {
    pub rank: u64,
    pub client_id: Uuid,
}

impl Rank {
    pub fn new(rank: u64, client_id: Uuid) -> Rank {
        Rank { rank, client_id }
    }

    /// The smallest rank owned by `client_id` which is strictly greater than
    /// `self`.
    pub fn successor(&self, client_id: Uuid) -> Rank {
        Rank {
            rank: self.rank + 1,
            client_id,
        }
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({}, {})", self.rank, self.client_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Data,
    Hole,
    Empty,
    Trimmed,
    Rank,
    Checkpoint,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            DataType::Data => "DATA",
            DataType::Hole => "HOLE",
            DataType::Empty => "EMPTY",
            DataType::Trimmed => "TRIMMED",
            DataType::Rank => "RANK",
            DataType::Checkpoint => "CHECKPOINT",
        };
        write!(f, "{}", name)
    }
}

/// An opaque serialized object plus the tag used to decode it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub type_tag: String,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new<T: Into<String>>(type_tag: T, data: Vec<u8>) -> Payload {
        Payload {
            type_tag: type_tag.into(),
            data,
        }
    }

    /// Serialize `value` as json, tagged with `type_tag`.
    pub fn encode<T: Serialize>(type_tag: &str, value: &T) -> Result<Payload, Error> {
        Ok(Payload {
            type_tag: String::from(type_tag),
            data: serde_json::to_vec(value)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("type_tag", &self.type_tag)
            .field("num_bytes", &self.data.len())
            .finish()
    }
}

/// A sequencer issued authorization to occupy one address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub address: Address,
    pub epoch: Epoch,
    /// The previous tail of each requested stream at the instant of issuance.
    pub backpointers: BTreeMap<StreamId, Address>,
}

/// An entry of the global log.
///
/// Entries are immutable once committed: the only legal transitions at a
/// log unit are `EMPTY -> DATA` and `EMPTY -> HOLE`, until the address is
/// trimmed.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogData {
    pub global_address: Address,
    pub epoch: Epoch,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub payload: Option<Payload>,
    pub streams: BTreeSet<StreamId>,
    pub backpointer_map: BTreeMap<StreamId, Address>,
    /// Only set for entries written under quorum replication.
    pub rank: Option<Rank>,
}

impl LogData {
    /// Build a data entry which hasn't been assigned a token yet.
    pub fn data(payload: Payload, streams: BTreeSet<StreamId>) -> LogData {
        LogData {
            global_address: UNCOMMITTED,
            epoch: INITIAL_EPOCH,
            data_type: DataType::Data,
            payload: Some(payload),
            streams,
            backpointer_map: BTreeMap::new(),
            rank: None,
        }
    }

    pub fn checkpoint(payload: Payload) -> LogData {
        LogData {
            data_type: DataType::Checkpoint,
            ..LogData::data(payload, BTreeSet::new())
        }
    }

    /// Holes carry no payload and no stream membership.
    pub fn hole(address: Address, epoch: Epoch) -> LogData {
        LogData {
            global_address: address,
            epoch,
            data_type: DataType::Hole,
            payload: None,
            streams: BTreeSet::new(),
            backpointer_map: BTreeMap::new(),
            rank: None,
        }
    }

    pub fn empty(address: Address) -> LogData {
        LogData {
            data_type: DataType::Empty,
            ..LogData::hole(address, INITIAL_EPOCH)
        }
    }

    pub fn trimmed(address: Address) -> LogData {
        LogData {
            data_type: DataType::Trimmed,
            ..LogData::hole(address, INITIAL_EPOCH)
        }
    }

    pub fn with_rank(mut self, rank: Rank) -> LogData {
        self.rank = Some(rank);
        self
    }

    /// Assign a given token to this log data.
    pub fn use_token(&mut self, token: &Token) {
        self.global_address = token.address;
        self.epoch = token.epoch;
        if !token.backpointers.is_empty() {
            self.backpointer_map = token.backpointers.clone();
        }
    }

    pub fn is_data(&self) -> bool {
        self.data_type == DataType::Data
    }

    pub fn is_hole(&self) -> bool {
        self.data_type == DataType::Hole
    }

    pub fn is_empty(&self) -> bool {
        self.data_type == DataType::Empty
    }

    pub fn is_trimmed(&self) -> bool {
        self.data_type == DataType::Trimmed
    }

    pub fn contains_stream(&self, stream_id: &StreamId) -> bool {
        self.streams.contains(stream_id)
    }

    /// The raw backpointer recorded for the stream, `NO_BACKPOINTER` included.
    pub fn backpointer(&self, stream_id: &StreamId) -> Option<Address> {
        self.backpointer_map.get(stream_id).cloned()
    }

    /// Whether the entry points to a previous entry of the stream.
    pub fn has_backpointer(&self, stream_id: &StreamId) -> bool {
        self.backpointer(stream_id)
            .map(is_address)
            .unwrap_or(false)
    }

    /// Whether this is the first entry of the stream.
    pub fn is_first_entry(&self, stream_id: &StreamId) -> bool {
        self.backpointer(stream_id) == Some(NO_BACKPOINTER)
    }

    /// An estimate of how large this entry is in memory, in bytes.
    pub fn size_estimate(&self) -> usize {
        let payload_size = self
            .payload
            .as_ref()
            .map(|p| p.data.len() + p.type_tag.len())
            .unwrap_or(0);
        let stream_size = self.streams.len() * 16 + self.backpointer_map.len() * 24;
        payload_size + stream_size + 48
    }
}

impl std::fmt::Debug for LogData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogData")
            .field("global_address", &self.global_address)
            .field("epoch", &self.epoch)
            .field("type", &self.data_type)
            .field("streams", &self.streams)
            .field("backpointers", &self.backpointer_map)
            .field("rank", &self.rank)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_orders_by_number_then_client() {
        let c1 = Uuid::from_u128(1);
        let c2 = Uuid::from_u128(2);
        assert_eq!(Rank::new(1, c2) < Rank::new(2, c1), true);
        assert_eq!(Rank::new(2, c1) < Rank::new(2, c2), true);
        assert_eq!(Rank::new(1, c1).successor(c2), Rank::new(2, c2));
        assert_eq!(None < Some(Rank::new(0, c1)), true);
    }

    #[test]
    fn token_assigns_address_and_backpointers() {
        let s = Uuid::from_u128(7);
        let mut streams = BTreeSet::new();
        streams.insert(s);
        let mut entry = LogData::data(Payload::new("raw", b"x".to_vec()), streams);
        assert_eq!(entry.global_address, UNCOMMITTED);

        let mut backpointers = BTreeMap::new();
        backpointers.insert(s, NO_BACKPOINTER);
        entry.use_token(&Token {
            address: 0,
            epoch: 3,
            backpointers,
        });
        assert_eq!(entry.global_address, 0);
        assert_eq!(entry.epoch, 3);
        assert_eq!(entry.is_first_entry(&s), true);
        assert_eq!(entry.has_backpointer(&s), false);
        assert_eq!(entry.backpointer(&s), Some(NO_BACKPOINTER));
    }

    #[test]
    fn hole_has_no_payload_nor_streams() {
        let hole = LogData::hole(5, 1);
        assert_eq!(hole.is_hole(), true);
        assert_eq!(hole.payload.is_none(), true);
        assert_eq!(hole.streams.is_empty(), true);
        assert_eq!(hole.backpointer_map.is_empty(), true);
    }

    #[test]
    fn payload_json_codec() {
        let payload = Payload::encode("numbers", &vec![1u32, 2, 3]).unwrap();
        assert_eq!(payload.type_tag, "numbers");
        let value: Vec<u32> = payload.decode().unwrap();
        assert_eq!(value, vec![1, 2, 3]);
    }

    #[test]
    fn data_type_serialized_as_screaming_case() {
        let json = serde_json::to_string(&LogData::hole(1, 0)).unwrap();
        assert_eq!(json.contains("\"type\":\"HOLE\""), true);
        assert_eq!(json.contains("\"globalAddress\":1"), true);
    }
}
