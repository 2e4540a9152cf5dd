//! # corfu
//!
//! `corfu` is an implementation of the Corfu distributed shared log. It is
//! based on the paper:
//!
//! > CORFU: A Shared Log Design for Flash Clusters (NSDI '12)
//!
//! and the stream layer described in:
//!
//! > Tango: Distributed Data Structures over a Shared Log (SOSP '13)
//!
//! A cluster consists of three roles:
//!
//! - a sequencer hands out monotonically increasing addresses (tokens),
//!   together with the previous address of each stream of the entry
//! - log units store write-once entries, grouped into stripes which are
//!   replicated with chain replication (or quorum replication)
//! - layout servers agree on the layout of each epoch with paxos
//!
//! Clients write at the address they were issued, so appends are never
//! serialized through a leader. A reader that finds an address left empty by
//! a crashed writer fills a hole there. Streams are materialized by following
//! backpointers from the stream tail.
//!
//! The crate is transport agnostic: servers implement the `Server` trait and
//! the runtime sends messages through a `Router`.

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

extern crate byteorder;
extern crate crc;
extern crate log;
extern crate rand;
extern crate serde;
extern crate thiserror;
extern crate uuid;

mod error;
mod replication;

pub mod buffer;
pub mod constant;
pub mod datastore;
pub mod layout;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod types;

pub use crate::error::Error;
pub use crate::layout::{Layout, LayoutBuilder, LayoutSegment, LayoutStripe, ReplicationMode};
pub use crate::replication::{protocol_of, ChainReplication, QuorumReplication, ReplicationProtocol};
pub use crate::runtime::{
    AddressSpaceView, CorfuRuntime, LayoutView, LocalRouter, ManagementView, Router,
    RuntimeParameters, StreamView,
};
pub use crate::server::{LayoutServer, LogUnitServer, SequencerServer, Server, ServerNode};
pub use crate::types::{Address, DataType, Epoch, LogData, Payload, Rank, StreamId, Token};
