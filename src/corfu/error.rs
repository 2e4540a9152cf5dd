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

use std::sync::Arc;

use crate::types::{Address, Rank};

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The request carried a stale epoch, the server is at the attached epoch.
    #[error("wrong epoch, server is at epoch {0}")]
    WrongEpoch(u64),

    /// The address has already been claimed by another entry.
    #[error("address {0} already written")]
    Overwrite(Address),

    /// The address lies below the trim mark or was trimmed explicitly.
    #[error("address {address} trimmed, earliest readable address is {earliest_readable}")]
    Trimmed {
        address: Address,
        earliest_readable: Address,
    },

    /// Nothing has been written at the address yet.
    #[error("address {0} is empty")]
    Empty(Address),

    /// A paxos round was preempted by a higher rank.
    #[error("rejected by higher rank {0:?}")]
    Rejected(Option<Rank>),

    /// The sequencer hasn't recovered its state at the attached epoch.
    #[error("sequencer isn't ready at epoch {0}")]
    NotReady(u64),

    #[error("endpoint {0} disconnected")]
    Disconnected(String),

    /// The request deadline expired, the result of the request is unknown.
    #[error("request to {0} timeout")]
    Timeout(String),

    /// The acknowledgement of an append was lost, the entry may still be
    /// visible at the attached address.
    #[error("result of append at address {0} is unknown")]
    Unknown(Address),

    #[error("append failed after {0} attempts")]
    AppendFailed(usize),

    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("layout server isn't bootstrapped")]
    NotBootstrapped,

    #[error("layout server already bootstrapped")]
    AlreadyBootstrapped,

    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error("corrupted data: {0}")]
    Corrupted(String),

    #[error("serde: {0}")]
    Serde(String),

    #[error("broken io request")]
    Io(Arc<std::io::Error>),

    /// An error reported by the remote server.
    #[error("server error: {0}")]
    Server(String),
}

impl Error {
    /// Is this error caused by the transport rather than the remote server?
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Disconnected(_) | Error::Timeout(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::Serde(err.to_string())
    }
}
