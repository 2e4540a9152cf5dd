//! The crate `protocol` defines the messages exchanged between the runtime
//! and the server roles.

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

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::layout::Layout;
use crate::types::*;

/// The server role a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Answered by every role hosted on an endpoint.
    Any,
    Layout,
    Sequencer,
    LogUnit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MsgDetail {
    Ping,

    /// Move the receiver to the epoch of the message.
    Seal,

    /// Acquire `count` addresses for `streams`, `count == 0` is a query.
    TokenReq {
        streams: BTreeSet<StreamId>,
        count: u64,
    },

    /// Install recovered sequencer state at the epoch of the message.
    SequencerBootstrap {
        global_tail: Address,
        stream_tails: BTreeMap<StreamId, Address>,
    },

    /// Keep the sequencer state of `from_epoch` at the epoch of the message.
    SequencerResume {
        from_epoch: Epoch,
    },

    Write {
        entry: LogData,
    },
    Read {
        address: Address,
    },
    FillHole {
        address: Address,
    },
    Trim {
        address: Address,
    },
    /// Trim every address up to and including `address`.
    PrefixTrim {
        address: Address,
    },
    LogTail,

    LayoutGet,
    LayoutBootstrap {
        layout: Layout,
    },
    LayoutPrepare {
        rank: Rank,
    },
    LayoutPropose {
        rank: Rank,
        layout: Layout,
    },
    LayoutCommit {
        layout: Layout,
    },
}

impl MsgDetail {
    pub fn role(&self) -> Role {
        match self {
            MsgDetail::Ping | MsgDetail::Seal => Role::Any,
            MsgDetail::TokenReq { .. }
            | MsgDetail::SequencerBootstrap { .. }
            | MsgDetail::SequencerResume { .. } => Role::Sequencer,
            MsgDetail::Write { .. }
            | MsgDetail::Read { .. }
            | MsgDetail::FillHole { .. }
            | MsgDetail::Trim { .. }
            | MsgDetail::PrefixTrim { .. }
            | MsgDetail::LogTail => Role::LogUnit,
            MsgDetail::LayoutGet
            | MsgDetail::LayoutBootstrap { .. }
            | MsgDetail::LayoutPrepare { .. }
            | MsgDetail::LayoutPropose { .. }
            | MsgDetail::LayoutCommit { .. } => Role::Layout,
        }
    }

    /// Messages which are served regardless of the epoch they carry.
    pub fn is_epoch_exempt(&self) -> bool {
        matches!(
            self,
            MsgDetail::Ping | MsgDetail::Seal | MsgDetail::LayoutGet | MsgDetail::LayoutBootstrap { .. }
        )
    }
}

impl std::fmt::Display for MsgDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match &self {
            MsgDetail::Ping => "PING",
            MsgDetail::Seal => "SEAL",
            MsgDetail::TokenReq { .. } => "TOKEN_REQ",
            MsgDetail::SequencerBootstrap { .. } => "SEQUENCER_BOOTSTRAP",
            MsgDetail::SequencerResume { .. } => "SEQUENCER_RESUME",
            MsgDetail::Write { .. } => "WRITE_REQ",
            MsgDetail::Read { .. } => "READ_REQ",
            MsgDetail::FillHole { .. } => "FILL_HOLE",
            MsgDetail::Trim { .. } => "TRIM",
            MsgDetail::PrefixTrim { .. } => "PREFIX_TRIM",
            MsgDetail::LogTail => "LOG_TAIL",
            MsgDetail::LayoutGet => "LAYOUT_GET",
            MsgDetail::LayoutBootstrap { .. } => "LAYOUT_BOOTSTRAP",
            MsgDetail::LayoutPrepare { .. } => "LAYOUT_PREPARE",
            MsgDetail::LayoutPropose { .. } => "LAYOUT_PROPOSE",
            MsgDetail::LayoutCommit { .. } => "LAYOUT_COMMIT",
        };
        write!(f, "{}", msg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The epoch of the layout the sender is working with.
    pub epoch: Epoch,
    pub request_id: u64,
    pub detail: MsgDetail,
}

impl Message {
    pub fn new(epoch: Epoch, detail: MsgDetail) -> Message {
        Message {
            epoch,
            request_id: 0,
            detail,
        }
    }

    /// Build the response to this message.
    pub fn reply(&self, epoch: Epoch, detail: ResponseDetail) -> Response {
        Response {
            epoch,
            request_id: self.request_id,
            detail,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    NotBootstrapped,
    AlreadyBootstrapped,
    InvalidLayout,
    IllegalState,
    Corrupted,
    Io,
    Unsupported,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: Token,
    /// The tails of the requested streams after issuance, or every known
    /// stream tail when a query requests no stream.
    pub stream_tails: BTreeMap<StreamId, Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseDetail {
    Ok,
    Pong,
    WrongEpoch(Epoch),
    Overwrite,
    Trimmed {
        trim_mark: Address,
    },
    Empty,
    Reject(Option<Rank>),
    /// The sequencer isn't bootstrapped at the attached epoch.
    NotReady(Epoch),
    Error {
        kind: ErrorKind,
        message: String,
    },

    Token(TokenResponse),
    ReadResult(LogData),
    Layout(Layout),
    PrepareAck {
        phase2_rank: Option<Rank>,
        proposed_layout: Option<Layout>,
    },
    Tail {
        global_tail: Address,
        trim_mark: Address,
    },
}

impl std::fmt::Display for ResponseDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match &self {
            ResponseDetail::Ok => "OK",
            ResponseDetail::Pong => "PONG",
            ResponseDetail::WrongEpoch(_) => "WRONG_EPOCH",
            ResponseDetail::Overwrite => "OVERWRITE",
            ResponseDetail::Trimmed { .. } => "TRIMMED",
            ResponseDetail::Empty => "EMPTY",
            ResponseDetail::Reject(_) => "REJECT",
            ResponseDetail::NotReady(_) => "NOT_READY",
            ResponseDetail::Error { .. } => "ERROR",
            ResponseDetail::Token(_) => "TOKEN_RESP",
            ResponseDetail::ReadResult(_) => "READ_RESP",
            ResponseDetail::Layout(_) => "LAYOUT_RESP",
            ResponseDetail::PrepareAck { .. } => "PREPARE_ACK",
            ResponseDetail::Tail { .. } => "TAIL_RESP",
        };
        write!(f, "{}", msg)
    }
}

impl ResponseDetail {
    pub fn error(kind: ErrorKind, message: String) -> ResponseDetail {
        ResponseDetail::Error { kind, message }
    }

    /// Encode a server side error as response.
    pub fn from_error(err: &Error) -> ResponseDetail {
        match err {
            Error::WrongEpoch(epoch) => ResponseDetail::WrongEpoch(*epoch),
            Error::Overwrite(_) => ResponseDetail::Overwrite,
            Error::Trimmed {
                earliest_readable, ..
            } => ResponseDetail::Trimmed {
                trim_mark: *earliest_readable,
            },
            Error::Empty(_) => ResponseDetail::Empty,
            Error::Rejected(rank) => ResponseDetail::Reject(*rank),
            Error::NotReady(epoch) => ResponseDetail::NotReady(*epoch),
            Error::NotBootstrapped => {
                ResponseDetail::error(ErrorKind::NotBootstrapped, err.to_string())
            }
            Error::AlreadyBootstrapped => {
                ResponseDetail::error(ErrorKind::AlreadyBootstrapped, err.to_string())
            }
            Error::InvalidLayout(_) => {
                ResponseDetail::error(ErrorKind::InvalidLayout, err.to_string())
            }
            Error::IllegalState(_) => {
                ResponseDetail::error(ErrorKind::IllegalState, err.to_string())
            }
            Error::Corrupted(_) => ResponseDetail::error(ErrorKind::Corrupted, err.to_string()),
            Error::Io(_) => ResponseDetail::error(ErrorKind::Io, err.to_string()),
            _ => ResponseDetail::error(ErrorKind::Internal, err.to_string()),
        }
    }

    /// Decode the error carried by a response, `address` is the address the
    /// request concerns, if any.
    pub fn into_error(self, address: Address) -> Error {
        match self {
            ResponseDetail::WrongEpoch(epoch) => Error::WrongEpoch(epoch),
            ResponseDetail::Overwrite => Error::Overwrite(address),
            ResponseDetail::Trimmed { trim_mark } => Error::Trimmed {
                address,
                earliest_readable: trim_mark,
            },
            ResponseDetail::Empty => Error::Empty(address),
            ResponseDetail::Reject(rank) => Error::Rejected(rank),
            ResponseDetail::NotReady(epoch) => Error::NotReady(epoch),
            ResponseDetail::Error { kind, message } => match kind {
                ErrorKind::NotBootstrapped => Error::NotBootstrapped,
                ErrorKind::AlreadyBootstrapped => Error::AlreadyBootstrapped,
                ErrorKind::InvalidLayout => Error::InvalidLayout(message),
                ErrorKind::IllegalState => Error::IllegalState(message),
                ErrorKind::Corrupted => Error::Corrupted(message),
                _ => Error::Server(message),
            },
            other => Error::Server(format!("unexpected response {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// The epoch of the responding server.
    pub epoch: Epoch,
    pub request_id: u64,
    pub detail: ResponseDetail,
}
