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

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use log::{debug, info};

use super::Server;
use crate::constant::*;
use crate::error::Error;
use crate::protocol::{Message, MsgDetail, Response, ResponseDetail, TokenResponse};
use crate::types::{Address, Epoch, StreamId, Token};

#[derive(Debug)]
struct SequencerState {
    /// The next address to issue.
    global_tail: Address,
    /// The last address issued to each stream.
    stream_tails: HashMap<StreamId, Address>,
    epoch: Epoch,
    /// The last epoch the state was installed or resumed at. Tokens are only
    /// issued while it equals `epoch`.
    ready_epoch: Option<Epoch>,
}

impl SequencerState {
    fn is_ready(&self) -> bool {
        self.ready_epoch == Some(self.epoch)
    }
}

/// Issues global addresses and tracks the tail of each stream. The state
/// lives in memory only, a promoted sequencer is rebuilt from the log.
///
/// A sealed sequencer stops issuing tokens until it is bootstrapped at the
/// new epoch, or resumed if it was the ready primary of the previous one.
pub struct SequencerServer {
    endpoint: String,
    state: Mutex<SequencerState>,
}

impl SequencerServer {
    pub fn new(endpoint: &str) -> SequencerServer {
        SequencerServer {
            endpoint: String::from(endpoint),
            state: Mutex::new(SequencerState {
                global_tail: FIRST_ADDRESS,
                stream_tails: HashMap::new(),
                epoch: INITIAL_EPOCH,
                ready_epoch: None,
            }),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).epoch
    }

    pub fn global_tail(&self) -> Address {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).global_tail
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).is_ready()
    }

    fn issue(
        &self,
        epoch: Epoch,
        streams: &BTreeSet<StreamId>,
        count: u64,
    ) -> Result<ResponseDetail, Error> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if epoch != state.epoch {
            return Err(Error::WrongEpoch(state.epoch));
        }
        if !state.is_ready() {
            return Err(Error::NotReady(state.epoch));
        }

        let mut backpointers = BTreeMap::new();
        for sid in streams {
            let prev = state
                .stream_tails
                .get(sid)
                .cloned()
                .unwrap_or(NO_BACKPOINTER);
            backpointers.insert(*sid, prev);
        }

        if count == 0 {
            let stream_tails = if streams.is_empty() {
                state
                    .stream_tails
                    .iter()
                    .map(|(k, v)| (*k, *v))
                    .collect()
            } else {
                backpointers.clone()
            };
            return Ok(ResponseDetail::Token(TokenResponse {
                token: Token {
                    address: state.global_tail,
                    epoch: state.epoch,
                    backpointers,
                },
                stream_tails,
            }));
        }

        let address = state.global_tail;
        let last = address + count as Address - 1;
        let mut stream_tails = BTreeMap::new();
        for sid in streams {
            state.stream_tails.insert(*sid, last);
            stream_tails.insert(*sid, last);
        }
        state.global_tail += count as Address;
        debug!(
            "sequencer {} issue token [{}, {}] for {} streams at epoch {}",
            self.endpoint,
            address,
            last,
            streams.len(),
            state.epoch
        );
        Ok(ResponseDetail::Token(TokenResponse {
            token: Token {
                address,
                epoch: state.epoch,
                backpointers,
            },
            stream_tails,
        }))
    }

    fn seal(&self, epoch: Epoch) -> Result<ResponseDetail, Error> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if epoch < state.epoch {
            return Err(Error::WrongEpoch(state.epoch));
        }
        if epoch > state.epoch {
            info!(
                "sequencer {} sealed at epoch {}, global tail {}",
                self.endpoint, epoch, state.global_tail
            );
            state.epoch = epoch;
        }
        Ok(ResponseDetail::Ok)
    }

    /// Keep serving with the current state at `epoch`, which is only allowed
    /// if this sequencer was ready at `from_epoch`.
    fn resume(&self, epoch: Epoch, from_epoch: Epoch) -> Result<ResponseDetail, Error> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if epoch < state.epoch {
            return Err(Error::WrongEpoch(state.epoch));
        }
        if state.ready_epoch == Some(epoch) {
            return Ok(ResponseDetail::Ok);
        }
        if state.ready_epoch != Some(from_epoch) {
            debug!(
                "sequencer {} can't resume from epoch {}, ready at {:?}",
                self.endpoint, from_epoch, state.ready_epoch
            );
            return Err(Error::NotReady(state.epoch));
        }
        state.epoch = epoch;
        state.ready_epoch = Some(epoch);
        info!(
            "sequencer {} resumed at epoch {}, global tail {}",
            self.endpoint, epoch, state.global_tail
        );
        Ok(ResponseDetail::Ok)
    }

    fn bootstrap(
        &self,
        epoch: Epoch,
        global_tail: Address,
        stream_tails: &BTreeMap<StreamId, Address>,
    ) -> Result<ResponseDetail, Error> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if epoch < state.epoch {
            return Err(Error::WrongEpoch(state.epoch));
        }
        if state.ready_epoch == Some(epoch) && global_tail < state.global_tail {
            // Never hand out an address twice within an epoch.
            info!(
                "sequencer {} ignore bootstrap with tail {} below {} in epoch {}",
                self.endpoint, global_tail, state.global_tail, epoch
            );
            return Ok(ResponseDetail::Ok);
        }
        state.epoch = epoch;
        state.ready_epoch = Some(epoch);
        state.global_tail = std::cmp::max(global_tail, FIRST_ADDRESS);
        state.stream_tails = stream_tails.iter().map(|(k, v)| (*k, *v)).collect();
        info!(
            "sequencer {} bootstrapped at epoch {}, global tail {}, {} streams",
            self.endpoint,
            epoch,
            state.global_tail,
            state.stream_tails.len()
        );
        Ok(ResponseDetail::Ok)
    }
}

impl Server for SequencerServer {
    fn handle(&self, msg: Message) -> Response {
        let result = match &msg.detail {
            MsgDetail::TokenReq { streams, count } => self.issue(msg.epoch, streams, *count),
            MsgDetail::Seal => self.seal(msg.epoch),
            MsgDetail::SequencerBootstrap {
                global_tail,
                stream_tails,
            } => self.bootstrap(msg.epoch, *global_tail, stream_tails),
            MsgDetail::SequencerResume { from_epoch } => self.resume(msg.epoch, *from_epoch),
            _ => Err(Error::IllegalState(format!(
                "sequencer receive {}",
                msg.detail
            ))),
        };
        let detail = match result {
            Ok(detail) => detail,
            Err(err) => ResponseDetail::from_error(&err),
        };
        msg.reply(self.epoch(), detail)
    }
}
