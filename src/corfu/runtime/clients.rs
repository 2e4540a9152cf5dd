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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use rand::Rng;

use super::router::Router;
use super::RuntimeParameters;
use crate::error::Error;
use crate::layout::Layout;
use crate::protocol::{Message, MsgDetail, ResponseDetail, TokenResponse};
use crate::types::{Address, Epoch, LogData, Rank, StreamId};

/// Exponential backoff with random jitter, bounded by `max_ms`.
pub fn backoff(base_ms: u64, max_ms: u64, attempt: usize) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << std::cmp::min(attempt, 16));
    let jitter = if base_ms > 0 {
        rand::thread_rng().gen_range(0..=base_ms)
    } else {
        0
    };
    Duration::from_millis(std::cmp::min(exp, max_ms) + jitter)
}

/// Sends messages through a `Router`, undelivered messages are resent with
/// exponential backoff.
#[derive(Clone)]
pub struct Transport {
    router: Arc<dyn Router>,
    request_timeout: Duration,
    retries: usize,
    base_backoff_ms: u64,
    max_backoff_ms: u64,
    next_request_id: Arc<AtomicU64>,
}

impl Transport {
    pub fn new(router: Arc<dyn Router>, params: &RuntimeParameters) -> Transport {
        Transport {
            router,
            request_timeout: params.request_timeout,
            retries: params.transport_retries,
            base_backoff_ms: params.base_backoff_ms,
            max_backoff_ms: params.max_backoff_ms,
            next_request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn call(&self, endpoint: &str, epoch: Epoch, detail: MsgDetail) -> Result<ResponseDetail, Error> {
        let mut attempt = 0;
        loop {
            let mut msg = Message::new(epoch, detail.clone());
            msg.request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            match self.router.send(endpoint, msg, self.request_timeout) {
                Ok(resp) => return Ok(resp.detail),
                Err(Error::Disconnected(_)) if attempt < self.retries => {
                    let wait = backoff(self.base_backoff_ms, self.max_backoff_ms, attempt);
                    warn!(
                        "send {} to {} failed, retry after {:?}",
                        detail, endpoint, wait
                    );
                    std::thread::sleep(wait);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn base(&self, endpoint: &str) -> BaseClient {
        BaseClient {
            transport: self.clone(),
            endpoint: String::from(endpoint),
        }
    }

    pub fn layout_server(&self, endpoint: &str, epoch: Epoch) -> LayoutClient {
        LayoutClient {
            transport: self.clone(),
            endpoint: String::from(endpoint),
            epoch,
        }
    }

    pub fn sequencer(&self, endpoint: &str, epoch: Epoch) -> SequencerClient {
        SequencerClient {
            transport: self.clone(),
            endpoint: String::from(endpoint),
            epoch,
        }
    }

    pub fn log_unit(&self, endpoint: &str, epoch: Epoch) -> LogUnitClient {
        LogUnitClient {
            transport: self.clone(),
            endpoint: String::from(endpoint),
            epoch,
        }
    }
}

fn expect_ok(detail: ResponseDetail, address: Address) -> Result<(), Error> {
    match detail {
        ResponseDetail::Ok => Ok(()),
        other => Err(other.into_error(address)),
    }
}

/// Requests served by every role.
pub struct BaseClient {
    transport: Transport,
    endpoint: String,
}

impl BaseClient {
    /// Returns the epoch of the endpoint. Pings are never resent, an
    /// unreachable endpoint is reported at once.
    pub fn ping(&self) -> Result<Epoch, Error> {
        let mut msg = Message::new(0, MsgDetail::Ping);
        msg.request_id = self.transport.next_request_id.fetch_add(1, Ordering::Relaxed);
        let resp = self
            .transport
            .router
            .send(&self.endpoint, msg, self.transport.request_timeout)?;
        match resp.detail {
            ResponseDetail::Pong => Ok(resp.epoch),
            other => Err(other.into_error(-1)),
        }
    }

    /// Move every role of the endpoint to `epoch`.
    pub fn seal(&self, epoch: Epoch) -> Result<(), Error> {
        let detail = self.transport.call(&self.endpoint, epoch, MsgDetail::Seal)?;
        expect_ok(detail, -1)
    }
}

pub struct LayoutClient {
    transport: Transport,
    endpoint: String,
    epoch: Epoch,
}

impl LayoutClient {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn call(&self, detail: MsgDetail) -> Result<ResponseDetail, Error> {
        self.transport.call(&self.endpoint, self.epoch, detail)
    }

    pub fn get_layout(&self) -> Result<Layout, Error> {
        match self.call(MsgDetail::LayoutGet)? {
            ResponseDetail::Layout(layout) => Ok(layout),
            other => Err(other.into_error(-1)),
        }
    }

    pub fn bootstrap(&self, layout: &Layout) -> Result<(), Error> {
        let detail = self.call(MsgDetail::LayoutBootstrap {
            layout: layout.clone(),
        })?;
        expect_ok(detail, -1)
    }

    /// Returns the rank and value accepted by the layout server, if any.
    pub fn prepare(&self, rank: Rank) -> Result<(Option<Rank>, Option<Layout>), Error> {
        match self.call(MsgDetail::LayoutPrepare { rank })? {
            ResponseDetail::PrepareAck {
                phase2_rank,
                proposed_layout,
            } => Ok((phase2_rank, proposed_layout)),
            other => Err(other.into_error(-1)),
        }
    }

    pub fn propose(&self, rank: Rank, layout: &Layout) -> Result<(), Error> {
        let detail = self.call(MsgDetail::LayoutPropose {
            rank,
            layout: layout.clone(),
        })?;
        expect_ok(detail, -1)
    }

    pub fn commit(&self, layout: &Layout) -> Result<(), Error> {
        let detail = self.call(MsgDetail::LayoutCommit {
            layout: layout.clone(),
        })?;
        expect_ok(detail, -1)
    }
}

pub struct SequencerClient {
    transport: Transport,
    endpoint: String,
    epoch: Epoch,
}

impl SequencerClient {
    pub fn token(&self, streams: &BTreeSet<StreamId>, count: u64) -> Result<TokenResponse, Error> {
        let detail = self.transport.call(
            &self.endpoint,
            self.epoch,
            MsgDetail::TokenReq {
                streams: streams.clone(),
                count,
            },
        )?;
        match detail {
            ResponseDetail::Token(resp) => Ok(resp),
            other => Err(other.into_error(-1)),
        }
    }

    pub fn bootstrap(&self, global_tail: Address, stream_tails: BTreeMap<StreamId, Address>) -> Result<(), Error> {
        let detail = self.transport.call(
            &self.endpoint,
            self.epoch,
            MsgDetail::SequencerBootstrap {
                global_tail,
                stream_tails,
            },
        )?;
        expect_ok(detail, -1)
    }

    /// Ask the sequencer to keep its state at the epoch of this client. It
    /// refuses with `NotReady` unless it was ready at `from_epoch`.
    pub fn resume(&self, from_epoch: Epoch) -> Result<(), Error> {
        let detail = self.transport.call(
            &self.endpoint,
            self.epoch,
            MsgDetail::SequencerResume { from_epoch },
        )?;
        expect_ok(detail, -1)
    }
}

#[derive(Clone)]
pub struct LogUnitClient {
    transport: Transport,
    endpoint: String,
    epoch: Epoch,
}

impl LogUnitClient {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn call(&self, detail: MsgDetail) -> Result<ResponseDetail, Error> {
        self.transport.call(&self.endpoint, self.epoch, detail)
    }

    pub fn write(&self, entry: &LogData) -> Result<(), Error> {
        let detail = self.call(MsgDetail::Write {
            entry: entry.clone(),
        })?;
        expect_ok(detail, entry.global_address)
    }

    /// Read the entry at `address`, an unwritten address yields an `EMPTY`
    /// entry.
    pub fn read(&self, address: Address) -> Result<LogData, Error> {
        match self.call(MsgDetail::Read { address })? {
            ResponseDetail::ReadResult(entry) => Ok(entry),
            ResponseDetail::Empty => Ok(LogData::empty(address)),
            other => Err(other.into_error(address)),
        }
    }

    pub fn fill_hole(&self, address: Address) -> Result<(), Error> {
        let detail = self.call(MsgDetail::FillHole { address })?;
        expect_ok(detail, address)
    }

    pub fn trim(&self, address: Address) -> Result<(), Error> {
        let detail = self.call(MsgDetail::Trim { address })?;
        expect_ok(detail, address)
    }

    pub fn prefix_trim(&self, address: Address) -> Result<(), Error> {
        let detail = self.call(MsgDetail::PrefixTrim { address })?;
        expect_ok(detail, address)
    }

    /// Returns the global tail and the trim mark of the log unit.
    pub fn log_tail(&self) -> Result<(Address, Address), Error> {
        match self.call(MsgDetail::LogTail)? {
            ResponseDetail::Tail {
                global_tail,
                trim_mark,
            } => Ok((global_tail, trim_mark)),
            other => Err(other.into_error(-1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded() {
        for attempt in 0..40 {
            let wait = backoff(10, 1000, attempt);
            assert_eq!(wait <= Duration::from_millis(1010), true);
        }
        assert_eq!(backoff(10, 1000, 0) >= Duration::from_millis(10), true);
        assert_eq!(backoff(0, 1000, 3), Duration::from_millis(0));
    }
}
