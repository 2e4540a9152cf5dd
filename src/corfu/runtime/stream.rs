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

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use log::{debug, trace};

use super::CorfuRuntime;
use crate::constant::*;
use crate::error::Error;
use crate::types::{Address, LogData, Payload, StreamId};

/// A cursor over the entries of one stream, in global address order.
///
/// Entries are located by following backpointers from the stream tail down
/// to the last address already consumed. Holes and entries without a usable
/// backpointer fall back to scanning addresses one by one.
pub struct StreamView {
    rt: Arc<CorfuRuntime>,
    id: StreamId,
    /// The address of the last entry returned.
    pointer: Address,
    /// Every member up to `resolved` has been pushed to `queue`.
    resolved: Address,
    queue: VecDeque<LogData>,
}

impl StreamView {
    pub(super) fn new(rt: Arc<CorfuRuntime>, id: StreamId) -> StreamView {
        StreamView {
            rt,
            id,
            pointer: NEVER_READ,
            resolved: NEVER_READ,
            queue: VecDeque::new(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// The address of the last entry returned, `NEVER_READ` if none.
    pub fn position(&self) -> Address {
        self.pointer
    }

    pub fn append(&self, payload: Payload) -> Result<Address, Error> {
        let mut streams = BTreeSet::new();
        streams.insert(self.id);
        self.rt.address_space().append(payload, streams)
    }

    /// Returns the next entry of the stream, `None` if the stream has no
    /// more entries yet.
    pub fn next(&mut self) -> Result<Option<LogData>, Error> {
        if self.queue.is_empty() {
            self.resolve(Address::MAX)?;
        }
        Ok(self.pop())
    }

    /// Returns every unread entry at or below `max_address`.
    pub fn read_to(&mut self, max_address: Address) -> Result<Vec<LogData>, Error> {
        self.resolve(max_address)?;
        let mut entries = Vec::new();
        while self
            .queue
            .front()
            .map(|e| e.global_address <= max_address)
            .unwrap_or(false)
        {
            if let Some(entry) = self.pop() {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn remaining(&mut self) -> Result<Vec<LogData>, Error> {
        self.read_to(Address::MAX)
    }

    /// The next read starts from `address`.
    pub fn seek(&mut self, address: Address) {
        self.queue.clear();
        self.pointer = address - 1;
        self.resolved = address - 1;
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.pointer = NEVER_READ;
        self.resolved = NEVER_READ;
    }

    fn pop(&mut self) -> Option<LogData> {
        let entry = self.queue.pop_front()?;
        self.pointer = entry.global_address;
        Some(entry)
    }

    fn stream_tail(&self) -> Result<Address, Error> {
        let mut streams = BTreeSet::new();
        streams.insert(self.id);
        let (_, resp) = self.rt.acquire_token(&streams, 0)?;
        Ok(resp
            .token
            .backpointers
            .get(&self.id)
            .cloned()
            .unwrap_or(NO_BACKPOINTER))
    }

    /// Collect members in `(resolved, min(tail, max_address)]` into the queue.
    fn resolve(&mut self, max_address: Address) -> Result<(), Error> {
        let tail = self.stream_tail()?;
        let upper = std::cmp::min(tail, max_address);
        if upper <= self.resolved {
            return Ok(());
        }

        let floor = self.resolved;
        let address_space = self.rt.address_space();
        let mut found = Vec::new();
        let mut address = upper;
        while address > floor && is_address(address) {
            let entry = match address_space.read(address) {
                Ok(entry) => entry,
                Err(Error::Trimmed {
                    earliest_readable, ..
                }) => {
                    debug!(
                        "stream {} reach trimmed address {}, earliest readable {}",
                        self.id, address, earliest_readable
                    );
                    return Err(Error::Trimmed {
                        address,
                        earliest_readable,
                    });
                }
                Err(e) => return Err(e),
            };

            if entry.contains_stream(&self.id) {
                let backpointer = entry.backpointer(&self.id);
                found.push(entry);
                match backpointer {
                    Some(NO_BACKPOINTER) => break,
                    Some(prev) if is_address(prev) && prev < address => {
                        trace!("stream {} follow {} -> {}", self.id, address, prev);
                        address = prev;
                        continue;
                    }
                    _ => {}
                }
            }
            address -= 1;
        }

        found.reverse();
        debug!(
            "stream {} resolve {} entries in ({}, {}]",
            self.id,
            found.len(),
            floor,
            upper
        );
        self.queue.extend(found);
        self.resolved = upper;
        Ok(())
    }
}
