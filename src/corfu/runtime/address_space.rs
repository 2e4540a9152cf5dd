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

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use super::clients::LogUnitClient;
use super::CorfuRuntime;
use crate::constant::*;
use crate::error::Error;
use crate::layout::{Layout, ReplicationMode};
use crate::replication::{protocol_of, ReplicationProtocol};
use crate::types::{Address, DataType, LogData, Payload, Rank, StreamId};

/// Caches committed entries, the oldest inserted entries are evicted first
/// once `max_bytes` is exceeded.
pub(crate) struct ReadCache {
    max_bytes: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<Address, LogData>,
    order: VecDeque<Address>,
    num_bytes: usize,
}

impl ReadCache {
    pub fn new(max_bytes: usize) -> ReadCache {
        ReadCache {
            max_bytes,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(&self, address: Address) -> Option<LogData> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(&address).cloned()
    }

    /// Only committed entries are cached.
    pub fn insert(&self, entry: &LogData) {
        match entry.data_type {
            DataType::Data | DataType::Hole | DataType::Checkpoint => {}
            _ => return,
        }
        let size = entry.size_estimate();
        if size > self.max_bytes {
            return;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.contains_key(&entry.global_address) {
            return;
        }
        while inner.num_bytes + size > self.max_bytes {
            let oldest = match inner.order.pop_front() {
                Some(address) => address,
                None => break,
            };
            if let Some(evicted) = inner.entries.remove(&oldest) {
                inner.num_bytes -= evicted.size_estimate();
            }
        }
        inner.entries.insert(entry.global_address, entry.clone());
        inner.order.push_back(entry.global_address);
        inner.num_bytes += size;
    }

    /// Drop every entry below `address`.
    pub fn evict_below(&self, address: Address) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.retain(|a, _| *a >= address);
        inner.order.retain(|a| *a >= address);
        inner.num_bytes = inner.entries.values().map(|e| e.size_estimate()).sum();
    }

    pub fn remove(&self, address: Address) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(evicted) = inner.entries.remove(&address) {
            inner.num_bytes -= evicted.size_estimate();
            inner.order.retain(|a| *a != address);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn num_bytes(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).num_bytes
    }
}

/// The global log seen as a flat array of write-once addresses.
pub struct AddressSpaceView<'a> {
    rt: &'a CorfuRuntime,
}

impl<'a> AddressSpaceView<'a> {
    pub(super) fn new(rt: &'a CorfuRuntime) -> AddressSpaceView<'a> {
        AddressSpaceView { rt }
    }

    fn replicas(
        &self,
        layout: &Layout,
        address: Address,
    ) -> Result<(ReplicationMode, Vec<LogUnitClient>), Error> {
        let (segment, stripe) = layout.stripe(address)?;
        let units = stripe
            .log_servers
            .iter()
            .map(|endpoint| self.rt.transport().log_unit(endpoint, layout.epoch))
            .collect();
        Ok((segment.replication_mode, units))
    }

    /// Append `payload` to the log as a member of `streams`, returns the
    /// address it was committed at.
    pub fn append(&self, payload: Payload, streams: BTreeSet<StreamId>) -> Result<Address, Error> {
        self.append_entry(LogData::data(payload, streams))
    }

    /// Acquire a token for `entry` and replicate it. On a position conflict
    /// a new token is acquired, an `Unknown` error means the entry may or
    /// may not be committed.
    pub fn append_entry(&self, entry: LogData) -> Result<Address, Error> {
        let params = self.rt.parameters();
        let mut attempt = 0;
        while attempt < params.write_retries {
            attempt += 1;
            let (layout, resp) = self.rt.acquire_token(&entry.streams, 1)?;

            let mut entry = entry.clone();
            entry.use_token(&resp.token);
            let address = entry.global_address;
            let (mode, _) = self.replicas(&layout, address)?;
            if mode == ReplicationMode::QuorumReplication {
                entry.rank = Some(Rank::new(layout.epoch, self.rt.client_id()));
            }

            match self.write(&layout, &entry) {
                Ok(()) => {
                    debug!(
                        "runtime {} append {} at address {}",
                        self.rt.client_id(),
                        entry.data_type,
                        address
                    );
                    self.rt.cache().insert(&entry);
                    return Ok(address);
                }
                Err(Error::Overwrite(_)) | Err(Error::Trimmed { .. }) => {
                    warn!(
                        "runtime {} lose address {}, acquire another token",
                        self.rt.client_id(),
                        address
                    );
                }
                Err(Error::WrongEpoch(epoch)) => {
                    self.rt.on_wrong_epoch(epoch)?;
                }
                Err(Error::Timeout(endpoint)) => {
                    warn!(
                        "runtime {} append at {} timeout by {}",
                        self.rt.client_id(),
                        address,
                        endpoint
                    );
                    return Err(Error::Unknown(address));
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::AppendFailed(attempt))
    }

    /// Replicate an entry already holding a token, requests without
    /// response are resent as is.
    pub fn write(&self, layout: &Layout, entry: &LogData) -> Result<(), Error> {
        let (mode, units) = self.replicas(layout, entry.global_address)?;
        let protocol = protocol_of(mode);
        let mut attempt = 0;
        loop {
            match protocol.write(&units, entry) {
                Err(Error::Timeout(endpoint)) if attempt < self.rt.parameters().transport_retries => {
                    debug!(
                        "runtime {} resend write {} to {}",
                        self.rt.client_id(),
                        entry.global_address,
                        endpoint
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Look up `address` in the read cache. Other runtimes may have trimmed
    /// the address since it was cached, so a hit is only served while it is
    /// above the trim mark of its stripe.
    fn cached(&self, address: Address) -> Result<Option<LogData>, Error> {
        let entry = match self.rt.cache().get(address) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let trim_mark = self
            .rt
            .with_layout(|layout| self.stripe_trim_mark(layout, address))?;
        if address < trim_mark {
            debug!(
                "runtime {} drop cached entries below trim mark {}",
                self.rt.client_id(),
                trim_mark
            );
            self.rt.cache().evict_below(trim_mark);
            return Err(Error::Trimmed {
                address,
                earliest_readable: trim_mark,
            });
        }
        Ok(Some(entry))
    }

    /// The highest trim mark reported by the replicas of `address`.
    fn stripe_trim_mark(&self, layout: &Layout, address: Address) -> Result<Address, Error> {
        let (_, units) = self.replicas(layout, address)?;
        let mut trim_mark = None;
        let mut last_err = None;
        for unit in &units {
            match unit.log_tail() {
                Ok((_, mark)) => {
                    trim_mark = Some(std::cmp::max(trim_mark.unwrap_or(FIRST_ADDRESS), mark))
                }
                Err(e @ Error::WrongEpoch(_)) => return Err(e),
                Err(e) => last_err = Some(e),
            }
        }
        trim_mark.ok_or_else(|| {
            last_err.unwrap_or_else(|| {
                Error::IllegalState(format!("no log unit serves address {}", address))
            })
        })
    }

    /// Read the committed entry at `address` without filling holes, `EMPTY`
    /// is returned if nothing is committed.
    pub fn peek(&self, address: Address) -> Result<LogData, Error> {
        if let Some(entry) = self.cached(address)? {
            return Ok(entry);
        }
        let entry = self.rt.with_layout(|layout| {
            let (mode, units) = self.replicas(layout, address)?;
            protocol_of(mode).peek(&units, address)
        })?;
        self.rt.cache().insert(&entry);
        Ok(entry)
    }

    /// Read the entry at `address`. If the address stays empty during the
    /// grace period, a hole is filled there and returned.
    pub fn read(&self, address: Address) -> Result<LogData, Error> {
        if !is_address(address) {
            return Err(Error::IllegalState(format!("read address {}", address)));
        }
        if let Some(entry) = self.cached(address)? {
            trace!("runtime {} read cached {}", self.rt.client_id(), address);
            return Ok(entry);
        }

        let entry = self.rt.with_layout(|layout| {
            let (mode, units) = self.replicas(layout, address)?;
            let protocol = protocol_of(mode);
            let entry = self.wait_committed(protocol, &units, address)?;
            if !entry.is_empty() {
                return Ok(entry);
            }
            warn!(
                "runtime {} address {} still empty after {:?}, fill hole",
                self.rt.client_id(),
                address,
                self.rt.parameters().hole_fill_grace
            );
            protocol.fill_hole(&units, address)
        })?;
        self.rt.cache().insert(&entry);
        Ok(entry)
    }

    /// Poll `address` until something is committed or the grace expires.
    fn wait_committed(
        &self,
        protocol: &dyn ReplicationProtocol,
        units: &[LogUnitClient],
        address: Address,
    ) -> Result<LogData, Error> {
        let grace = self.rt.parameters().hole_fill_grace;
        let step = std::cmp::max(grace / 8, Duration::from_millis(1));
        let deadline = Instant::now() + grace;
        loop {
            let entry = protocol.peek(units, address)?;
            let now = Instant::now();
            if !entry.is_empty() || now >= deadline {
                return Ok(entry);
            }
            std::thread::sleep(std::cmp::min(step, deadline - now));
        }
    }

    /// Commit a hole at `address` at once, the entry committed there is
    /// returned.
    pub fn fill_hole(&self, address: Address) -> Result<LogData, Error> {
        let entry = self.rt.with_layout(|layout| {
            let (mode, units) = self.replicas(layout, address)?;
            protocol_of(mode).fill_hole(&units, address)
        })?;
        self.rt.cache().insert(&entry);
        Ok(entry)
    }

    /// Release the space of a single address at every replica.
    pub fn trim(&self, address: Address) -> Result<(), Error> {
        self.rt.with_layout(|layout| {
            let (_, units) = self.replicas(layout, address)?;
            for unit in &units {
                unit.trim(address)?;
            }
            Ok(())
        })?;
        self.rt.cache().remove(address);
        Ok(())
    }

    /// Release every address up to `address` inclusive at every log unit.
    pub fn prefix_trim(&self, address: Address) -> Result<(), Error> {
        self.rt.with_layout(|layout| {
            let mut first_err = None;
            for endpoint in layout.log_servers() {
                let unit = self.rt.transport().log_unit(&endpoint, layout.epoch);
                match unit.prefix_trim(address) {
                    Ok(()) => {}
                    Err(e @ Error::WrongEpoch(_)) => return Err(e),
                    Err(e) => {
                        warn!(
                            "runtime {} prefix trim {} at {}: {}",
                            self.rt.client_id(),
                            address,
                            endpoint,
                            e
                        );
                        first_err.get_or_insert(e);
                    }
                }
            }
            first_err.map_or(Ok(()), Err)
        })?;
        self.rt.cache().evict_below(address + 1);
        Ok(())
    }

    /// Returns the highest address holding an entry and the trim mark, as
    /// observed by the log units of the active segment.
    pub fn log_tail(&self) -> Result<(Address, Address), Error> {
        self.rt.with_layout(|layout| {
            let segment = match layout.active_segment() {
                Some(segment) => segment,
                None => return Err(Error::InvalidLayout(String::from("no segments"))),
            };
            let mut global_tail = NON_ADDRESS;
            let mut trim_mark = FIRST_ADDRESS;
            for stripe in &segment.stripes {
                let mut answered = false;
                let mut last_err = None;
                for endpoint in &stripe.log_servers {
                    let unit = self.rt.transport().log_unit(endpoint, layout.epoch);
                    match unit.log_tail() {
                        Ok((tail, mark)) => {
                            answered = true;
                            global_tail = std::cmp::max(global_tail, tail);
                            trim_mark = std::cmp::max(trim_mark, mark);
                        }
                        Err(e @ Error::WrongEpoch(_)) => return Err(e),
                        Err(e) => last_err = Some(e),
                    }
                }
                if !answered {
                    return Err(last_err.unwrap_or_else(|| {
                        Error::InvalidLayout(String::from("empty stripe"))
                    }));
                }
            }
            Ok((global_tail, trim_mark))
        })
    }

    /// The next address the sequencer will issue.
    pub fn global_tail(&self) -> Result<Address, Error> {
        let (_, resp) = self.rt.acquire_token(&BTreeSet::new(), 0)?;
        Ok(resp.token.address)
    }

    pub fn invalidate_cache(&self) {
        self.rt.cache().evict_below(Address::MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use uuid::Uuid;

    use crate::runtime::tests::Cluster;
    use crate::types::Token;

    fn streams_of(ids: &[u128]) -> BTreeSet<StreamId> {
        ids.iter().map(|id| Uuid::from_u128(*id)).collect()
    }

    fn raw(value: &str) -> Payload {
        Payload::new("raw", value.as_bytes().to_vec())
    }

    #[test]
    fn single_append_and_read() {
        let cluster = Cluster::new(&["a"], &["a"], 0);
        let rt = cluster.bootstrap();
        let s = Uuid::from_u128(1);
        let view = rt.address_space();

        let address = view.append(raw("x"), streams_of(&[1])).unwrap();
        assert_eq!(address, 0);

        view.invalidate_cache();
        let entry = view.read(0).unwrap();
        assert_eq!(entry.payload, Some(raw("x")));
        assert_eq!(entry.streams, streams_of(&[1]));
        assert_eq!(entry.backpointer(&s), Some(NO_BACKPOINTER));
        assert_eq!(entry.is_first_entry(&s), true);
        assert_eq!(view.global_tail().unwrap(), 1);
    }

    #[test]
    fn reader_fills_hole_of_crashed_writer() {
        let cluster = Cluster::new(&["a", "b"], &["a", "b"], 0);
        let rt = cluster.bootstrap();
        let view = rt.address_space();
        for i in 0..5 {
            view.append(raw(&format!("v{}", i)), streams_of(&[1])).unwrap();
        }

        // writer A acquires address 5 and crashes.
        let layout = rt.layout().unwrap();
        let token = rt
            .sequencer(&layout)
            .unwrap()
            .token(&streams_of(&[1]), 1)
            .unwrap()
            .token;
        assert_eq!(token.address, 5);
        assert_eq!(view.peek(5).unwrap().is_empty(), true);

        let entry = view.read(5).unwrap();
        assert_eq!(entry.is_hole(), true);
        // fill again observes the same hole.
        assert_eq!(view.fill_hole(5).unwrap().is_hole(), true);

        // the slow writer A loses.
        let mut late = LogData::data(raw("late"), streams_of(&[1]));
        late.use_token(&token);
        assert_eq!(
            matches!(view.write(&layout, &late), Err(Error::Overwrite(5))),
            true
        );
    }

    #[test]
    fn reader_completes_partial_chain_write() {
        let cluster = Cluster::new(&["a", "b"], &["a", "b"], 0);
        let rt = cluster.bootstrap();
        let view = rt.address_space();

        let mut entry = LogData::data(raw("x"), streams_of(&[1]));
        entry.use_token(&Token {
            address: 0,
            epoch: 0,
            backpointers: Default::default(),
        });
        rt.transport().log_unit("a", 0).write(&entry).unwrap();
        assert_eq!(view.read(0).unwrap(), entry);
        assert_eq!(rt.transport().log_unit("b", 0).read(0).unwrap(), entry);
    }

    #[test]
    fn append_retries_after_lost_ack() {
        let cluster = Cluster::new(&["a", "b"], &["a", "b"], 0);
        let rt = cluster.bootstrap();
        let view = rt.address_space();

        // the tail applies the write but the acknowledgement is lost.
        cluster.router.drop_responses("b", 1);
        let address = view.append(raw("x"), streams_of(&[1])).unwrap();
        assert_eq!(address, 0);
        view.invalidate_cache();
        assert_eq!(view.read(0).unwrap().payload, Some(raw("x")));
        assert_eq!(view.append(raw("y"), streams_of(&[1])).unwrap(), 1);
    }

    #[test]
    fn append_result_unknown_when_acks_keep_lost() {
        // "a" is the sequencer, "b" the only log unit.
        let cluster = Cluster::new(&["a", "b"], &["b"], 0);
        let rt = cluster.bootstrap();
        let view = rt.address_space();
        // the write and its resend are both applied but not acknowledged.
        cluster.router.drop_responses("b", 2);
        let result = view.append(raw("x"), BTreeSet::new());
        assert_eq!(matches!(result, Err(Error::Unknown(0))), true);
        // the entry is committed anyway.
        assert_eq!(view.read(0).unwrap().payload, Some(raw("x")));
    }

    #[test]
    fn append_acquires_new_token_on_conflict() {
        let cluster = Cluster::new(&["a"], &["a"], 0);
        let rt = cluster.bootstrap();
        let view = rt.address_space();
        // a hole at the next address forces the writer to retry.
        rt.transport().log_unit("a", 0).fill_hole(0).unwrap();
        let address = view.append(raw("x"), streams_of(&[1])).unwrap();
        assert_eq!(address, 1);
        assert_eq!(view.read(0).unwrap().is_hole(), true);
    }

    #[test]
    fn prefix_trim_hides_addresses() {
        let cluster = Cluster::new(&["a", "b"], &["a", "b"], 0);
        let rt = cluster.bootstrap();
        let view = rt.address_space();
        for i in 0..12 {
            view.append(raw(&format!("v{}", i)), streams_of(&[1])).unwrap();
        }
        view.prefix_trim(10).unwrap();
        match view.read(5) {
            Err(Error::Trimmed {
                address,
                earliest_readable,
            }) => {
                assert_eq!(address, 5);
                assert_eq!(earliest_readable, 11);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(view.read(11).unwrap().is_data(), true);
        assert_eq!(view.log_tail().unwrap(), (11, 11));

        view.trim(11).unwrap();
        assert_eq!(matches!(view.read(11), Err(Error::Trimmed { .. })), true);
    }

    #[test]
    fn cached_entry_is_trimmed_by_other_runtime() {
        let cluster = Cluster::new(&["a", "b"], &["a", "b"], 0);
        let rt1 = cluster.bootstrap();
        let rt2 = cluster.runtime();
        let view = rt1.address_space();
        for i in 0..12 {
            view.append(raw(&format!("v{}", i)), streams_of(&[1])).unwrap();
        }
        assert_eq!(view.read(5).unwrap().is_data(), true);
        assert_eq!(rt1.cache().get(5).is_some(), true);

        rt2.address_space().prefix_trim(10).unwrap();
        match view.read(5) {
            Err(Error::Trimmed {
                address,
                earliest_readable,
            }) => {
                assert_eq!(address, 5);
                assert_eq!(earliest_readable, 11);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(matches!(view.peek(3), Err(Error::Trimmed { .. })), true);
        assert_eq!(rt1.cache().get(10).is_none(), true);
        assert_eq!(view.read(11).unwrap().is_data(), true);
    }

    #[test]
    fn read_cache_evicts_oldest() {
        let cache = ReadCache::new(400);
        for address in 0..20 {
            let mut entry = LogData::data(raw("0123456789"), BTreeSet::new());
            entry.global_address = address;
            cache.insert(&entry);
            assert_eq!(cache.num_bytes() <= 400, true);
        }
        assert_eq!(cache.get(19).is_some(), true);
        assert_eq!(cache.get(0).is_none(), true);
        cache.insert(&LogData::empty(30));
        assert_eq!(cache.get(30).is_none(), true);

        cache.evict_below(19);
        assert_eq!(cache.len(), 1);
        cache.remove(19);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.num_bytes(), 0);
    }
}
