//! The crate `replication` implements how an entry is replicated over the
//! log units of a stripe.

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

use log::{debug, warn};

use crate::error::Error;
use crate::layout::{majority, ReplicationMode};
use crate::runtime::clients::LogUnitClient;
use crate::types::{Address, DataType, LogData};

pub trait ReplicationProtocol: Send + Sync {
    /// Replicate `entry` to `units`, the entry is committed once this
    /// returns `Ok`.
    fn write(&self, units: &[LogUnitClient], entry: &LogData) -> Result<(), Error>;

    /// Read the committed entry at `address`, an `EMPTY` entry is returned if
    /// nothing is committed there yet.
    fn peek(&self, units: &[LogUnitClient], address: Address) -> Result<LogData, Error>;

    /// Commit a hole at `address`. If a writer already placed data there,
    /// the data is completed and returned instead.
    fn fill_hole(&self, units: &[LogUnitClient], address: Address) -> Result<LogData, Error>;
}

pub fn protocol_of(mode: ReplicationMode) -> &'static dyn ReplicationProtocol {
    match mode {
        ReplicationMode::ChainReplication => &ChainReplication,
        ReplicationMode::QuorumReplication => &QuorumReplication,
    }
}

fn has_payload(entry: &LogData) -> bool {
    entry.data_type == DataType::Data || entry.data_type == DataType::Checkpoint
}

fn empty_stripe(address: Address) -> Error {
    Error::IllegalState(format!("no log unit serves address {}", address))
}

/// Writes go from the head to the tail of the chain, reads are served by the
/// tail.
pub struct ChainReplication;

impl ReplicationProtocol for ChainReplication {
    fn write(&self, units: &[LogUnitClient], entry: &LogData) -> Result<(), Error> {
        if units.is_empty() {
            return Err(empty_stripe(entry.global_address));
        }
        for unit in units {
            unit.write(entry)?;
        }
        Ok(())
    }

    fn peek(&self, units: &[LogUnitClient], address: Address) -> Result<LogData, Error> {
        match units.last() {
            Some(tail) => tail.read(address),
            None => Err(empty_stripe(address)),
        }
    }

    /// The address is not sealed before the hole is filled. Units are
    /// write-once, so whatever the head of the chain holds first is the
    /// decided entry, and it is copied down the rest of the chain.
    fn fill_hole(&self, units: &[LogUnitClient], address: Address) -> Result<LogData, Error> {
        let epoch = match units.first() {
            Some(head) => head.epoch(),
            None => return Err(empty_stripe(address)),
        };

        let mut found: Option<LogData> = None;
        for (idx, unit) in units.iter().enumerate() {
            if let Some(entry) = &found {
                match unit.write(entry) {
                    Ok(()) => continue,
                    // The writer's epoch was sealed, the head keeps the
                    // decided value and later readers resolve it the same way.
                    Err(Error::WrongEpoch(_)) => break,
                    Err(e) => return Err(e),
                }
            }
            match unit.fill_hole(address) {
                Ok(()) => {}
                Err(Error::Overwrite(_)) => {
                    let existing = unit.read(address)?;
                    if !has_payload(&existing) {
                        continue;
                    }
                    if idx > 0 {
                        warn!(
                            "address {} holds data at {} but holes upstream",
                            address,
                            unit.endpoint()
                        );
                        return Err(Error::Overwrite(address));
                    }
                    debug!(
                        "address {} was written by a slow writer, complete it",
                        address
                    );
                    found = Some(existing);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(found.unwrap_or_else(|| LogData::hole(address, epoch)))
    }
}

/// Writes and reads are served by a majority of the stripe. Log units are
/// write-once, so at most one entry can be held by a majority of a stripe,
/// and that entry is the committed one.
pub struct QuorumReplication;

/// The entries a stripe holds at a single address.
struct Votes {
    responses: usize,
    entries: Vec<LogData>,
}

impl Votes {
    /// The entry held by a majority of `width` replicas. Should two entries
    /// both reach a majority, the highest rank wins.
    fn decided(&self, width: usize) -> Option<LogData> {
        let quorum = majority(width);
        let mut decided: Option<&LogData> = None;
        for entry in &self.entries {
            if entry.is_empty() {
                continue;
            }
            let count = self.entries.iter().filter(|e| *e == entry).count();
            if count < quorum {
                continue;
            }
            decided = match decided {
                Some(current) if current.rank >= entry.rank => Some(current),
                _ => Some(entry),
            };
        }
        decided.cloned()
    }
}

impl QuorumReplication {
    fn collect(&self, units: &[LogUnitClient], address: Address) -> Result<Votes, Error> {
        if units.is_empty() {
            return Err(empty_stripe(address));
        }
        let mut entries = Vec::with_capacity(units.len());
        let mut last_err = None;
        for unit in units {
            match unit.read(address) {
                Ok(entry) => entries.push(entry),
                Err(e @ Error::Trimmed { .. }) => return Err(e),
                Err(Error::WrongEpoch(epoch)) => return Err(Error::WrongEpoch(epoch)),
                Err(e) => last_err = Some(e),
            }
        }
        if entries.len() < majority(units.len()) {
            return Err(last_err.unwrap_or_else(|| {
                Error::Unrecoverable(format!("no quorum for {}", address))
            }));
        }
        Ok(Votes {
            responses: entries.len(),
            entries,
        })
    }
}

impl ReplicationProtocol for QuorumReplication {
    fn write(&self, units: &[LogUnitClient], entry: &LogData) -> Result<(), Error> {
        if units.is_empty() {
            return Err(empty_stripe(entry.global_address));
        }
        let mut acks = 0;
        let mut conflicts = 0;
        let mut last_err = None;
        for unit in units {
            match unit.write(entry) {
                Ok(()) => acks += 1,
                Err(Error::Overwrite(_)) => conflicts += 1,
                Err(Error::WrongEpoch(epoch)) => return Err(Error::WrongEpoch(epoch)),
                Err(e) => last_err = Some(e),
            }
        }
        if acks >= majority(units.len()) {
            Ok(())
        } else if conflicts > 0 {
            Err(Error::Overwrite(entry.global_address))
        } else {
            Err(last_err.unwrap_or_else(|| {
                Error::Unrecoverable(format!("no quorum for {}", entry.global_address))
            }))
        }
    }

    fn peek(&self, units: &[LogUnitClient], address: Address) -> Result<LogData, Error> {
        let votes = self.collect(units, address)?;
        Ok(votes
            .decided(units.len())
            .unwrap_or_else(|| LogData::empty(address)))
    }

    /// Holes are written to every replica still empty. A payload only
    /// survives if its writer already reached a majority.
    fn fill_hole(&self, units: &[LogUnitClient], address: Address) -> Result<LogData, Error> {
        let votes = self.collect(units, address)?;
        if let Some(entry) = votes.decided(units.len()) {
            return Ok(entry);
        }

        for unit in units {
            match unit.fill_hole(address) {
                Ok(()) | Err(Error::Overwrite(_)) => {}
                Err(Error::WrongEpoch(epoch)) => return Err(Error::WrongEpoch(epoch)),
                Err(e) => warn!("fill hole {} at {}: {}", address, unit.endpoint(), e),
            }
        }

        let votes = self.collect(units, address)?;
        match votes.decided(units.len()) {
            Some(entry) => {
                if has_payload(&entry) {
                    debug!("address {} was committed by a racing writer", address);
                }
                Ok(entry)
            }
            None => Err(Error::Unrecoverable(format!(
                "address {} has no majority after filling hole, {} of {} replicas answered",
                address,
                votes.responses,
                units.len()
            ))),
        }
    }
}
