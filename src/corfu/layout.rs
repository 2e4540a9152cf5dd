//! The crate `layout` defines the versioned description of a cluster: which
//! endpoints host the layout servers, the sequencers, and the log units of
//! each address segment.

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

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::constant::*;
use crate::error::Error;
use crate::types::{Address, Epoch};

/// Number of acknowledgements required among `len` members.
#[inline(always)]
pub fn majority(len: usize) -> usize {
    len / 2 + 1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMode {
    ChainReplication,
    QuorumReplication,
}

/// An ordered list of log units, the head of the list is the head of the
/// chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LayoutStripe {
    pub log_servers: Vec<String>,
}

impl LayoutStripe {
    pub fn new(log_servers: Vec<String>) -> LayoutStripe {
        LayoutStripe { log_servers }
    }
}

/// An address range `[start, end)`, `end` is `None` for the tail segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LayoutSegment {
    pub start: Address,
    pub end: Option<Address>,
    pub replication_mode: ReplicationMode,
    pub stripes: Vec<LayoutStripe>,
}

impl LayoutSegment {
    pub fn contains(&self, address: Address) -> bool {
        self.start <= address && self.end.map(|end| address < end).unwrap_or(true)
    }

    /// Addresses are distributed over the stripes of a segment round-robin.
    pub fn stripe_of(&self, address: Address) -> &LayoutStripe {
        let idx = (address - self.start) as usize % self.stripes.len();
        &self.stripes[idx]
    }
}

/// Equality of layouts is structural equality of their JSON form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Layout {
    pub epoch: Epoch,
    pub layout_servers: Vec<String>,
    pub sequencers: Vec<String>,
    pub segments: Vec<LayoutSegment>,
}

impl Layout {
    /// A single segment layout covering `[0, inf)` with one chain.
    pub fn new(
        layout_servers: Vec<String>,
        sequencers: Vec<String>,
        chain: Vec<String>,
    ) -> Layout {
        Layout {
            epoch: INITIAL_EPOCH,
            layout_servers,
            sequencers,
            segments: vec![LayoutSegment {
                start: FIRST_ADDRESS,
                end: None,
                replication_mode: ReplicationMode::ChainReplication,
                stripes: vec![LayoutStripe::new(chain)],
            }],
        }
    }

    pub fn from_json(content: &str) -> Result<Layout, Error> {
        let layout: Layout = serde_json::from_str(content)?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn as_json_string(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.layout_servers.is_empty() {
            return Err(Error::InvalidLayout(String::from("no layout servers")));
        }
        if self.sequencers.is_empty() {
            return Err(Error::InvalidLayout(String::from("no sequencers")));
        }
        if self.segments.is_empty() {
            return Err(Error::InvalidLayout(String::from("no segments")));
        }
        if self.segments[0].start != FIRST_ADDRESS {
            return Err(Error::InvalidLayout(format!(
                "first segment starts at {}",
                self.segments[0].start
            )));
        }
        let last_idx = self.segments.len() - 1;
        for (idx, segment) in self.segments.iter().enumerate() {
            if segment.stripes.is_empty() {
                return Err(Error::InvalidLayout(format!(
                    "segment {} has no stripes",
                    segment.start
                )));
            }
            if segment.stripes.iter().any(|s| s.log_servers.is_empty()) {
                return Err(Error::InvalidLayout(format!(
                    "segment {} has an empty stripe",
                    segment.start
                )));
            }
            match (idx == last_idx, segment.end) {
                (true, None) => {}
                (true, Some(_)) => {
                    return Err(Error::InvalidLayout(String::from(
                        "the last segment must be open-ended",
                    )))
                }
                (false, None) => {
                    return Err(Error::InvalidLayout(format!(
                        "segment {} is open-ended but isn't the last one",
                        segment.start
                    )))
                }
                (false, Some(end)) => {
                    if end <= segment.start {
                        return Err(Error::InvalidLayout(format!(
                            "segment [{}, {}) is empty",
                            segment.start, end
                        )));
                    }
                    if self.segments[idx + 1].start != end {
                        return Err(Error::InvalidLayout(format!(
                            "segment [{}, {}) isn't contiguous with next segment at {}",
                            segment.start,
                            end,
                            self.segments[idx + 1].start
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn segment(&self, address: Address) -> Option<&LayoutSegment> {
        self.segments.iter().find(|s| s.contains(address))
    }

    /// Resolve the stripe responsible for `address`.
    pub fn stripe(&self, address: Address) -> Result<(&LayoutSegment, &LayoutStripe), Error> {
        match self.segment(address) {
            Some(segment) => Ok((segment, segment.stripe_of(address))),
            None => Err(Error::InvalidLayout(format!(
                "no segment covers address {}",
                address
            ))),
        }
    }

    /// The segment accepting new appends.
    pub fn active_segment(&self) -> Option<&LayoutSegment> {
        self.segments.last()
    }

    pub fn primary_sequencer(&self) -> Option<&str> {
        self.sequencers.first().map(|s| s.as_str())
    }

    pub fn log_servers(&self) -> BTreeSet<String> {
        self.segments
            .iter()
            .flat_map(|s| s.stripes.iter())
            .flat_map(|s| s.log_servers.iter().cloned())
            .collect()
    }

    pub fn all_servers(&self) -> BTreeSet<String> {
        let mut servers = self.log_servers();
        servers.extend(self.layout_servers.iter().cloned());
        servers.extend(self.sequencers.iter().cloned());
        servers
    }
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let json = self.as_json_string().map_err(|_| std::fmt::Error)?;
        write!(f, "{}", json)
    }
}

/// Derives the layout of the next epoch from the current one.
#[derive(Debug, Clone)]
pub struct LayoutBuilder {
    layout: Layout,
}

impl LayoutBuilder {
    pub fn new(current: &Layout) -> LayoutBuilder {
        let mut layout = current.clone();
        layout.epoch = current.epoch + 1;
        LayoutBuilder { layout }
    }

    pub fn epoch(&mut self, epoch: Epoch) -> &mut Self {
        self.layout.epoch = epoch;
        self
    }

    /// Remove a log unit from every stripe it belongs to. A stripe is never
    /// left empty.
    pub fn remove_log_unit(&mut self, endpoint: &str) -> Result<&mut Self, Error> {
        for segment in &mut self.layout.segments {
            for stripe in &mut segment.stripes {
                if stripe.log_servers.iter().any(|s| s == endpoint) {
                    if stripe.log_servers.len() == 1 {
                        return Err(Error::Unrecoverable(format!(
                            "log unit {} is the last replica of segment {}",
                            endpoint, segment.start
                        )));
                    }
                    stripe.log_servers.retain(|s| s != endpoint);
                }
            }
        }
        Ok(self)
    }

    pub fn remove_sequencer(&mut self, endpoint: &str) -> Result<&mut Self, Error> {
        if self.layout.sequencers.iter().all(|s| s == endpoint) {
            return Err(Error::Unrecoverable(format!(
                "sequencer {} is the last sequencer",
                endpoint
            )));
        }
        self.layout.sequencers.retain(|s| s != endpoint);
        Ok(self)
    }

    /// Remove a layout server, the remaining ones must still form a majority
    /// of the current ensemble.
    pub fn remove_layout_server(&mut self, endpoint: &str) -> Result<&mut Self, Error> {
        let total = self.layout.layout_servers.len();
        let remains = self
            .layout
            .layout_servers
            .iter()
            .filter(|s| *s != endpoint)
            .count();
        if remains < majority(total) {
            return Err(Error::Unrecoverable(format!(
                "removing layout server {} breaks the majority",
                endpoint
            )));
        }
        self.layout.layout_servers.retain(|s| s != endpoint);
        Ok(self)
    }

    pub fn add_sequencer(&mut self, endpoint: &str) -> &mut Self {
        if !self.layout.sequencers.iter().any(|s| s == endpoint) {
            self.layout.sequencers.push(String::from(endpoint));
        }
        self
    }

    /// Close the tail segment at `start` and open a new tail segment served
    /// by `stripes`.
    pub fn open_segment(
        &mut self,
        start: Address,
        replication_mode: ReplicationMode,
        stripes: Vec<LayoutStripe>,
    ) -> Result<&mut Self, Error> {
        let last = match self.layout.segments.last_mut() {
            Some(last) => last,
            None => return Err(Error::InvalidLayout(String::from("no segments"))),
        };
        if start <= last.start {
            return Err(Error::InvalidLayout(format!(
                "new segment start {} must be above {}",
                start, last.start
            )));
        }
        last.end = Some(start);
        self.layout.segments.push(LayoutSegment {
            start,
            end: None,
            replication_mode,
            stripes,
        });
        Ok(self)
    }

    pub fn build(&self) -> Result<Layout, Error> {
        self.layout.validate()?;
        Ok(self.layout.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| String::from(*s)).collect()
    }

    fn sample_layout() -> Layout {
        Layout::new(
            endpoints(&["a:1", "b:1", "c:1"]),
            endpoints(&["a:1", "b:1"]),
            endpoints(&["a:1", "b:1", "c:1"]),
        )
    }

    #[test]
    fn json_format() {
        let layout = sample_layout();
        let json = layout.as_json_string().unwrap();
        assert_eq!(layout.to_string(), json);
        assert_eq!(json.contains("\"layoutServers\""), true);
        assert_eq!(json.contains("\"replicationMode\":\"CHAIN_REPLICATION\""), true);
        assert_eq!(json.contains("\"end\":null"), true);
        assert_eq!(json.contains("\"logServers\""), true);

        let parsed = Layout::from_json(&json).unwrap();
        assert_eq!(parsed, layout);
    }

    #[test]
    fn validate_rejects_gaps_and_open_ends() {
        let mut layout = sample_layout();
        layout.segments[0].start = 1;
        assert_eq!(layout.validate().is_err(), true);

        let mut layout = sample_layout();
        layout.segments.push(layout.segments[0].clone());
        assert_eq!(layout.validate().is_err(), true);

        let mut layout = sample_layout();
        layout.segments[0].end = Some(10);
        assert_eq!(layout.validate().is_err(), true);

        let mut layout = sample_layout();
        layout.segments[0].stripes[0].log_servers.clear();
        assert_eq!(layout.validate().is_err(), true);
    }

    #[test]
    fn resolve_stripe_of_address() {
        let mut builder = LayoutBuilder::new(&sample_layout());
        builder
            .open_segment(
                100,
                ReplicationMode::ChainReplication,
                vec![
                    LayoutStripe::new(endpoints(&["d:1"])),
                    LayoutStripe::new(endpoints(&["e:1"])),
                ],
            )
            .unwrap();
        let layout = builder.build().unwrap();
        assert_eq!(layout.epoch, 1);
        assert_eq!(layout.segments[0].end, Some(100));

        let (segment, stripe) = layout.stripe(5).unwrap();
        assert_eq!(segment.start, 0);
        assert_eq!(stripe.log_servers.len(), 3);

        let (_, stripe) = layout.stripe(100).unwrap();
        assert_eq!(stripe.log_servers, endpoints(&["d:1"]));
        let (_, stripe) = layout.stripe(101).unwrap();
        assert_eq!(stripe.log_servers, endpoints(&["e:1"]));
        assert_eq!(layout.stripe(-1).is_err(), true);
    }

    #[test]
    fn remove_failed_members() {
        let layout = sample_layout();
        let mut builder = LayoutBuilder::new(&layout);
        builder.remove_log_unit("b:1").unwrap();
        builder.remove_sequencer("a:1").unwrap();
        builder.remove_layout_server("c:1").unwrap();
        let next = builder.build().unwrap();
        assert_eq!(next.epoch, layout.epoch + 1);
        assert_eq!(next.segments[0].stripes[0].log_servers, endpoints(&["a:1", "c:1"]));
        assert_eq!(next.primary_sequencer(), Some("b:1"));
        assert_eq!(next.layout_servers, endpoints(&["a:1", "b:1"]));

        // b:1 can't be removed, only one sequencer left.
        assert_eq!(builder.remove_sequencer("b:1").is_err(), true);
        // removing another layout server breaks the majority of three.
        assert_eq!(builder.remove_layout_server("b:1").is_err(), true);
    }
}
