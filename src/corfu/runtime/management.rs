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
use std::sync::Arc;

use log::{debug, info, warn};

use super::{CheckpointRecord, CorfuRuntime, CHECKPOINT_TYPE_TAG};
use crate::constant::*;
use crate::error::Error;
use crate::layout::{Layout, LayoutBuilder};
use crate::types::{Address, DataType, StreamId};

/// Detects failed servers and moves the cluster to a layout without them.
pub struct ManagementView<'a> {
    rt: &'a CorfuRuntime,
}

impl<'a> ManagementView<'a> {
    pub(super) fn new(rt: &'a CorfuRuntime) -> ManagementView<'a> {
        ManagementView { rt }
    }

    /// Returns the endpoints of the current layout which don't answer a ping.
    pub fn detect_failures(&self) -> Result<BTreeSet<String>, Error> {
        let layout = self.rt.layout()?;
        let mut failed = BTreeSet::new();
        for endpoint in layout.all_servers() {
            match self.rt.transport().base(&endpoint).ping() {
                Ok(epoch) => debug!(
                    "runtime {} ping {}: epoch {}",
                    self.rt.client_id(),
                    endpoint,
                    epoch
                ),
                Err(e) => {
                    warn!(
                        "runtime {} detect failure of {}: {}",
                        self.rt.client_id(),
                        endpoint,
                        e
                    );
                    failed.insert(endpoint);
                }
            }
        }
        Ok(failed)
    }

    /// Derive the layout of the next epoch without `failed` and install it.
    pub fn handle_failures(&self, failed: &BTreeSet<String>) -> Result<Arc<Layout>, Error> {
        let current = self.rt.layout()?;
        let mut builder = LayoutBuilder::new(&current);
        let log_servers = current.log_servers();
        for endpoint in failed {
            if log_servers.contains(endpoint) {
                builder.remove_log_unit(endpoint)?;
            }
            if current.sequencers.contains(endpoint) {
                builder.remove_sequencer(endpoint)?;
            }
            if current.layout_servers.contains(endpoint) {
                builder.remove_layout_server(endpoint)?;
            }
        }
        let next = builder.build()?;

        self.rt.layout_view().reconfigure(next)
    }

    /// Make the primary sequencer of `installed` issue tokens. A primary
    /// kept from `previous` resumes with its own state, a new one is
    /// recovered from the log.
    pub fn ready_sequencer(&self, previous: &Layout, installed: &Layout) -> Result<(), Error> {
        if installed.primary_sequencer() == previous.primary_sequencer() {
            match self.rt.sequencer(installed)?.resume(previous.epoch) {
                Ok(()) => return Ok(()),
                Err(Error::NotReady(_)) => warn!(
                    "runtime {} sequencer wasn't ready at epoch {}, recover it",
                    self.rt.client_id(),
                    previous.epoch
                ),
                Err(e) => return Err(e),
            }
        } else {
            info!(
                "runtime {} primary sequencer moved from {:?} to {:?}",
                self.rt.client_id(),
                previous.primary_sequencer(),
                installed.primary_sequencer()
            );
        }
        self.recover_sequencer().map(|_| ())
    }

    /// Detect failures and reconfigure if any. Returns the new layout if the
    /// layout changed.
    pub fn check_and_heal(&self) -> Result<Option<Arc<Layout>>, Error> {
        let failed = self.detect_failures()?;
        if failed.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.handle_failures(&failed)?))
    }

    /// Rebuild the state of the primary sequencer from the log units. The
    /// log is scanned backward from its tail until the latest checkpoint or
    /// the trim mark. Returns the global tail installed.
    pub fn recover_sequencer(&self) -> Result<Address, Error> {
        let address_space = self.rt.address_space();
        let (tail, trim_mark) = address_space.log_tail()?;

        let mut stream_tails: BTreeMap<StreamId, Address> = BTreeMap::new();
        let mut checkpoint: Option<CheckpointRecord> = None;
        let mut floor = trim_mark;
        let mut address = tail;
        while address >= floor && is_address(address) {
            let entry = match address_space.peek(address) {
                Ok(entry) => entry,
                Err(Error::Trimmed { .. }) => {
                    address -= 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match entry.data_type {
                DataType::Checkpoint if checkpoint.is_none() => {
                    let record: CheckpointRecord = match &entry.payload {
                        Some(payload) if payload.type_tag == CHECKPOINT_TYPE_TAG => payload.decode()?,
                        _ => {
                            return Err(Error::Corrupted(format!(
                                "checkpoint at {} without record",
                                address
                            )))
                        }
                    };
                    debug!(
                        "runtime {} found checkpoint at {}, snapshot address {}",
                        self.rt.client_id(),
                        address,
                        record.snapshot_address
                    );
                    floor = std::cmp::max(floor, record.snapshot_address);
                    checkpoint = Some(record);
                }
                DataType::Data => {
                    for stream in &entry.streams {
                        stream_tails.entry(*stream).or_insert(address);
                    }
                }
                _ => {}
            }
            address -= 1;
        }
        if let Some(record) = checkpoint {
            for (stream, tail) in record.stream_tails {
                stream_tails.entry(stream).or_insert(tail);
            }
        }

        let global_tail = std::cmp::max(tail + 1, trim_mark);
        let num_streams = stream_tails.len();
        self.rt
            .with_layout(|layout| self.rt.sequencer(layout)?.bootstrap(global_tail, stream_tails.clone()))?;
        info!(
            "runtime {} recovered sequencer with global tail {} and {} streams",
            self.rt.client_id(),
            global_tail,
            num_streams
        );
        Ok(global_tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use uuid::Uuid;

    use std::time::Duration;

    use crate::runtime::tests::Cluster;
    use crate::runtime::RuntimeParameters;
    use crate::types::Payload;

    fn raw(value: &str) -> Payload {
        Payload::new("raw", value.as_bytes().to_vec())
    }

    fn only(id: u128) -> BTreeSet<StreamId> {
        let mut streams = BTreeSet::new();
        streams.insert(Uuid::from_u128(id));
        streams
    }

    #[test]
    fn healthy_cluster_is_left_alone() {
        let cluster = Cluster::new(&["a", "b", "c"], &["a", "b", "c"], 0);
        let rt = cluster.bootstrap();
        assert_eq!(rt.management_view().check_and_heal().unwrap().is_none(), true);
        assert_eq!(rt.layout().unwrap().epoch, 0);
    }

    #[test]
    fn remove_failed_log_unit() {
        let cluster = Cluster::new(&["a", "b", "c"], &["a", "b", "c"], 0);
        let rt = cluster.bootstrap();
        let view = rt.address_space();
        for i in 0..4 {
            view.append(raw(&format!("v{}", i)), only(1)).unwrap();
        }

        cluster.router.disconnect("c");
        let failed = rt.management_view().detect_failures().unwrap();
        let expected: BTreeSet<String> = vec![String::from("c")].into_iter().collect();
        assert_eq!(failed, expected);
        let layout = rt.management_view().check_and_heal().unwrap().unwrap();
        assert_eq!(layout.epoch, 1);
        assert_eq!(layout.segments[0].stripes[0].log_servers, vec!["a", "b"]);
        assert_eq!(layout.layout_servers, vec!["a", "b"]);

        view.invalidate_cache();
        assert_eq!(view.read(3).unwrap().payload, Some(raw("v3")));
        assert_eq!(view.append(raw("v4"), only(1)).unwrap(), 4);
    }

    #[test]
    fn sequencer_failover_recovers_from_checkpoint() {
        let cluster = Cluster::new(&["a", "b", "c"], &["a", "b", "c"], 0);
        let rt = cluster.bootstrap();
        let view = rt.address_space();
        let (s1, s2) = (Uuid::from_u128(1), Uuid::from_u128(2));

        view.append(raw("x0"), only(1)).unwrap();
        view.append(raw("x1"), only(1)).unwrap();
        assert_eq!(rt.checkpoint().unwrap(), 2);
        view.append(raw("y3"), only(2)).unwrap();
        // s1 is only known through the checkpoint now.
        view.prefix_trim(1).unwrap();

        cluster.router.disconnect("a");
        let layout = rt.management_view().check_and_heal().unwrap().unwrap();
        assert_eq!(layout.primary_sequencer(), Some("b"));

        let next = rt.address_space().global_tail().unwrap();
        assert_eq!(next, 4);
        let address = rt.stream(s1).append(raw("x4")).unwrap();
        assert_eq!(address, 4);
        let entry = view.read(4).unwrap();
        assert_eq!(entry.backpointer(&s1), Some(1));
        let address = rt.stream(s2).append(raw("y5")).unwrap();
        assert_eq!(view.read(address).unwrap().backpointer(&s2), Some(3));
    }

    #[test]
    fn promoted_sequencer_refuses_tokens_until_recovered() {
        let cluster = Cluster::new(&["a", "b", "c"], &["a", "b", "c"], 0);
        let rt = cluster.bootstrap();
        let view = rt.address_space();
        let s = Uuid::from_u128(1);
        for i in 0..3 {
            view.append(raw(&format!("x{}", i)), only(1)).unwrap();
        }

        // commit a layout promoting b without recovering its state.
        let current = rt.layout().unwrap();
        let next = LayoutBuilder::new(&current)
            .remove_sequencer("a")
            .unwrap()
            .build()
            .unwrap();
        let layout_view = rt.layout_view();
        layout_view.seal(&current, &next).unwrap();
        let committed = layout_view.update_layout(&current, &next).unwrap();
        assert_eq!(committed.primary_sequencer(), Some("b"));

        let other = cluster.runtime_with(RuntimeParameters {
            epoch_timeout: Duration::from_millis(50),
            ..Cluster::params()
        });
        assert_eq!(
            matches!(
                other.address_space().append(raw("early"), only(1)),
                Err(Error::NotReady(1))
            ),
            true
        );
        assert_eq!(
            matches!(other.address_space().global_tail(), Err(Error::NotReady(1))),
            true
        );
        for address in 0..3 {
            let entry = view.read(address).unwrap();
            assert_eq!(entry.payload, Some(raw(&format!("x{}", address))));
        }

        rt.install_layout(committed);
        assert_eq!(rt.management_view().recover_sequencer().unwrap(), 3);
        assert_eq!(other.stream(s).append(raw("x3")).unwrap(), 3);
        assert_eq!(view.read(3).unwrap().backpointer(&s), Some(2));
    }

    #[test]
    fn kept_sequencer_resumes_after_reconfigure() {
        let cluster = Cluster::new(&["a", "b", "c"], &["a", "b", "c"], 0);
        let rt = cluster.bootstrap();
        let view = rt.address_space();
        view.append(raw("x0"), only(1)).unwrap();

        cluster.router.disconnect("c");
        let layout = rt.management_view().check_and_heal().unwrap().unwrap();
        assert_eq!(layout.primary_sequencer(), Some("a"));
        let sequencer = cluster.nodes["a"].sequencer().unwrap();
        assert_eq!(sequencer.epoch(), 1);
        assert_eq!(sequencer.is_ready(), true);
        assert_eq!(sequencer.global_tail(), 1);

        // a backup never bootstrapped can't resume.
        let backup = rt.transport().sequencer("b", 1);
        assert_eq!(matches!(backup.resume(0), Err(Error::NotReady(1))), true);
    }

    #[test]
    fn recover_sequencer_of_empty_log() {
        let cluster = Cluster::new(&["a"], &["a"], 0);
        let rt = cluster.bootstrap();
        assert_eq!(rt.management_view().recover_sequencer().unwrap(), 0);
        assert_eq!(rt.address_space().global_tail().unwrap(), 0);
    }

    #[test]
    fn last_replica_cannot_be_removed() {
        let cluster = Cluster::new(&["a", "b"], &["a"], 0);
        let rt = cluster.bootstrap();
        cluster.router.disconnect("a");
        assert_eq!(
            matches!(
                rt.management_view().check_and_heal(),
                Err(Error::Unrecoverable(_))
            ),
            true
        );
    }
}
