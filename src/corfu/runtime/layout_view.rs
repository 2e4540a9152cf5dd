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
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use super::clients::backoff;
use super::CorfuRuntime;
use crate::error::Error;
use crate::layout::{majority, Layout};
use crate::types::{Epoch, Rank};

/// Drives epoch changes: seals the servers, then agrees on the layout of the
/// next epoch with a single decree paxos among the layout servers.
pub struct LayoutView<'a> {
    rt: &'a CorfuRuntime,
}

impl<'a> LayoutView<'a> {
    pub(super) fn new(rt: &'a CorfuRuntime) -> LayoutView<'a> {
        LayoutView { rt }
    }

    /// Move the servers of both layouts to the epoch of `next`. The seal must
    /// reach a majority of the current layout servers, every log unit of
    /// `next` and its primary sequencer.
    pub fn seal(&self, current: &Layout, next: &Layout) -> Result<(), Error> {
        let mut endpoints = current.all_servers();
        endpoints.extend(next.all_servers());

        let mut sealed = BTreeSet::new();
        let mut last_err = None;
        for endpoint in &endpoints {
            match self.rt.transport().base(endpoint).seal(next.epoch) {
                Ok(()) => {
                    sealed.insert(endpoint.clone());
                }
                Err(e) => {
                    warn!(
                        "runtime {} seal {} at epoch {}: {}",
                        self.rt.client_id(),
                        endpoint,
                        next.epoch,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }

        let num_layout_servers = current
            .layout_servers
            .iter()
            .filter(|s| sealed.contains(*s))
            .count();
        let required = next
            .log_servers()
            .into_iter()
            .chain(next.primary_sequencer().map(String::from))
            .all(|s| sealed.contains(&s));
        if num_layout_servers < majority(current.layout_servers.len()) || !required {
            return Err(last_err.unwrap_or_else(|| {
                Error::Unrecoverable(format!("seal epoch {}", next.epoch))
            }));
        }
        info!(
            "runtime {} sealed {} servers at epoch {}",
            self.rt.client_id(),
            sealed.len(),
            next.epoch
        );
        Ok(())
    }

    /// Phase 1. Returns the proposal with the highest rank accepted by the
    /// responding majority, if any.
    pub fn prepare(&self, servers: &[String], epoch: Epoch, rank: Rank) -> Result<Option<Layout>, Error> {
        let mut acks = 0;
        let mut accepted: Option<(Rank, Layout)> = None;
        let mut highest: Option<Rank> = None;
        let mut last_err = None;
        for endpoint in servers {
            let client = self.rt.transport().layout_server(endpoint, epoch);
            match client.prepare(rank) {
                Ok((phase2_rank, proposed_layout)) => {
                    acks += 1;
                    if let (Some(r), Some(layout)) = (phase2_rank, proposed_layout) {
                        if accepted.as_ref().map(|(a, _)| *a < r).unwrap_or(true) {
                            accepted = Some((r, layout));
                        }
                    }
                }
                Err(Error::Rejected(r)) => {
                    highest = std::cmp::max(highest, r);
                }
                Err(e @ Error::IllegalState(_)) => return Err(e),
                Err(e) => {
                    debug!("runtime {} prepare at {}: {}", self.rt.client_id(), endpoint, e);
                    last_err = Some(e);
                }
            }
        }
        if acks >= majority(servers.len()) {
            return Ok(accepted.map(|(_, layout)| layout));
        }
        if highest.is_some() {
            return Err(Error::Rejected(highest));
        }
        Err(last_err.unwrap_or_else(|| {
            Error::Unrecoverable(format!("no quorum to prepare epoch {}", epoch))
        }))
    }

    /// Phase 2, succeeds once a majority accepts `layout` at `rank`.
    pub fn propose(&self, servers: &[String], rank: Rank, layout: &Layout) -> Result<(), Error> {
        let mut acks = 0;
        let mut highest: Option<Rank> = None;
        let mut last_err = None;
        for endpoint in servers {
            let client = self.rt.transport().layout_server(endpoint, layout.epoch);
            match client.propose(rank, layout) {
                Ok(()) => acks += 1,
                Err(Error::Rejected(r)) => highest = std::cmp::max(highest, r),
                Err(e @ Error::IllegalState(_)) => return Err(e),
                Err(e) => {
                    debug!("runtime {} propose at {}: {}", self.rt.client_id(), endpoint, e);
                    last_err = Some(e);
                }
            }
        }
        if acks >= majority(servers.len()) {
            return Ok(());
        }
        if highest.is_some() {
            return Err(Error::Rejected(highest));
        }
        Err(last_err.unwrap_or_else(|| {
            Error::Unrecoverable(format!("no quorum to propose epoch {}", layout.epoch))
        }))
    }

    /// Tell the decided layout to every layout server, at least one must
    /// learn it.
    pub fn commit(&self, servers: &[String], layout: &Layout) -> Result<(), Error> {
        let mut acks = 0;
        let mut last_err = None;
        for endpoint in servers {
            let client = self.rt.transport().layout_server(endpoint, layout.epoch);
            match client.commit(layout) {
                Ok(()) => acks += 1,
                Err(e) => {
                    warn!(
                        "runtime {} commit epoch {} at {}: {}",
                        self.rt.client_id(),
                        layout.epoch,
                        endpoint,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        if acks == 0 {
            return Err(last_err.unwrap_or_else(|| {
                Error::Unrecoverable(format!("commit epoch {}", layout.epoch))
            }));
        }
        info!(
            "runtime {} committed layout of epoch {} at {} servers",
            self.rt.client_id(),
            layout.epoch,
            acks
        );
        Ok(())
    }

    fn run_round(&self, current: &Layout, rank: Rank, layout: &Layout) -> Result<Layout, Error> {
        let servers = &current.layout_servers;
        let value = match self.prepare(servers, layout.epoch, rank)? {
            Some(accepted) => {
                if accepted != *layout {
                    info!(
                        "runtime {} adopt proposal of epoch {} accepted by others",
                        self.rt.client_id(),
                        layout.epoch
                    );
                }
                accepted
            }
            None => layout.clone(),
        };
        self.propose(servers, rank, &value)?;

        let mut learners: BTreeSet<String> = servers.iter().cloned().collect();
        learners.extend(value.layout_servers.iter().cloned());
        let learners: Vec<String> = learners.into_iter().collect();
        self.commit(&learners, &value)?;
        Ok(value)
    }

    /// Run paxos until a layout of `layout.epoch` is committed. The
    /// committed layout is returned, it may be a layout proposed by someone
    /// else.
    pub fn update_layout(&self, current: &Layout, layout: &Layout) -> Result<Layout, Error> {
        let params = self.rt.parameters();
        let client_id = self.rt.client_id();
        let deadline = Instant::now() + params.epoch_timeout;
        let mut rank = Rank::new(1, client_id);
        let mut attempt = 0;
        loop {
            match self.run_round(current, rank, layout) {
                Ok(committed) => return Ok(committed),
                Err(Error::Rejected(higher)) => {
                    let base = std::cmp::max(Some(rank), higher).unwrap_or(rank);
                    warn!(
                        "runtime {} preempted at rank {} of epoch {}, retry above {}",
                        client_id, rank, layout.epoch, base
                    );
                    rank = base.successor(client_id);
                }
                Err(Error::IllegalState(msg)) => {
                    // The epoch is decided already, learn the decision.
                    let latest = self.rt.fetch_layout()?;
                    if latest.epoch >= layout.epoch {
                        return Ok((*latest).clone());
                    }
                    return Err(Error::IllegalState(msg));
                }
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!("paxos of epoch {}", layout.epoch)));
            }
            std::thread::sleep(backoff(params.base_backoff_ms, params.max_backoff_ms, attempt));
            attempt += 1;
        }
    }

    /// Replace the current layout by `next`, whose epoch must be higher.
    /// Returns the layout installed, which is the layout committed for that
    /// epoch. The primary sequencer of the installed layout is ready to
    /// issue tokens once this returns.
    pub fn reconfigure(&self, next: Layout) -> Result<Arc<Layout>, Error> {
        next.validate()?;
        let current = self.rt.layout()?;
        if next.epoch <= current.epoch {
            return Err(Error::InvalidLayout(format!(
                "epoch {} isn't above current epoch {}",
                next.epoch, current.epoch
            )));
        }
        info!(
            "runtime {} reconfigure epoch {} -> {}",
            self.rt.client_id(),
            current.epoch,
            next.epoch
        );
        self.seal(&current, &next)?;
        let committed = self.update_layout(&current, &next)?;
        let installed = self.rt.install_layout(committed);
        self.rt
            .management_view()
            .ready_sequencer(&current, &installed)?;
        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;

    use uuid::Uuid;

    use crate::layout::LayoutBuilder;
    use crate::runtime::tests::Cluster;
    use crate::runtime::RuntimeParameters;
    use crate::types::Payload;

    fn client(cluster: &Cluster, id: u128) -> Arc<CorfuRuntime> {
        cluster.runtime_with(RuntimeParameters {
            client_id: Uuid::from_u128(id),
            ..Cluster::params()
        })
    }

    #[test]
    fn epoch_bump_refreshes_stale_clients() {
        let cluster = Cluster::new(&["a", "b", "c"], &["a", "b"], 3);
        let c1 = cluster.bootstrap();
        let c2 = cluster.runtime();
        let s = Uuid::from_u128(7);
        let mut streams = BTreeSet::new();
        streams.insert(s);
        c2.address_space()
            .append(Payload::new("raw", b"before".to_vec()), streams.clone())
            .unwrap();
        assert_eq!(c2.layout().unwrap().epoch, 3);

        let next = LayoutBuilder::new(&c1.layout().unwrap()).build().unwrap();
        let installed = c1.layout_view().reconfigure(next.clone()).unwrap();
        assert_eq!(*installed, next);
        for node in cluster.nodes.values() {
            assert_eq!(node.epoch(), 4);
        }

        // a stale request is fenced.
        let stale = c2.transport().log_unit("a", 3);
        assert_eq!(
            matches!(stale.read(0), Err(Error::WrongEpoch(4))),
            true
        );

        let address = c2
            .address_space()
            .append(Payload::new("raw", b"after".to_vec()), streams)
            .unwrap();
        assert_eq!(address, 1);
        assert_eq!(c2.layout().unwrap().epoch, 4);
        let entry = c2.address_space().read(1).unwrap();
        assert_eq!(entry.epoch, 4);
        assert_eq!(entry.backpointer(&s), Some(0));
    }

    #[test]
    fn preempted_proposer_adopts_accepted_value() {
        let cluster = Cluster::new(&["a", "b", "c"], &["a"], 0);
        let c1 = client(&cluster, 1);
        c1.bootstrap(&cluster.layout).unwrap();
        let c2 = client(&cluster, 2);
        let servers = cluster.layout.layout_servers.clone();

        let mut mine = LayoutBuilder::new(&cluster.layout).build().unwrap();
        mine.sequencers = vec![String::from("a")];
        let mut theirs = LayoutBuilder::new(&cluster.layout).build().unwrap();
        theirs.sequencers = vec![String::from("b")];

        let r1 = Rank::new(1, c1.client_id());
        let r2 = Rank::new(2, c2.client_id());
        let v1 = c1.layout_view();
        let v2 = c2.layout_view();

        assert_eq!(v1.prepare(&servers, 1, r1).unwrap(), None);
        assert_eq!(v2.prepare(&servers, 1, r2).unwrap(), None);
        v2.propose(&servers, r2, &theirs).unwrap();

        match v1.propose(&servers, r1, &mine) {
            Err(Error::Rejected(Some(rank))) => assert_eq!(rank, r2),
            other => panic!("unexpected {:?}", other),
        }

        let r3 = r2.successor(c1.client_id());
        assert_eq!(r3, Rank::new(3, c1.client_id()));
        let accepted = v1.prepare(&servers, 1, r3).unwrap();
        assert_eq!(accepted, Some(theirs.clone()));
        v1.propose(&servers, r3, &theirs).unwrap();
        v1.commit(&servers, &theirs).unwrap();

        for endpoint in &servers {
            let layout = c1.transport().layout_server(endpoint, 1).get_layout().unwrap();
            assert_eq!(layout, theirs);
        }
        // the epoch is decided, a late proposer learns the decision.
        let learned = v2.update_layout(&cluster.layout, &mine).unwrap();
        assert_eq!(learned, theirs);
    }

    #[test]
    fn update_layout_retries_after_preemption() {
        let cluster = Cluster::new(&["a", "b", "c"], &["a"], 0);
        let c1 = client(&cluster, 1);
        c1.bootstrap(&cluster.layout).unwrap();
        let c2 = client(&cluster, 2);
        let servers = cluster.layout.layout_servers.clone();

        // c2 prepared a high rank and vanished.
        c2.layout_view()
            .prepare(&servers, 1, Rank::new(5, c2.client_id()))
            .unwrap();

        let next = LayoutBuilder::new(&cluster.layout).build().unwrap();
        let committed = c1.layout_view().update_layout(&cluster.layout, &next).unwrap();
        assert_eq!(committed, next);
        assert_eq!(c2.fetch_layout().unwrap().epoch, 1);
    }

    #[test]
    fn reconfigure_without_majority() {
        let cluster = Cluster::new(&["a", "b", "c"], &["a"], 0);
        let rt = cluster.bootstrap();
        cluster.router.disconnect("b");
        cluster.router.disconnect("c");
        let next = LayoutBuilder::new(&cluster.layout).build().unwrap();
        assert_eq!(rt.layout_view().reconfigure(next).is_err(), true);

        let stale = LayoutBuilder::new(&cluster.layout).epoch(0).build().unwrap();
        assert_eq!(
            matches!(rt.layout_view().reconfigure(stale), Err(Error::InvalidLayout(_))),
            true
        );
    }
}
