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

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::Server;
use crate::datastore::{get_json, put_json, DataStore};
use crate::error::Error;
use crate::layout::Layout;
use crate::protocol::{Message, MsgDetail, Response, ResponseDetail};
use crate::types::{Epoch, Rank};

const PAXOS_STATE_KEY: &'static str = "layout_server";

/// The durable state of a layout server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PaxosState {
    server_epoch: Epoch,
    current_layout: Option<Layout>,

    /// The epoch the phase ranks below belong to.
    paxos_epoch: Epoch,
    phase1_rank: Option<Rank>,
    phase2_rank: Option<Rank>,
    proposed_layout: Option<Layout>,
}

impl PaxosState {
    fn reset_round(&mut self, epoch: Epoch) {
        self.paxos_epoch = epoch;
        self.phase1_rank = None;
        self.phase2_rank = None;
        self.proposed_layout = None;
    }
}

/// A member of the paxos ensemble which agrees on the layout of each epoch.
pub struct LayoutServer {
    endpoint: String,
    store: Arc<dyn DataStore>,
    state: Mutex<PaxosState>,
}

impl LayoutServer {
    /// Recover a layout server from `store`.
    pub fn new(endpoint: &str, store: Arc<dyn DataStore>) -> Result<LayoutServer, Error> {
        let state: PaxosState = get_json(store.as_ref(), PAXOS_STATE_KEY)?.unwrap_or_default();
        info!(
            "layout server {} recovered at epoch {}, layout epoch {:?}, phase1 {:?}, phase2 {:?}",
            endpoint,
            state.server_epoch,
            state.current_layout.as_ref().map(|l| l.epoch),
            state.phase1_rank,
            state.phase2_rank
        );
        Ok(LayoutServer {
            endpoint: String::from(endpoint),
            store,
            state: Mutex::new(state),
        })
    }

    pub fn epoch(&self) -> Epoch {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).server_epoch
    }

    pub fn current_layout(&self) -> Option<Layout> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current_layout
            .clone()
    }

    fn persist(&self, state: &PaxosState) -> Result<(), Error> {
        put_json(self.store.as_ref(), PAXOS_STATE_KEY, state)
    }

    /// Reject stale messages, messages of a higher epoch seal the server.
    fn check_epoch(&self, state: &mut PaxosState, epoch: Epoch) -> Result<(), Error> {
        if state.current_layout.is_none() {
            return Err(Error::NotBootstrapped);
        }
        if epoch < state.server_epoch {
            return Err(Error::WrongEpoch(state.server_epoch));
        }
        if epoch > state.server_epoch {
            info!(
                "layout server {} sealed by message of epoch {}, was {}",
                self.endpoint, epoch, state.server_epoch
            );
            state.server_epoch = epoch;
        }
        if state.paxos_epoch != epoch {
            state.reset_round(epoch);
        }
        Ok(())
    }

    fn check_uncommitted(state: &PaxosState, epoch: Epoch) -> Result<(), Error> {
        match &state.current_layout {
            Some(layout) if layout.epoch >= epoch => Err(Error::IllegalState(format!(
                "layout of epoch {} already committed",
                epoch
            ))),
            _ => Ok(()),
        }
    }

    fn handle_bootstrap(&self, layout: Layout) -> Result<ResponseDetail, Error> {
        layout.validate()?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.current_layout.is_some() {
            warn!("layout server {} is already bootstrapped", self.endpoint);
            return Err(Error::AlreadyBootstrapped);
        }
        let mut next = state.clone();
        next.server_epoch = std::cmp::max(next.server_epoch, layout.epoch);
        next.reset_round(layout.epoch);
        next.current_layout = Some(layout);
        self.persist(&next)?;
        *state = next;
        info!(
            "layout server {} bootstrapped at epoch {}",
            self.endpoint, state.server_epoch
        );
        Ok(ResponseDetail::Ok)
    }

    fn handle_seal(&self, epoch: Epoch) -> Result<ResponseDetail, Error> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if epoch < state.server_epoch {
            return Err(Error::WrongEpoch(state.server_epoch));
        }
        if epoch > state.server_epoch {
            let mut next = state.clone();
            next.server_epoch = epoch;
            self.persist(&next)?;
            *state = next;
            info!("layout server {} sealed at epoch {}", self.endpoint, epoch);
        }
        Ok(ResponseDetail::Ok)
    }

    fn handle_get(&self) -> Result<ResponseDetail, Error> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &state.current_layout {
            Some(layout) => Ok(ResponseDetail::Layout(layout.clone())),
            None => Err(Error::NotBootstrapped),
        }
    }

    fn handle_prepare(&self, epoch: Epoch, rank: Rank) -> Result<ResponseDetail, Error> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = state.clone();
        self.check_epoch(&mut next, epoch)?;
        LayoutServer::check_uncommitted(&next, epoch)?;
        if next.phase1_rank.map(|r| rank <= r).unwrap_or(false) {
            warn!(
                "layout server {} reject prepare {} of epoch {}, phase1 rank is {:?}",
                self.endpoint, rank, epoch, next.phase1_rank
            );
            // The epoch may still have advanced.
            self.persist(&next)?;
            *state = next;
            return Err(Error::Rejected(state.phase1_rank));
        }
        next.phase1_rank = Some(rank);
        self.persist(&next)?;
        *state = next;
        debug!(
            "layout server {} prepared {} of epoch {}",
            self.endpoint, rank, epoch
        );
        Ok(ResponseDetail::PrepareAck {
            phase2_rank: state.phase2_rank,
            proposed_layout: state.proposed_layout.clone(),
        })
    }

    fn handle_propose(&self, epoch: Epoch, rank: Rank, layout: Layout) -> Result<ResponseDetail, Error> {
        layout.validate()?;
        if layout.epoch != epoch {
            return Err(Error::InvalidLayout(format!(
                "propose layout of epoch {} in epoch {}",
                layout.epoch, epoch
            )));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = state.clone();
        self.check_epoch(&mut next, epoch)?;
        LayoutServer::check_uncommitted(&next, epoch)?;
        if next.phase1_rank != Some(rank) {
            warn!(
                "layout server {} reject proposal {} of epoch {}, phase1 rank is {:?}",
                self.endpoint, rank, epoch, next.phase1_rank
            );
            self.persist(&next)?;
            *state = next;
            return Err(Error::Rejected(state.phase1_rank));
        }
        next.phase2_rank = Some(rank);
        next.proposed_layout = Some(layout);
        self.persist(&next)?;
        *state = next;
        debug!(
            "layout server {} accepted proposal {} of epoch {}",
            self.endpoint, rank, epoch
        );
        Ok(ResponseDetail::Ok)
    }

    fn handle_commit(&self, epoch: Epoch, layout: Layout) -> Result<ResponseDetail, Error> {
        layout.validate()?;
        if layout.epoch != epoch {
            return Err(Error::InvalidLayout(format!(
                "commit layout of epoch {} in epoch {}",
                layout.epoch, epoch
            )));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = match &state.current_layout {
            Some(current) => current,
            None => return Err(Error::NotBootstrapped),
        };
        if current.epoch == layout.epoch {
            if *current == layout {
                return Ok(ResponseDetail::Ok);
            }
            return Err(Error::IllegalState(format!(
                "a different layout of epoch {} is committed",
                epoch
            )));
        }
        if epoch < state.server_epoch {
            return Err(Error::WrongEpoch(state.server_epoch));
        }

        let mut next = state.clone();
        next.server_epoch = epoch;
        next.reset_round(epoch);
        next.current_layout = Some(layout);
        self.persist(&next)?;
        *state = next;
        info!("layout server {} committed layout of epoch {}", self.endpoint, epoch);
        Ok(ResponseDetail::Ok)
    }
}

impl Server for LayoutServer {
    fn handle(&self, msg: Message) -> Response {
        let epoch = msg.epoch;
        let result = match &msg.detail {
            MsgDetail::Seal => self.handle_seal(epoch),
            MsgDetail::LayoutGet => self.handle_get(),
            MsgDetail::LayoutBootstrap { layout } => self.handle_bootstrap(layout.clone()),
            MsgDetail::LayoutPrepare { rank } => self.handle_prepare(epoch, *rank),
            MsgDetail::LayoutPropose { rank, layout } => {
                self.handle_propose(epoch, *rank, layout.clone())
            }
            MsgDetail::LayoutCommit { layout } => self.handle_commit(epoch, layout.clone()),
            _ => Err(Error::IllegalState(format!(
                "layout server receive {}",
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

#[cfg(test)]
mod tests {
    use super::*;

    use uuid::Uuid;

    use crate::constant::INITIAL_EPOCH;
    use crate::datastore::MemDataStore;

    fn layout_of(epoch: Epoch, unit: &str) -> Layout {
        let mut layout = Layout::new(
            vec![String::from("a:1")],
            vec![String::from("a:1")],
            vec![String::from(unit)],
        );
        layout.epoch = epoch;
        layout
    }

    fn send(server: &LayoutServer, epoch: Epoch, detail: MsgDetail) -> ResponseDetail {
        server.handle(Message::new(epoch, detail)).detail
    }

    fn bootstrapped(store: Arc<dyn DataStore>) -> LayoutServer {
        let server = LayoutServer::new("a:1", store).unwrap();
        let resp = send(
            &server,
            INITIAL_EPOCH,
            MsgDetail::LayoutBootstrap {
                layout: layout_of(INITIAL_EPOCH, "a:1"),
            },
        );
        assert_eq!(matches!(resp, ResponseDetail::Ok), true);
        server
    }

    #[test]
    fn bootstrap_only_once() {
        let server = LayoutServer::new("a:1", Arc::new(MemDataStore::new())).unwrap();
        let resp = send(&server, 0, MsgDetail::LayoutGet);
        assert_eq!(
            matches!(resp.into_error(-1), Error::NotBootstrapped),
            true
        );

        let server = bootstrapped(Arc::new(MemDataStore::new()));
        let resp = send(
            &server,
            0,
            MsgDetail::LayoutBootstrap {
                layout: layout_of(0, "b:1"),
            },
        );
        assert_eq!(
            matches!(resp.into_error(-1), Error::AlreadyBootstrapped),
            true
        );
        match send(&server, 0, MsgDetail::LayoutGet) {
            ResponseDetail::Layout(layout) => assert_eq!(layout, layout_of(0, "a:1")),
            _ => panic!("layout server is bootstrapped"),
        }
    }

    #[test]
    fn prepare_propose_commit() {
        let server = bootstrapped(Arc::new(MemDataStore::new()));
        let c1 = Uuid::from_u128(1);
        let c2 = Uuid::from_u128(2);
        let next = layout_of(1, "b:1");

        let resp = send(&server, 1, MsgDetail::LayoutPrepare { rank: Rank::new(1, c1) });
        match resp {
            ResponseDetail::PrepareAck {
                phase2_rank,
                proposed_layout,
            } => {
                assert_eq!(phase2_rank, None);
                assert_eq!(proposed_layout, None);
            }
            _ => panic!("prepare must be acked"),
        }
        assert_eq!(server.epoch(), 1);

        // equal rank is rejected.
        let resp = send(&server, 1, MsgDetail::LayoutPrepare { rank: Rank::new(1, c1) });
        assert_eq!(matches!(resp, ResponseDetail::Reject(Some(_))), true);

        // a higher rank preempts c1.
        let resp = send(&server, 1, MsgDetail::LayoutPrepare { rank: Rank::new(2, c2) });
        assert_eq!(matches!(resp, ResponseDetail::PrepareAck { .. }), true);
        let resp = send(
            &server,
            1,
            MsgDetail::LayoutPropose {
                rank: Rank::new(1, c1),
                layout: next.clone(),
            },
        );
        match resp {
            ResponseDetail::Reject(rank) => assert_eq!(rank, Some(Rank::new(2, c2))),
            _ => panic!("proposal of c1 must be rejected"),
        }

        let resp = send(
            &server,
            1,
            MsgDetail::LayoutPropose {
                rank: Rank::new(2, c2),
                layout: next.clone(),
            },
        );
        assert_eq!(matches!(resp, ResponseDetail::Ok), true);

        // the accepted value is reported to later proposers.
        let resp = send(&server, 1, MsgDetail::LayoutPrepare { rank: Rank::new(3, c1) });
        match resp {
            ResponseDetail::PrepareAck {
                phase2_rank,
                proposed_layout,
            } => {
                assert_eq!(phase2_rank, Some(Rank::new(2, c2)));
                assert_eq!(proposed_layout, Some(next.clone()));
            }
            _ => panic!("prepare must be acked"),
        }

        let resp = send(&server, 1, MsgDetail::LayoutCommit { layout: next.clone() });
        assert_eq!(matches!(resp, ResponseDetail::Ok), true);
        // committing the same layout again is idempotent.
        let resp = send(&server, 1, MsgDetail::LayoutCommit { layout: next.clone() });
        assert_eq!(matches!(resp, ResponseDetail::Ok), true);
        // but a different layout of the same epoch is refused.
        let resp = send(
            &server,
            1,
            MsgDetail::LayoutCommit {
                layout: layout_of(1, "c:1"),
            },
        );
        assert_eq!(matches!(resp, ResponseDetail::Error { .. }), true);
        assert_eq!(server.current_layout(), Some(next));

        // no more rounds in a committed epoch.
        let resp = send(&server, 1, MsgDetail::LayoutPrepare { rank: Rank::new(9, c1) });
        assert_eq!(matches!(resp, ResponseDetail::Error { .. }), true);
    }

    #[test]
    fn stale_epoch_is_rejected() {
        let server = bootstrapped(Arc::new(MemDataStore::new()));
        let resp = send(&server, 4, MsgDetail::Seal);
        assert_eq!(matches!(resp, ResponseDetail::Ok), true);
        let resp = send(
            &server,
            3,
            MsgDetail::LayoutPrepare {
                rank: Rank::new(1, Uuid::from_u128(1)),
            },
        );
        assert_eq!(matches!(resp, ResponseDetail::WrongEpoch(4)), true);
        // layout reads are always served.
        let resp = send(&server, 0, MsgDetail::LayoutGet);
        assert_eq!(matches!(resp, ResponseDetail::Layout(_)), true);
    }

    #[test]
    fn paxos_state_survives_restart() {
        let store: Arc<dyn DataStore> = Arc::new(MemDataStore::new());
        let c1 = Uuid::from_u128(1);
        {
            let server = bootstrapped(store.clone());
            send(&server, 1, MsgDetail::LayoutPrepare { rank: Rank::new(5, c1) });
            send(
                &server,
                1,
                MsgDetail::LayoutPropose {
                    rank: Rank::new(5, c1),
                    layout: layout_of(1, "b:1"),
                },
            );
        }
        let server = LayoutServer::new("a:1", store).unwrap();
        assert_eq!(server.epoch(), 1);
        let resp = send(&server, 1, MsgDetail::LayoutPrepare { rank: Rank::new(4, c1) });
        assert_eq!(matches!(resp, ResponseDetail::Reject(Some(_))), true);
        let resp = send(&server, 1, MsgDetail::LayoutPrepare { rank: Rank::new(6, c1) });
        match resp {
            ResponseDetail::PrepareAck {
                proposed_layout, ..
            } => assert_eq!(proposed_layout, Some(layout_of(1, "b:1"))),
            _ => panic!("prepare must be acked"),
        }
    }
}
