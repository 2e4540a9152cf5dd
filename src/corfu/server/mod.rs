//! The crate `server` implements the server roles of a cluster: the layout
//! server, the sequencer and the log unit. A `ServerNode` hosts any subset
//! of them behind a single endpoint.

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

mod layout;
mod logunit;
mod sequencer;

use std::sync::Arc;

use log::{debug, warn};

use crate::protocol::{ErrorKind, Message, MsgDetail, Response, ResponseDetail, Role};
use crate::types::Epoch;

pub use self::layout::LayoutServer;
pub use self::logunit::LogUnitServer;
pub use self::sequencer::SequencerServer;

/// Something which answers protocol messages.
pub trait Server: Send + Sync {
    fn handle(&self, msg: Message) -> Response;
}

/// An endpoint hosting a set of server roles.
pub struct ServerNode {
    endpoint: String,
    layout_server: Option<Arc<LayoutServer>>,
    sequencer: Option<Arc<SequencerServer>>,
    log_unit: Option<Arc<LogUnitServer>>,
}

impl ServerNode {
    pub fn new(endpoint: &str) -> ServerNode {
        ServerNode {
            endpoint: String::from(endpoint),
            layout_server: None,
            sequencer: None,
            log_unit: None,
        }
    }

    pub fn with_layout_server(mut self, server: LayoutServer) -> ServerNode {
        self.layout_server = Some(Arc::new(server));
        self
    }

    pub fn with_sequencer(mut self, server: SequencerServer) -> ServerNode {
        self.sequencer = Some(Arc::new(server));
        self
    }

    pub fn with_log_unit(mut self, server: LogUnitServer) -> ServerNode {
        self.log_unit = Some(Arc::new(server));
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn layout_server(&self) -> Option<&Arc<LayoutServer>> {
        self.layout_server.as_ref()
    }

    pub fn sequencer(&self) -> Option<&Arc<SequencerServer>> {
        self.sequencer.as_ref()
    }

    pub fn log_unit(&self) -> Option<&Arc<LogUnitServer>> {
        self.log_unit.as_ref()
    }

    /// The highest epoch among the hosted roles.
    pub fn epoch(&self) -> Epoch {
        let mut epoch = 0;
        if let Some(server) = &self.layout_server {
            epoch = std::cmp::max(epoch, server.epoch());
        }
        if let Some(server) = &self.sequencer {
            epoch = std::cmp::max(epoch, server.epoch());
        }
        if let Some(server) = &self.log_unit {
            epoch = std::cmp::max(epoch, server.epoch());
        }
        epoch
    }

    fn seal(&self, msg: Message) -> Response {
        let mut servers: Vec<&dyn Server> = Vec::new();
        if let Some(server) = &self.layout_server {
            servers.push(server.as_ref());
        }
        if let Some(server) = &self.sequencer {
            servers.push(server.as_ref());
        }
        if let Some(server) = &self.log_unit {
            servers.push(server.as_ref());
        }

        for server in servers {
            let resp = server.handle(msg.clone());
            if !matches!(resp.detail, ResponseDetail::Ok) {
                warn!(
                    "node {} seal at epoch {}: {}",
                    self.endpoint, msg.epoch, resp.detail
                );
                return resp;
            }
        }
        msg.reply(self.epoch(), ResponseDetail::Ok)
    }

    fn unsupported(&self, msg: &Message) -> Response {
        debug!("node {} doesn't serve {}", self.endpoint, msg.detail);
        msg.reply(
            self.epoch(),
            ResponseDetail::error(
                ErrorKind::Unsupported,
                format!("{} isn't served by {}", msg.detail, self.endpoint),
            ),
        )
    }
}

impl Server for ServerNode {
    fn handle(&self, msg: Message) -> Response {
        match msg.detail.role() {
            Role::Any => match &msg.detail {
                MsgDetail::Seal => self.seal(msg),
                _ => msg.reply(self.epoch(), ResponseDetail::Pong),
            },
            Role::Layout => match &self.layout_server {
                Some(server) => server.handle(msg),
                None => self.unsupported(&msg),
            },
            Role::Sequencer => match &self.sequencer {
                Some(server) => server.handle(msg),
                None => self.unsupported(&msg),
            },
            Role::LogUnit => match &self.log_unit {
                Some(server) => server.handle(msg),
                None => self.unsupported(&msg),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;

    use crate::datastore::MemDataStore;
    use crate::storage::MemLogStore;

    fn node() -> ServerNode {
        ServerNode::new("a:1")
            .with_layout_server(LayoutServer::new("a:1", Arc::new(MemDataStore::new())).unwrap())
            .with_sequencer(SequencerServer::new("a:1"))
    }

    #[test]
    fn ping_and_unsupported_roles() {
        let node = node();
        let resp = node.handle(Message::new(0, MsgDetail::Ping));
        assert_eq!(matches!(resp.detail, ResponseDetail::Pong), true);

        let resp = node.handle(Message::new(0, MsgDetail::LogTail));
        match resp.detail {
            ResponseDetail::Error { kind, .. } => assert_eq!(kind, ErrorKind::Unsupported),
            _ => panic!("log unit isn't hosted"),
        }
    }

    #[test]
    fn seal_reaches_every_role() {
        let node = node().with_log_unit(LogUnitServer::new("a:1", Arc::new(MemLogStore::new())));
        let resp = node.handle(Message::new(3, MsgDetail::Seal));
        assert_eq!(matches!(resp.detail, ResponseDetail::Ok), true);
        assert_eq!(resp.epoch, 3);
        assert_eq!(node.sequencer().unwrap().epoch(), 3);
        assert_eq!(node.log_unit().unwrap().epoch(), 3);
        assert_eq!(node.layout_server().unwrap().epoch(), 3);

        // requests of the old epoch are rejected.
        let resp = node.handle(Message::new(
            2,
            MsgDetail::TokenReq {
                streams: BTreeSet::new(),
                count: 1,
            },
        ));
        assert_eq!(matches!(resp.detail, ResponseDetail::WrongEpoch(3)), true);
    }
}
