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

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, trace};

use crate::error::Error;
use crate::protocol::{Message, Response};
use crate::server::Server;

/// The message bus between the runtime and the servers. Implementations must
/// deliver the messages to one endpoint in order.
pub trait Router: Send + Sync {
    /// Send `msg` to `endpoint` and wait for its response, at most `timeout`.
    ///
    /// `Error::Disconnected` means the message wasn't delivered,
    /// `Error::Timeout` means the result of the request is unknown.
    fn send(&self, endpoint: &str, msg: Message, timeout: Duration) -> Result<Response, Error>;
}

/// A `Router` delivering messages to servers living in the same process,
/// with the ability to inject faults.
#[derive(Default)]
pub struct LocalRouter {
    servers: RwLock<HashMap<String, Arc<dyn Server>>>,
    disconnected: RwLock<HashSet<String>>,
    /// The number of responses to drop for each endpoint.
    dropped: Mutex<HashMap<String, usize>>,
}

impl LocalRouter {
    pub fn new() -> LocalRouter {
        LocalRouter::default()
    }

    pub fn register(&self, endpoint: &str, server: Arc<dyn Server>) {
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        servers.insert(String::from(endpoint), server);
    }

    /// Messages to `endpoint` are no longer delivered.
    pub fn disconnect(&self, endpoint: &str) {
        debug!("router disconnect endpoint {}", endpoint);
        let mut disconnected = self.disconnected.write().unwrap_or_else(|e| e.into_inner());
        disconnected.insert(String::from(endpoint));
    }

    pub fn reconnect(&self, endpoint: &str) {
        debug!("router reconnect endpoint {}", endpoint);
        let mut disconnected = self.disconnected.write().unwrap_or_else(|e| e.into_inner());
        disconnected.remove(endpoint);
    }

    /// The next `count` messages to `endpoint` are served, but their
    /// responses are lost.
    pub fn drop_responses(&self, endpoint: &str, count: usize) {
        let mut dropped = self.dropped.lock().unwrap_or_else(|e| e.into_inner());
        *dropped.entry(String::from(endpoint)).or_insert(0) += count;
    }

    fn should_drop(&self, endpoint: &str) -> bool {
        let mut dropped = self.dropped.lock().unwrap_or_else(|e| e.into_inner());
        match dropped.get_mut(endpoint) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }
}

impl Router for LocalRouter {
    fn send(&self, endpoint: &str, msg: Message, _timeout: Duration) -> Result<Response, Error> {
        if self
            .disconnected
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(endpoint)
        {
            return Err(Error::Disconnected(String::from(endpoint)));
        }
        let server = {
            let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
            match servers.get(endpoint) {
                Some(server) => server.clone(),
                None => return Err(Error::Disconnected(String::from(endpoint))),
            }
        };
        trace!("router send {} to {}", msg.detail, endpoint);
        let resp = server.handle(msg);
        if self.should_drop(endpoint) {
            debug!("router drop response {} of {}", resp.detail, endpoint);
            return Err(Error::Timeout(String::from(endpoint)));
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::{MsgDetail, ResponseDetail};
    use crate::server::SequencerServer;

    #[test]
    fn inject_faults() {
        let router = LocalRouter::new();
        router.register("seq", Arc::new(SequencerServer::new("seq")));
        let timeout = Duration::from_secs(1);

        let resp = router
            .send("seq", Message::new(0, MsgDetail::Ping), timeout)
            .unwrap();
        assert_eq!(matches!(resp.detail, ResponseDetail::Error { .. }), true);
        assert_eq!(
            matches!(
                router.send("other", Message::new(0, MsgDetail::Ping), timeout),
                Err(Error::Disconnected(_))
            ),
            true
        );

        router.disconnect("seq");
        assert_eq!(
            matches!(
                router.send("seq", Message::new(0, MsgDetail::Seal), timeout),
                Err(Error::Disconnected(_))
            ),
            true
        );
        router.reconnect("seq");

        // the seal is applied even though its response is lost.
        router.drop_responses("seq", 1);
        assert_eq!(
            matches!(
                router.send("seq", Message::new(2, MsgDetail::Seal), timeout),
                Err(Error::Timeout(_))
            ),
            true
        );
        let resp = router
            .send("seq", Message::new(2, MsgDetail::Seal), timeout)
            .unwrap();
        assert_eq!(resp.epoch, 2);
    }
}
