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

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use corfu::protocol::{Message, Response};
use corfu::{Error, Router};
use log::{trace, warn};
use tarpc::context;
use tokio::runtime::{Builder, Runtime};

use super::{new_corfu_connect, CorfuChannelMap};
use crate::proto::corfu as pc;
use crate::resolver::AddressResolver;

/// A `corfu::Router` sending messages over tarpc. The runtime of corfu is
/// synchronous, so the router drives its own tokio runtime and blocks the
/// caller until the response arrives.
///
/// Must not be used from within another tokio runtime.
pub struct NetworkRouter<R: AddressResolver> {
    resolver: R,
    channel_map: CorfuChannelMap,
    runtime: Runtime,
}

impl<R: AddressResolver> NetworkRouter<R> {
    pub fn new(resolver: R) -> io::Result<NetworkRouter<R>> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("corfu-router")
            .enable_all()
            .build()?;
        Ok(NetworkRouter {
            resolver,
            channel_map: CorfuChannelMap::new(),
            runtime,
        })
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    async fn resolve_channel(
        &self,
        endpoint: &str,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<pc::CorfuClient, Error> {
        if let Some(channel) = self.channel_map.select(addr) {
            return Ok(channel);
        }
        match tokio::time::timeout(timeout, new_corfu_connect(addr)).await {
            Ok(Ok(channel)) => Ok(self.channel_map.insert_if_not_exists(addr, channel)),
            Ok(Err(e)) => {
                warn!("make connect to {} ({}): {}", endpoint, addr, e);
                Err(Error::Disconnected(String::from(endpoint)))
            }
            Err(_) => {
                warn!("make connect to {} ({}): timeout", endpoint, addr);
                Err(Error::Disconnected(String::from(endpoint)))
            }
        }
    }

    async fn send_async(
        &self,
        endpoint: &str,
        msg: Message,
        timeout: Duration,
    ) -> Result<Response, Error> {
        let addr = self
            .resolver
            .resolve(endpoint)
            .ok_or_else(|| Error::Disconnected(String::from(endpoint)))?;
        let channel = self.resolve_channel(endpoint, addr, timeout).await?;

        let mut ctx = context::current();
        ctx.deadline = SystemTime::now() + timeout;
        trace!("send {} to {} ({})", msg.detail, endpoint, addr);
        match tokio::time::timeout(timeout, channel.handle(ctx, msg)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => {
                warn!("request to {} ({}): {}", endpoint, addr, e);
                self.channel_map.erase(addr);
                if e.kind() == io::ErrorKind::TimedOut {
                    Err(Error::Timeout(String::from(endpoint)))
                } else {
                    Err(Error::Disconnected(String::from(endpoint)))
                }
            }
            Err(_) => Err(Error::Timeout(String::from(endpoint))),
        }
    }
}

impl<R: AddressResolver> Router for NetworkRouter<R> {
    fn send(&self, endpoint: &str, msg: Message, timeout: Duration) -> Result<Response, Error> {
        self.runtime.block_on(self.send_async(endpoint, msg, timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;
    use std::sync::Arc;

    use corfu::datastore::MemDataStore;
    use corfu::storage::MemLogStore;
    use corfu::{
        CorfuRuntime, Layout, LayoutServer, LogUnitServer, Payload, RuntimeParameters,
        SequencerServer, ServerNode,
    };

    use crate::resolver::StaticResolver;
    use crate::service;

    fn node(endpoint: &str) -> Arc<ServerNode> {
        Arc::new(
            ServerNode::new(endpoint)
                .with_layout_server(
                    LayoutServer::new(endpoint, Arc::new(MemDataStore::new())).unwrap(),
                )
                .with_sequencer(SequencerServer::new(endpoint))
                .with_log_unit(LogUnitServer::new(endpoint, Arc::new(MemLogStore::new()))),
        )
    }

    fn params() -> RuntimeParameters {
        RuntimeParameters {
            request_timeout: Duration::from_secs(2),
            epoch_timeout: Duration::from_secs(2),
            ..RuntimeParameters::default()
        }
    }

    #[test]
    fn append_and_read_over_tcp() {
        let server_rt = Runtime::new().unwrap();
        let (addr, serving) = server_rt
            .block_on(service::listen("127.0.0.1:0".parse().unwrap(), node("n1")))
            .unwrap();
        server_rt.spawn(serving);

        let resolver = StaticResolver::default();
        resolver.insert("n1", addr);
        let router = Arc::new(NetworkRouter::new(resolver).unwrap());
        let rt = CorfuRuntime::new(params(), router, vec![String::from("n1")]);

        let names = vec![String::from("n1")];
        let layout = Layout::new(names.clone(), names.clone(), names);
        rt.bootstrap(&layout).unwrap();
        assert_eq!(*rt.fetch_layout().unwrap(), layout);

        let view = rt.address_space();
        let payload = Payload::new("raw", b"hello".to_vec());
        let address = view.append(payload.clone(), BTreeSet::new()).unwrap();
        assert_eq!(address, 0);
        assert_eq!(view.read(0).unwrap().payload, Some(payload));
    }

    #[test]
    fn unknown_endpoint_is_disconnected() {
        let router = NetworkRouter::new(StaticResolver::default()).unwrap();
        let msg = Message::new(0, corfu::protocol::MsgDetail::Ping);
        let result = router.send("nowhere", msg, Duration::from_millis(100));
        assert_eq!(matches!(result, Err(Error::Disconnected(_))), true);
    }
}
