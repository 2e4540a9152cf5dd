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

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use corfu::protocol::{ErrorKind, Message, Response, ResponseDetail};
use corfu::{Server, ServerNode};
use futures::{future, StreamExt};
use log::{debug, error, info};
use tarpc::context;
use tarpc::server::{self, Channel};

use crate::proto::corfu::Corfu;

/// The maximum number of connections served concurrently.
const MAX_CONNECTIONS: usize = 1024;

#[derive(Clone)]
pub struct CorfuService {
    node: Arc<ServerNode>,
}

impl CorfuService {
    pub fn new(node: Arc<ServerNode>) -> CorfuService {
        CorfuService { node }
    }
}

#[tarpc::server]
impl Corfu for CorfuService {
    async fn handle(self, _ctx: context::Context, msg: Message) -> Response {
        debug!("node {} receive {}", self.node.endpoint(), msg.detail);
        let (epoch, request_id) = (msg.epoch, msg.request_id);
        // Log units fsync inside `handle`.
        let node = self.node.clone();
        match tokio::task::spawn_blocking(move || node.handle(msg)).await {
            Ok(resp) => resp,
            Err(e) => {
                error!("node {} handle request {}: {}", self.node.endpoint(), request_id, e);
                Response {
                    epoch,
                    request_id,
                    detail: ResponseDetail::error(ErrorKind::Internal, e.to_string()),
                }
            }
        }
    }
}

/// Bind `addr` and return the bound address, together with the future
/// serving `node` on it.
pub async fn listen(
    addr: SocketAddr,
    node: Arc<ServerNode>,
) -> io::Result<(SocketAddr, impl Future<Output = ()>)> {
    use tarpc::serde_transport::tcp;
    use tokio_serde::formats::Json;

    let mut listener = tcp::listen(addr, Json::default).await?;
    listener.config_mut().max_frame_length(usize::MAX);
    let local_addr = listener.local_addr();
    info!("node {} listen on {}", node.endpoint(), local_addr);

    let serving = listener
        .filter_map(|r| future::ready(r.ok()))
        .map(server::BaseChannel::with_defaults)
        .map(move |channel| {
            let service = CorfuService::new(node.clone());
            channel.execute(service.serve())
        })
        .buffer_unordered(MAX_CONNECTIONS)
        .for_each(|_| async {});
    Ok((local_addr, serving))
}
