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

pub mod channel;
mod router;

use std::net::SocketAddr;

use crate::proto::corfu as pc;

pub use router::NetworkRouter;

pub type CorfuChannelMap = channel::ChannelMap<pc::CorfuClient>;

pub async fn new_corfu_connect(addr: SocketAddr) -> std::io::Result<pc::CorfuClient> {
    use tarpc::client::Config;
    use tarpc::serde_transport::tcp;
    use tokio_serde::formats::Json;
    let transport = tcp::connect(addr, Json::default).await?;
    pc::CorfuClient::new(Config::default(), transport).spawn()
}
