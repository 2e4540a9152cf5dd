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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Connections shared by every request to the same address.
#[derive(Debug, Clone)]
pub struct ChannelMap<C: Clone> {
    channels: Arc<Mutex<HashMap<SocketAddr, C>>>,
}

impl<C: Clone> Default for ChannelMap<C> {
    fn default() -> Self {
        ChannelMap {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<C: Clone> ChannelMap<C> {
    pub fn new() -> ChannelMap<C> {
        ChannelMap::default()
    }

    fn inner(&self) -> MutexGuard<'_, HashMap<SocketAddr, C>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn select(&self, addr: SocketAddr) -> Option<C> {
        self.inner().get(&addr).cloned()
    }

    /// Returns the channel kept for `addr`, which is `client` unless another
    /// one was inserted first.
    pub fn insert_if_not_exists(&self, addr: SocketAddr, client: C) -> C {
        self.inner().entry(addr).or_insert(client).clone()
    }

    pub fn erase(&self, addr: SocketAddr) {
        self.inner().remove(&addr);
    }

    pub fn len(&self) -> usize {
        self.inner().len()
    }
}
