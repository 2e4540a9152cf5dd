//! The crate `runtime` implements the client side of the log: it resolves
//! the layout, acquires tokens, replicates entries and materializes streams.

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

mod address_space;
pub(crate) mod clients;
mod layout_view;
mod management;
mod router;
mod stream;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constant::*;
use crate::error::Error;
use crate::layout::Layout;
use crate::protocol::TokenResponse;
use crate::types::{Address, Epoch, LogData, Payload, StreamId};

pub use self::address_space::AddressSpaceView;
pub use self::clients::{
    backoff, BaseClient, LayoutClient, LogUnitClient, SequencerClient, Transport,
};
pub use self::layout_view::LayoutView;
pub use self::management::ManagementView;
pub use self::router::{LocalRouter, Router};
pub use self::stream::StreamView;

/// The type tag of checkpoint payloads.
pub const CHECKPOINT_TYPE_TAG: &'static str = "corfu.checkpoint";

/// The options for create a corfu runtime.
#[derive(Debug, Clone)]
pub struct RuntimeParameters {
    /// Identifies the runtime, used as the proposer id of paxos ranks.
    ///
    /// default: a random UUID
    pub client_id: Uuid,

    /// The deadline of each request, a request without response before the
    /// deadline has an unknown result.
    ///
    /// default: 5s
    pub request_timeout: Duration,

    /// How long to wait for an epoch change to finish before giving up.
    ///
    /// default: 10s
    pub epoch_timeout: Duration,

    /// How long a reader waits on an empty address before filling a hole
    /// there.
    ///
    /// default: 100ms
    pub hole_fill_grace: Duration,

    /// The number of tokens an append acquires before giving up.
    ///
    /// default: 8
    pub write_retries: usize,

    /// The number of times an undelivered request is resent.
    ///
    /// default: 3
    pub transport_retries: usize,

    /// default: 10
    pub base_backoff_ms: u64,

    /// default: 1000
    pub max_backoff_ms: u64,

    /// The approximately limit of number of bytes of the read cache.
    ///
    /// default: 64MB
    pub max_cache_bytes: usize,
}

impl Default for RuntimeParameters {
    fn default() -> RuntimeParameters {
        RuntimeParameters {
            client_id: Uuid::new_v4(),
            request_timeout: Duration::from_secs(5),
            epoch_timeout: Duration::from_secs(10),
            hole_fill_grace: Duration::from_millis(100),
            write_retries: DEFAULT_WRITE_RETRIES,
            transport_retries: DEFAULT_TRANSPORT_RETRIES,
            base_backoff_ms: 10,
            max_backoff_ms: 1000,
            max_cache_bytes: 64 * 1024 * 1024,
        }
    }
}

/// The payload of a checkpoint entry: the tail of every stream as observed
/// by the sequencer right before `snapshot_address` was issued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub snapshot_address: Address,
    pub stream_tails: BTreeMap<StreamId, Address>,
}

pub struct CorfuRuntime {
    params: RuntimeParameters,
    transport: Transport,
    /// Layout servers known before any layout is fetched.
    seeds: Vec<String>,
    layout: RwLock<Option<Arc<Layout>>>,
    cache: address_space::ReadCache,
}

impl CorfuRuntime {
    pub fn new(params: RuntimeParameters, router: Arc<dyn Router>, seeds: Vec<String>) -> Arc<CorfuRuntime> {
        let transport = Transport::new(router, &params);
        let cache = address_space::ReadCache::new(params.max_cache_bytes);
        Arc::new(CorfuRuntime {
            params,
            transport,
            seeds,
            layout: RwLock::new(None),
            cache,
        })
    }

    pub fn client_id(&self) -> Uuid {
        self.params.client_id
    }

    pub fn parameters(&self) -> &RuntimeParameters {
        &self.params
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Returns the cached layout, fetches one if there is none.
    pub fn layout(&self) -> Result<Arc<Layout>, Error> {
        if let Some(layout) = self.layout.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            return Ok(layout.clone());
        }
        self.fetch_layout()
    }

    fn known_layout_servers(&self) -> Vec<String> {
        let mut servers: BTreeSet<String> = self.seeds.iter().cloned().collect();
        if let Some(layout) = self.layout.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            servers.extend(layout.layout_servers.iter().cloned());
        }
        servers.into_iter().collect()
    }

    /// Ask every known layout server for its layout and install the one with
    /// the highest epoch.
    pub fn fetch_layout(&self) -> Result<Arc<Layout>, Error> {
        let mut latest: Option<Layout> = None;
        let mut last_err = None;
        for endpoint in self.known_layout_servers() {
            match self.transport.layout_server(&endpoint, 0).get_layout() {
                Ok(layout) => {
                    if latest.as_ref().map(|l| l.epoch < layout.epoch).unwrap_or(true) {
                        latest = Some(layout);
                    }
                }
                Err(e) => {
                    debug!(
                        "runtime {} fetch layout from {}: {}",
                        self.params.client_id, endpoint, e
                    );
                    last_err = Some(e);
                }
            }
        }
        match latest {
            Some(layout) => Ok(self.install_layout(layout)),
            None => Err(last_err.unwrap_or_else(|| {
                Error::Unrecoverable(String::from("no layout server is known"))
            })),
        }
    }

    /// Install `layout` unless a layout of a higher epoch is cached.
    pub fn install_layout(&self, layout: Layout) -> Arc<Layout> {
        let mut cached = self.layout.write().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = cached.as_ref() {
            if current.epoch >= layout.epoch {
                return current.clone();
            }
            info!(
                "runtime {} install layout of epoch {}, was {}",
                self.params.client_id, layout.epoch, current.epoch
            );
        }
        let layout = Arc::new(layout);
        *cached = Some(layout.clone());
        layout
    }

    pub fn invalidate_layout(&self) {
        *self.layout.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// A server reported `server_epoch`, wait until the layout of that epoch
    /// is committed.
    pub fn on_wrong_epoch(&self, server_epoch: Epoch) -> Result<Arc<Layout>, Error> {
        let deadline = Instant::now() + self.params.epoch_timeout;
        let mut attempt = 0;
        loop {
            match self.fetch_layout() {
                Ok(layout) if layout.epoch >= server_epoch => return Ok(layout),
                Ok(layout) => debug!(
                    "runtime {} wait layout of epoch {}, current {}",
                    self.params.client_id, server_epoch, layout.epoch
                ),
                Err(e) => warn!(
                    "runtime {} refresh layout: {}",
                    self.params.client_id, e
                ),
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!("layout of epoch {}", server_epoch)));
            }
            std::thread::sleep(backoff(
                self.params.base_backoff_ms,
                self.params.max_backoff_ms,
                attempt,
            ));
            attempt += 1;
        }
    }

    /// Run `op` against the current layout, refreshing the layout whenever a
    /// server reports a newer epoch.
    pub fn with_layout<T, F>(&self, mut op: F) -> Result<T, Error>
    where
        F: FnMut(&Layout) -> Result<T, Error>,
    {
        let mut layout = self.layout()?;
        for _ in 0..self.params.write_retries {
            match op(&layout) {
                Err(Error::WrongEpoch(epoch)) => {
                    layout = self.on_wrong_epoch(std::cmp::max(epoch, layout.epoch + 1))?;
                }
                other => return other,
            }
        }
        Err(Error::Unrecoverable(format!(
            "epoch keeps changing after {} attempts",
            self.params.write_retries
        )))
    }

    /// Acquire `count` addresses for `streams` from the primary sequencer,
    /// returns the token together with the layout it was issued under. A
    /// sequencer which hasn't recovered its state yet is retried until the
    /// epoch timeout.
    pub fn acquire_token(
        &self,
        streams: &BTreeSet<StreamId>,
        count: u64,
    ) -> Result<(Arc<Layout>, TokenResponse), Error> {
        let deadline = Instant::now() + self.params.epoch_timeout;
        let mut layout = self.layout()?;
        let mut attempt = 0;
        loop {
            match self.sequencer(&layout)?.token(streams, count) {
                Ok(resp) => return Ok((layout, resp)),
                Err(Error::WrongEpoch(epoch)) => {
                    layout = self.on_wrong_epoch(std::cmp::max(epoch, layout.epoch + 1))?;
                }
                Err(Error::NotReady(epoch)) => {
                    if Instant::now() >= deadline {
                        return Err(Error::NotReady(epoch));
                    }
                    debug!(
                        "runtime {} wait sequencer of epoch {} to be ready",
                        self.params.client_id, epoch
                    );
                    std::thread::sleep(backoff(
                        self.params.base_backoff_ms,
                        self.params.max_backoff_ms,
                        attempt,
                    ));
                    attempt += 1;
                    // The primary sequencer may have moved meanwhile.
                    match self.fetch_layout() {
                        Ok(latest) => layout = latest,
                        Err(e) => warn!(
                            "runtime {} refresh layout: {}",
                            self.params.client_id, e
                        ),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn sequencer(&self, layout: &Layout) -> Result<SequencerClient, Error> {
        match layout.primary_sequencer() {
            Some(endpoint) => Ok(self.transport.sequencer(endpoint, layout.epoch)),
            None => Err(Error::InvalidLayout(String::from("no sequencers"))),
        }
    }

    /// Install `layout` at every layout server and move the other servers of
    /// the layout to its epoch.
    pub fn bootstrap(&self, layout: &Layout) -> Result<(), Error> {
        layout.validate()?;
        for endpoint in &layout.layout_servers {
            let client = self.transport.layout_server(endpoint, layout.epoch);
            match client.bootstrap(layout) {
                Ok(()) => {}
                Err(Error::AlreadyBootstrapped) if client.get_layout()? == *layout => {}
                Err(e) => return Err(e),
            }
        }
        let mut servers: BTreeSet<String> = layout.log_servers();
        servers.extend(layout.sequencers.iter().cloned());
        for endpoint in &servers {
            self.transport.base(endpoint).seal(layout.epoch)?;
        }
        // The log is empty, the primary sequencer starts from scratch.
        self.sequencer(layout)?.bootstrap(FIRST_ADDRESS, BTreeMap::new())?;
        info!(
            "runtime {} bootstrap cluster at epoch {}",
            self.params.client_id, layout.epoch
        );
        self.install_layout(layout.clone());
        Ok(())
    }

    pub fn address_space(&self) -> AddressSpaceView<'_> {
        AddressSpaceView::new(self)
    }

    pub fn layout_view(&self) -> LayoutView<'_> {
        LayoutView::new(self)
    }

    pub fn management_view(&self) -> ManagementView<'_> {
        ManagementView::new(self)
    }

    pub fn stream(self: &Arc<Self>, id: StreamId) -> StreamView {
        StreamView::new(self.clone(), id)
    }

    /// Append a checkpoint of the sequencer's stream tails, returns the
    /// address of the checkpoint.
    pub fn checkpoint(&self) -> Result<Address, Error> {
        let (_, resp) = self.acquire_token(&BTreeSet::new(), 0)?;
        let record = CheckpointRecord {
            snapshot_address: resp.token.address,
            stream_tails: resp.stream_tails,
        };
        let payload = Payload::encode(CHECKPOINT_TYPE_TAG, &record)?;
        let address = self.address_space().append_entry(LogData::checkpoint(payload))?;
        info!(
            "runtime {} checkpoint {} streams at {}, snapshot address {}",
            self.params.client_id,
            record.stream_tails.len(),
            address,
            record.snapshot_address
        );
        Ok(address)
    }

    pub(crate) fn cache(&self) -> &address_space::ReadCache {
        &self.cache
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use log::{Metadata, Record};

    use crate::datastore::MemDataStore;
    use crate::server::{LayoutServer, LogUnitServer, SequencerServer, ServerNode};
    use crate::storage::MemLogStore;

    struct SimpleLogger;
    impl log::Log for SimpleLogger {
        fn enabled(&self, _metadata: &Metadata) -> bool {
            true
        }

        fn log(&self, record: &Record) {
            println!(
                "[{} - {} - {}:{}] {}",
                record.level(),
                record.target(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            );
        }

        fn flush(&self) {}
    }

    static LOGGER: SimpleLogger = SimpleLogger;
    static SETUP_LOGGER: std::sync::Once = std::sync::Once::new();

    /// An in-process cluster, each endpoint hosts every role.
    pub struct Cluster {
        pub router: Arc<LocalRouter>,
        pub nodes: BTreeMap<String, Arc<ServerNode>>,
        pub layout: Layout,
    }

    impl Cluster {
        pub fn new(names: &[&str], chain: &[&str], epoch: Epoch) -> Cluster {
            SETUP_LOGGER.call_once(|| {
                log::set_logger(&LOGGER)
                    .map(|()| log::set_max_level(log::LevelFilter::Debug))
                    .expect("init logger");
            });

            let router = Arc::new(LocalRouter::new());
            let mut nodes = BTreeMap::new();
            for name in names {
                let node = ServerNode::new(name)
                    .with_layout_server(
                        LayoutServer::new(name, Arc::new(MemDataStore::new())).unwrap(),
                    )
                    .with_sequencer(SequencerServer::new(name))
                    .with_log_unit(LogUnitServer::new(name, Arc::new(MemLogStore::new())));
                let node = Arc::new(node);
                router.register(name, node.clone());
                nodes.insert(String::from(*name), node);
            }
            let endpoints = |list: &[&str]| list.iter().map(|s| String::from(*s)).collect();
            let mut layout = Layout::new(endpoints(names), endpoints(names), endpoints(chain));
            layout.epoch = epoch;
            Cluster {
                router,
                nodes,
                layout,
            }
        }

        pub fn params() -> RuntimeParameters {
            RuntimeParameters {
                hole_fill_grace: Duration::from_millis(20),
                epoch_timeout: Duration::from_secs(2),
                base_backoff_ms: 1,
                max_backoff_ms: 20,
                transport_retries: 1,
                ..Default::default()
            }
        }

        pub fn runtime_with(&self, params: RuntimeParameters) -> Arc<CorfuRuntime> {
            CorfuRuntime::new(
                params,
                self.router.clone(),
                self.layout.layout_servers.clone(),
            )
        }

        pub fn runtime(&self) -> Arc<CorfuRuntime> {
            self.runtime_with(Cluster::params())
        }

        /// Bootstrap the cluster, returns a connected runtime.
        pub fn bootstrap(&self) -> Arc<CorfuRuntime> {
            let rt = self.runtime();
            rt.bootstrap(&self.layout).unwrap();
            rt
        }
    }

    #[test]
    fn bootstrap_and_fetch_layout() {
        let cluster = Cluster::new(&["a", "b", "c"], &["a", "b"], 3);
        let rt = cluster.bootstrap();
        assert_eq!(rt.layout().unwrap().epoch, 3);
        for node in cluster.nodes.values() {
            assert_eq!(node.epoch(), 3);
        }

        let other = cluster.runtime();
        assert_eq!(*other.layout().unwrap(), cluster.layout);
        // bootstrapping the same layout again is accepted.
        other.bootstrap(&cluster.layout).unwrap();

        let mut conflict = cluster.layout.clone();
        conflict.sequencers.reverse();
        assert_eq!(
            matches!(other.bootstrap(&conflict), Err(Error::AlreadyBootstrapped)),
            true
        );
    }

    #[test]
    fn unbootstrapped_cluster() {
        let cluster = Cluster::new(&["a"], &["a"], 0);
        let rt = cluster.runtime();
        assert_eq!(matches!(rt.layout(), Err(Error::NotBootstrapped)), true);
    }

    #[test]
    fn install_layout_never_goes_backward() {
        let cluster = Cluster::new(&["a"], &["a"], 2);
        let rt = cluster.bootstrap();
        let mut old = cluster.layout.clone();
        old.epoch = 1;
        assert_eq!(rt.install_layout(old).epoch, 2);
        rt.invalidate_layout();
        assert_eq!(rt.layout().unwrap().epoch, 2);
    }
}
