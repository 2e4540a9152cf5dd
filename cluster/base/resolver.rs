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
use std::fmt::Debug;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, RwLock};

use anyhow::Error;

/// Maps the endpoints named in a layout to socket addresses.
pub trait AddressResolver: Debug + Send + Sync {
    fn insert(&self, endpoint: &str, addr: SocketAddr);
    fn resolve(&self, endpoint: &str) -> Option<SocketAddr>;
    fn refresh(&self) -> Result<(), Error>;
}

/// Endpoints are `host:port` pairs looked up by the system resolver, unless
/// an address was inserted for them.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    address_map: Arc<RwLock<HashMap<String, SocketAddr>>>,
}

impl StaticResolver {
    pub fn new(address_map: HashMap<String, SocketAddr>) -> StaticResolver {
        StaticResolver {
            address_map: Arc::new(RwLock::new(address_map)),
        }
    }

    fn replace(&self, mut address_map: HashMap<String, SocketAddr>) {
        let mut inner = self.address_map.write().unwrap_or_else(|e| e.into_inner());
        std::mem::swap(&mut *inner, &mut address_map);
    }
}

impl AddressResolver for StaticResolver {
    fn insert(&self, endpoint: &str, addr: SocketAddr) {
        let mut inner = self.address_map.write().unwrap_or_else(|e| e.into_inner());
        inner.insert(String::from(endpoint), addr);
    }

    fn resolve(&self, endpoint: &str) -> Option<SocketAddr> {
        let known = self
            .address_map
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint)
            .cloned();
        known.or_else(|| endpoint.to_socket_addrs().ok().and_then(|mut a| a.next()))
    }

    fn refresh(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Reads the endpoint table from a json file `{"endpoint": "ip:port"}`.
#[derive(Debug, Clone)]
pub struct FileBasedResolver {
    file_name: String,
    inner: StaticResolver,
}

impl FileBasedResolver {
    pub fn new(file_name: String) -> FileBasedResolver {
        FileBasedResolver {
            file_name,
            inner: StaticResolver::default(),
        }
    }
}

impl AddressResolver for FileBasedResolver {
    fn insert(&self, endpoint: &str, addr: SocketAddr) {
        self.inner.insert(endpoint, addr);
    }

    fn resolve(&self, endpoint: &str) -> Option<SocketAddr> {
        self.inner.resolve(endpoint)
    }

    fn refresh(&self) -> Result<(), Error> {
        let content = std::fs::read_to_string(&self.file_name)?;
        let address_map: HashMap<String, SocketAddr> = serde_json::from_str(&content)?;
        self.inner.replace(address_map);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn resolve_host_port_endpoints() {
        let resolver = StaticResolver::default();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(resolver.resolve("127.0.0.1:9000"), Some(addr));
        assert_eq!(resolver.resolve("no port"), None);

        let other: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        resolver.insert("unit-1", other);
        assert_eq!(resolver.resolve("unit-1"), Some(other));
    }

    #[test]
    fn resolve_from_named_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"seq\": \"10.0.0.1:7000\"}}").unwrap();
        let resolver = FileBasedResolver::new(file.path().to_string_lossy().into_owned());
        assert_eq!(resolver.resolve("seq"), None);
        resolver.refresh().unwrap();
        assert_eq!(resolver.resolve("seq"), Some("10.0.0.1:7000".parse().unwrap()));
    }
}
