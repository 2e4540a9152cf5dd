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

use std::io::{Error as IoError, ErrorKind};
use std::path::Path;

use corfu::datastore::DataStore;
use corfu::Error;
use log::info;

fn to_io_error(e: rocksdb::Error) -> IoError {
    IoError::new(ErrorKind::Other, e)
}

/// Keeps the paxos state of a layout server in RocksDB.
pub struct RocksDataStore {
    db: rocksdb::DB,
}

assert_impl_all!(RocksDataStore: Send, Sync);

impl RocksDataStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<RocksDataStore, Error> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path.as_ref()).map_err(to_io_error)?;
        info!("open data store at {}", path.as_ref().display());
        Ok(RocksDataStore { db })
    }
}

impl DataStore for RocksDataStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.db.get(key.as_bytes()).map_err(to_io_error)?)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let mut opts = rocksdb::WriteOptions::default();
        opts.set_sync(true);
        self.db
            .put_opt(key.as_bytes(), value, &opts)
            .map_err(to_io_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use corfu::protocol::{Message, MsgDetail, ResponseDetail};
    use corfu::{Layout, LayoutServer, Server};

    #[test]
    fn layout_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let store = RocksDataStore::open(dir.path()).unwrap();
            assert_eq!(store.get("missing").unwrap(), None);
            store.put("k", b"v1").unwrap();
            store.put("k", b"v2").unwrap();
            assert_eq!(store.get("k").unwrap(), Some(b"v2".to_vec()));
        }

        let names = vec![String::from("a:1")];
        let layout = Layout::new(names.clone(), names.clone(), names);
        {
            let store = Arc::new(RocksDataStore::open(dir.path()).unwrap());
            let server = LayoutServer::new("a:1", store).unwrap();
            let msg = Message::new(0, MsgDetail::LayoutBootstrap { layout: layout.clone() });
            let resp = server.handle(msg);
            assert_eq!(matches!(resp.detail, ResponseDetail::Ok), true);
        }
        let store = Arc::new(RocksDataStore::open(dir.path()).unwrap());
        assert_eq!(store.get("k").unwrap(), Some(b"v2".to_vec()));
        let server = LayoutServer::new("a:1", store).unwrap();
        assert_eq!(server.current_layout(), Some(layout));
    }
}
