//! The crate `datastore` defines a small persistent key value store, used by
//! servers to keep their durable state.

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
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

pub trait DataStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Durably store `value` under `key` before returning.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error>;
}

pub fn get_json<T, D>(store: &D, key: &str) -> Result<Option<T>, Error>
where
    T: DeserializeOwned,
    D: DataStore + ?Sized,
{
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub fn put_json<T, D>(store: &D, key: &str, value: &T) -> Result<(), Error>
where
    T: Serialize,
    D: DataStore + ?Sized,
{
    let bytes = serde_json::to_vec(value)?;
    store.put(key, &bytes)
}

#[derive(Debug, Default)]
pub struct MemDataStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemDataStore {
    pub fn new() -> MemDataStore {
        MemDataStore::default()
    }
}

impl DataStore for MemDataStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(String::from(key), value.to_vec());
        Ok(())
    }
}

/// A `DataStore` keeping each key in its own file under a directory.
#[derive(Debug)]
pub struct FileDataStore {
    dir: PathBuf,
    sync: bool,
    // Serializes writers of the same key.
    lock: Mutex<()>,
}

impl FileDataStore {
    pub fn open<P: AsRef<Path>>(dir: P, sync: bool) -> Result<FileDataStore, Error> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(FileDataStore {
            dir: dir.as_ref().to_path_buf(),
            sync,
            lock: Mutex::new(()),
        })
    }

    fn file_name(key: &str) -> Result<String, Error> {
        if key.is_empty() || key.contains(|c: char| c == '/' || c == '\\' || c == '.') {
            return Err(Error::IllegalState(format!("invalid datastore key {:?}", key)));
        }
        Ok(format!("{}.ds", key))
    }
}

impl DataStore for FileDataStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let path = self.dir.join(FileDataStore::file_name(key)?);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut content = vec![];
        file.read_to_end(&mut content)?;
        Ok(Some(content))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let name = FileDataStore::file_name(key)?;
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        write_file_atomically(&self.dir, &name, value, self.sync)
    }
}

/// Replace `dir/name` with `content`: the content is written to a temporary
/// file first, which is then renamed over the target.
pub fn write_file_atomically(dir: &Path, name: &str, content: &[u8], sync: bool) -> Result<(), Error> {
    let tmp_path = dir.join(format!("{}.tmp", name));
    let path = dir.join(name);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        if sync {
            file.sync_all()?;
        }
    }
    std::fs::rename(&tmp_path, &path)?;
    if sync {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}
