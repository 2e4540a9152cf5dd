//! The crate `buffer` provides reference counted serialized forms of log
//! entries, whose buffers are recycled through a bounded pool.

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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use log::trace;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

/// The refcount value of a form whose buffer went back to the pool.
const RETURNED: usize = usize::MAX;

struct PoolCore {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_bytes: usize,
}

/// A pool of byte buffers, it keeps at most `max_bytes` of capacity.
#[derive(Clone)]
pub struct BufferPool {
    core: Arc<PoolCore>,
}

impl BufferPool {
    pub fn new(max_bytes: usize) -> BufferPool {
        BufferPool {
            core: Arc::new(PoolCore {
                buffers: Mutex::new(Vec::new()),
                max_bytes,
            }),
        }
    }

    pub fn allocate(&self) -> Vec<u8> {
        let mut buffers = self.core.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.pop().unwrap_or_default()
    }

    pub fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut buffers = self.core.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let pooled: usize = buffers.iter().map(|b| b.capacity()).sum();
        if pooled + buf.capacity() <= self.core.max_bytes {
            buffers.push(buf);
        }
    }

    /// The number of buffers waiting for reuse.
    pub fn num_pooled(&self) -> usize {
        self.core.buffers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("max_bytes", &self.core.max_bytes)
            .field("num_pooled", &self.num_pooled())
            .finish()
    }
}

struct FormCore {
    bytes: RwLock<Vec<u8>>,
    refs: AtomicUsize,
    pool: BufferPool,
}

impl FormCore {
    fn try_return(&self) {
        if self
            .refs
            .compare_exchange(0, RETURNED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let mut bytes = self.bytes.write().unwrap_or_else(|e| e.into_inner());
            let buf = std::mem::take(&mut *bytes);
            trace!("return serialized buffer of {} bytes to pool", buf.len());
            self.pool.release(buf);
        }
    }
}

impl Drop for FormCore {
    fn drop(&mut self) {
        // A form nobody acquired still owns a pooled buffer.
        self.try_return();
    }
}

/// The serialized bytes of an entry. The bytes are accessed through
/// `SerializationHandle`s, when the last handle is dropped the buffer is
/// given back to the pool and the form can't be acquired anymore.
#[derive(Clone)]
pub struct SerializedForm {
    core: Arc<FormCore>,
}

impl SerializedForm {
    pub fn serialize<T: Serialize>(pool: &BufferPool, value: &T) -> Result<SerializedForm, Error> {
        let mut buf = pool.allocate();
        if let Err(err) = serde_json::to_writer(&mut buf, value) {
            pool.release(buf);
            return Err(err.into());
        }
        Ok(SerializedForm {
            core: Arc::new(FormCore {
                bytes: RwLock::new(buf),
                refs: AtomicUsize::new(0),
                pool: pool.clone(),
            }),
        })
    }

    pub fn acquire(&self) -> Result<SerializationHandle, Error> {
        let acquired = self
            .core
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                if refs == RETURNED {
                    None
                } else {
                    Some(refs + 1)
                }
            });
        match acquired {
            Ok(_) => Ok(SerializationHandle {
                core: self.core.clone(),
            }),
            Err(_) => Err(Error::IllegalState(String::from(
                "acquire a serialized form which was released",
            ))),
        }
    }

    pub fn ref_count(&self) -> usize {
        match self.core.refs.load(Ordering::Acquire) {
            RETURNED => 0,
            refs => refs,
        }
    }

    pub fn is_released(&self) -> bool {
        self.core.refs.load(Ordering::Acquire) == RETURNED
    }
}

/// A scoped acquisition of a serialized form.
pub struct SerializationHandle {
    core: Arc<FormCore>,
}

impl SerializationHandle {
    pub fn bytes(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.core.bytes.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.bytes())?)
    }
}

impl Drop for SerializationHandle {
    fn drop(&mut self) {
        if self.core.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.core.try_return();
        }
    }
}
