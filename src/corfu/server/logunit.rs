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

use std::sync::Arc;

use log::{debug, info, trace, warn};

use super::Server;
use crate::error::Error;
use crate::protocol::{Message, MsgDetail, Response, ResponseDetail};
use crate::storage::{AppendOutcome, LogStore};
use crate::types::{Address, DataType, Epoch, LogData};

/// Persists entries of the addresses it is responsible for.
pub struct LogUnitServer {
    endpoint: String,
    store: Arc<dyn LogStore>,
}

impl LogUnitServer {
    pub fn new(endpoint: &str, store: Arc<dyn LogStore>) -> LogUnitServer {
        info!(
            "unit {} start at epoch {}, trim mark {}, global tail {}",
            endpoint,
            store.epoch(),
            store.trim_mark(),
            store.global_tail()
        );
        LogUnitServer {
            endpoint: String::from(endpoint),
            store,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.store.epoch()
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Reject stale messages, messages of a higher epoch seal the unit.
    fn check_epoch(&self, epoch: Epoch) -> Result<(), Error> {
        let unit_epoch = self.store.epoch();
        if epoch < unit_epoch {
            return Err(Error::WrongEpoch(unit_epoch));
        }
        if epoch > unit_epoch {
            info!(
                "unit {} sealed by message of epoch {}, was {}",
                self.endpoint, epoch, unit_epoch
            );
            self.store.set_epoch(epoch)?;
        }
        Ok(())
    }

    fn seal(&self, epoch: Epoch) -> Result<ResponseDetail, Error> {
        let unit_epoch = self.store.epoch();
        if epoch < unit_epoch {
            return Err(Error::WrongEpoch(unit_epoch));
        }
        if epoch > unit_epoch {
            self.store.set_epoch(epoch)?;
            info!("unit {} sealed at epoch {}", self.endpoint, epoch);
        }
        Ok(ResponseDetail::Ok)
    }

    fn write(&self, entry: &LogData) -> Result<ResponseDetail, Error> {
        let unit_epoch = self.store.epoch();
        if entry.epoch < unit_epoch {
            return Err(Error::WrongEpoch(unit_epoch));
        }
        if entry.data_type != DataType::Data && entry.data_type != DataType::Checkpoint {
            return Err(Error::IllegalState(format!(
                "write entry of type {} at {}",
                entry.data_type, entry.global_address
            )));
        }
        let address = entry.global_address;
        match self.store.append(entry)? {
            AppendOutcome::Written => {
                debug!("unit {} write address {}", self.endpoint, address);
                Ok(ResponseDetail::Ok)
            }
            // An identical retry is acknowledged.
            AppendOutcome::Exists(existing) if existing == *entry => Ok(ResponseDetail::Ok),
            AppendOutcome::Exists(existing) => {
                debug!(
                    "unit {} reject overwrite of address {} holding {}",
                    self.endpoint, address, existing.data_type
                );
                Err(Error::Overwrite(address))
            }
        }
    }

    fn fill_hole(&self, epoch: Epoch, address: Address) -> Result<ResponseDetail, Error> {
        let hole = LogData::hole(address, epoch);
        match self.store.append(&hole)? {
            AppendOutcome::Written => {
                warn!("unit {} fill hole at address {}", self.endpoint, address);
                Ok(ResponseDetail::Ok)
            }
            AppendOutcome::Exists(existing) if existing.is_hole() => Ok(ResponseDetail::Ok),
            AppendOutcome::Exists(_) => Err(Error::Overwrite(address)),
        }
    }

    fn read(&self, address: Address) -> Result<ResponseDetail, Error> {
        let entry = self.store.read(address)?;
        trace!(
            "unit {} read address {}: {}",
            self.endpoint,
            address,
            entry.data_type
        );
        match entry.data_type {
            DataType::Empty => Ok(ResponseDetail::Empty),
            DataType::Trimmed => Ok(ResponseDetail::Trimmed {
                trim_mark: self.store.trim_mark(),
            }),
            _ => Ok(ResponseDetail::ReadResult(entry)),
        }
    }

    fn dispatch(&self, msg: &Message) -> Result<ResponseDetail, Error> {
        if let MsgDetail::Seal = &msg.detail {
            return self.seal(msg.epoch);
        }
        self.check_epoch(msg.epoch)?;
        match &msg.detail {
            MsgDetail::Write { entry } => self.write(entry),
            MsgDetail::Read { address } => self.read(*address),
            MsgDetail::FillHole { address } => self.fill_hole(msg.epoch, *address),
            MsgDetail::Trim { address } => {
                self.store.trim(*address)?;
                info!("unit {} trim address {}", self.endpoint, address);
                Ok(ResponseDetail::Ok)
            }
            MsgDetail::PrefixTrim { address } => {
                self.store.prefix_trim(*address)?;
                info!(
                    "unit {} prefix trim to {}, trim mark {}",
                    self.endpoint,
                    address,
                    self.store.trim_mark()
                );
                Ok(ResponseDetail::Ok)
            }
            MsgDetail::LogTail => Ok(ResponseDetail::Tail {
                global_tail: self.store.global_tail(),
                trim_mark: self.store.trim_mark(),
            }),
            _ => Err(Error::IllegalState(format!("unit receive {}", msg.detail))),
        }
    }
}

impl Server for LogUnitServer {
    fn handle(&self, msg: Message) -> Response {
        let detail = match self.dispatch(&msg) {
            Ok(detail) => detail,
            Err(err) => {
                if let Error::Io(_) | Error::Corrupted(_) = &err {
                    warn!("unit {} serve {}: {}", self.endpoint, msg.detail, err);
                }
                ResponseDetail::from_error(&err)
            }
        };
        msg.reply(self.store.epoch(), detail)
    }
}
