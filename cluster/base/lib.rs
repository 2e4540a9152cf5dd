//! Deployment glue of corfu: the rpc service wrapping `corfu::Server`, a
//! network `corfu::Router`, configuration and the process logger.

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

extern crate chrono;
extern crate corfu;
extern crate futures;
extern crate log;
extern crate serde;
extern crate tarpc;
extern crate thiserror;
extern crate tokio;
extern crate tokio_serde;
extern crate toml;

pub mod config;
pub mod exit;
pub mod resolver;
pub mod sdk;
pub mod service;
pub mod slog;

pub mod proto {
    pub mod corfu;
}
