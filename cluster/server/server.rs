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

extern crate anyhow;
extern crate base;
extern crate clap;
extern crate corfu;
extern crate log;
extern crate rocksdb;
#[macro_use]
extern crate static_assertions;
extern crate tokio;

mod store;

use std::collections::BTreeSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base::config::{Config, ConfigError};
use base::{exit, service, slog};
use clap::{App, Arg};
use corfu::storage::SegmentedLogStore;
use corfu::{LayoutServer, LogUnitServer, SequencerServer, ServerNode};
use log::{error, info};

use crate::store::RocksDataStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Role {
    Layout,
    Sequencer,
    LogUnit,
}

fn parse_roles(value: &str) -> Result<BTreeSet<Role>, ConfigError> {
    let mut roles = BTreeSet::new();
    for name in value.split(',').map(|s| s.trim()) {
        match name {
            "all" => {
                roles.insert(Role::Layout);
                roles.insert(Role::Sequencer);
                roles.insert(Role::LogUnit);
            }
            "layout" => {
                roles.insert(Role::Layout);
            }
            "sequencer" => {
                roles.insert(Role::Sequencer);
            }
            "logunit" => {
                roles.insert(Role::LogUnit);
            }
            _ => {
                return Err(ConfigError::InvalidValue {
                    name: String::from("role"),
                    value: String::from(value),
                })
            }
        }
    }
    Ok(roles)
}

fn parse_addr(value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::InvalidValue {
            name: String::from("addr"),
            value: String::from(value),
        })
}

fn build_node(endpoint: &str, roles: &BTreeSet<Role>, config: &Config) -> Result<ServerNode> {
    let mut node = ServerNode::new(endpoint);
    if roles.contains(&Role::Layout) {
        let path = config.data_dir.join("layout");
        std::fs::create_dir_all(&path)
            .with_context(|| format!("create dir {}", path.display()))?;
        let store = RocksDataStore::open(&path)?;
        node = node.with_layout_server(LayoutServer::new(endpoint, Arc::new(store))?);
    }
    if roles.contains(&Role::Sequencer) {
        node = node.with_sequencer(SequencerServer::new(endpoint));
    }
    if roles.contains(&Role::LogUnit) {
        let path = config.data_dir.join("log");
        let store = SegmentedLogStore::open(&path, config.segment_options())?;
        node = node.with_log_unit(LogUnitServer::new(endpoint, Arc::new(store)));
    }
    Ok(node)
}

fn run() -> Result<()> {
    slog::init(log::LevelFilter::Info).map_err(|e| anyhow!("init logger: {}", e))?;

    let matches = App::new("corfu-server")
        .version("v0.1.0")
        .about("serve the roles of a corfu cluster")
        .arg(
            Arg::with_name("role")
                .long("role")
                .takes_value(true)
                .default_value("all")
                .help("comma separated roles: layout, sequencer, logunit or all"),
        )
        .arg(
            Arg::with_name("addr")
                .long("addr")
                .takes_value(true)
                .required(true)
                .help("host:port to listen on"),
        )
        .arg(
            Arg::with_name("endpoint")
                .long("endpoint")
                .takes_value(true)
                .help("name of this server in layouts, defaults to addr"),
        )
        .arg(
            Arg::with_name("data-dir")
                .long("data-dir")
                .takes_value(true)
                .help("directory of persistent state"),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("path of config file"),
        )
        .get_matches();

    let mut config = Config::load(matches.value_of("config"))?;
    if let Some(dir) = matches.value_of("data-dir") {
        config.data_dir = dir.into();
    }
    let addr_value = matches.value_of("addr").unwrap_or_default();
    let addr = parse_addr(addr_value)?;
    let endpoint = matches.value_of("endpoint").unwrap_or(addr_value);
    let roles = parse_roles(matches.value_of("role").unwrap_or("all"))?;

    let node = Arc::new(build_node(endpoint, &roles, &config)?);
    info!(
        "server {} start with roles {:?}, data dir {}",
        endpoint,
        roles,
        config.data_dir.display()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let (_, serving) = service::listen(addr, node).await?;
        serving.await;
        Ok::<(), anyhow::Error>(())
    })
}

fn main() {
    let code = match run() {
        Ok(()) => exit::SUCCESS,
        Err(e) => {
            error!("corfu-server: {:#}", e);
            eprintln!("corfu-server: {:#}", e);
            exit::of_error(&e)
        }
    };
    std::process::exit(code);
}
