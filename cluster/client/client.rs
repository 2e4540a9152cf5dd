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
extern crate serde_json;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base::config::{Config, ConfigError};
use base::resolver::{AddressResolver, FileBasedResolver, StaticResolver};
use base::sdk::NetworkRouter;
use base::{exit, slog};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use corfu::{CorfuRuntime, Layout, Router};

fn make_router(config: &Config) -> Result<Arc<dyn Router>> {
    match &config.named_file {
        Some(file_name) => {
            let resolver = FileBasedResolver::new(file_name.clone());
            resolver
                .refresh()
                .with_context(|| format!("resolve address from {}", file_name))?;
            Ok(Arc::new(NetworkRouter::new(resolver)?))
        }
        None => Ok(Arc::new(NetworkRouter::new(StaticResolver::default())?)),
    }
}

fn make_runtime(config: &Config, seeds: Vec<String>) -> Result<Arc<CorfuRuntime>> {
    if seeds.is_empty() {
        return Err(ConfigError::InvalidValue {
            name: String::from("layout-servers"),
            value: String::new(),
        }
        .into());
    }
    let router = make_router(config)?;
    Ok(CorfuRuntime::new(config.runtime_parameters(), router, seeds))
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .value_of(name)
        .ok_or_else(|| anyhow!("argument {} is required", name))
}

fn bootstrap(config: &Config, matches: &ArgMatches) -> Result<()> {
    let file_name = required(matches, "layout")?;
    let content = std::fs::read_to_string(file_name)
        .map_err(|e| ConfigError::Read(String::from(file_name), e))?;
    let layout = Layout::from_json(&content)?;
    let rt = make_runtime(config, layout.layout_servers.clone())?;
    rt.bootstrap(&layout)
        .with_context(|| format!("bootstrap layout of epoch {}", layout.epoch))?;
    println!("bootstrap cluster at epoch {}", layout.epoch);
    Ok(())
}

fn query_layout(config: &Config) -> Result<()> {
    let rt = make_runtime(config, config.layout_servers.clone())?;
    let layout = rt.fetch_layout().context("query layout")?;
    println!("{}", serde_json::to_string_pretty(&*layout)?);
    Ok(())
}

fn trim(config: &Config, matches: &ArgMatches) -> Result<()> {
    let value = required(matches, "address")?;
    let address: i64 = value.parse().map_err(|_| ConfigError::InvalidValue {
        name: String::from("address"),
        value: String::from(value),
    })?;
    let rt = make_runtime(config, config.layout_servers.clone())?;
    let view = rt.address_space();
    if matches.is_present("single") {
        view.trim(address)
            .with_context(|| format!("trim address {}", address))?;
        println!("trim address {}", address);
    } else {
        view.prefix_trim(address)
            .with_context(|| format!("prefix trim to {}", address))?;
        println!("trim prefix up to address {}", address);
    }
    Ok(())
}

fn ping(config: &Config, matches: &ArgMatches) -> Result<()> {
    let endpoint = required(matches, "endpoint")?;
    let rt = make_runtime(config, vec![String::from(endpoint)])?;
    let epoch = rt
        .transport()
        .base(endpoint)
        .ping()
        .with_context(|| format!("ping {}", endpoint))?;
    println!("{} is alive at epoch {}", endpoint, epoch);
    Ok(())
}

fn run() -> Result<()> {
    slog::init(log::LevelFilter::Warn).map_err(|e| anyhow!("init logger: {}", e))?;

    let matches = App::new("corfu-cli")
        .version("v0.1.0")
        .about("administrate a corfu cluster")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("path of config file"),
        )
        .arg(
            Arg::with_name("layout-servers")
                .long("layout-servers")
                .takes_value(true)
                .help("comma separated endpoints of layout servers"),
        )
        .subcommand(
            SubCommand::with_name("bootstrap")
                .about("install the initial layout on every server of it")
                .arg(
                    Arg::with_name("layout")
                        .long("layout")
                        .takes_value(true)
                        .required(true)
                        .help("path of layout json file"),
                ),
        )
        .subcommand(SubCommand::with_name("query-layout").about("print the committed layout"))
        .subcommand(
            SubCommand::with_name("trim")
                .about("trim the log up to and including an address")
                .arg(
                    Arg::with_name("address")
                        .long("address")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("single")
                        .long("single")
                        .help("only trim the given address"),
                ),
        )
        .subcommand(
            SubCommand::with_name("ping")
                .about("check whether a server is alive")
                .arg(
                    Arg::with_name("endpoint")
                        .long("endpoint")
                        .takes_value(true)
                        .required(true),
                ),
        )
        .get_matches();

    let mut config = Config::load(matches.value_of("config"))?;
    if let Some(list) = matches.value_of("layout-servers") {
        config.set_layout_servers(list)?;
    }

    match matches.subcommand() {
        ("bootstrap", Some(sub)) => bootstrap(&config, sub),
        ("query-layout", Some(_)) => query_layout(&config),
        ("trim", Some(sub)) => trim(&config, sub),
        ("ping", Some(sub)) => ping(&config, sub),
        (name, _) => Err(anyhow!("unknown command {}", name)),
    }
}

fn main() {
    let code = match run() {
        Ok(()) => exit::SUCCESS,
        Err(e) => {
            eprintln!("corfu-cli: {:#}", e);
            exit::of_error(&e)
        }
    };
    std::process::exit(code);
}
