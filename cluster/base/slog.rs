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

use chrono::{DateTime, Local};
use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};

/// Dependencies too chatty to be worth printing.
const QUIET_TARGETS: &[&str] = &["tokio", "mio", "tarpc", "hyper"];

/// Prints records to stdout as `[<level letter><time> - file:line] message`.
#[derive(Debug)]
pub struct SimpleLogger;

static LOGGER: SimpleLogger = SimpleLogger;

/// Install the process logger.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(level))
}

impl SimpleLogger {
    fn prefix(level: Level) -> String {
        let now: DateTime<Local> = Local::now();
        let letter = match level {
            Level::Error => "E",
            Level::Warn => "W",
            Level::Info => "I",
            Level::Debug => "D",
            Level::Trace => "T",
        };
        format!("{}{}", letter, now.format("%Y-%m-%d %H:%M:%S%.3f"))
    }

    fn is_quiet(target: &str) -> bool {
        QUIET_TARGETS.iter().any(|t| target.starts_with(t))
    }
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.target().starts_with("corfu") {
            return true;
        }
        !SimpleLogger::is_quiet(metadata.target()) && metadata.level() < Level::Trace
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!(
                "[{} - {}:{}] {}",
                SimpleLogger::prefix(record.level()),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}
