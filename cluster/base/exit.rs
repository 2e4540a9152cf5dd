//! Process exit codes of the binaries.

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

use crate::config::ConfigError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const CONFIG_ERROR: i32 = 2;
pub const UNREACHABLE: i32 = 3;
pub const CONFLICT: i32 = 4;

pub fn of(err: &corfu::Error) -> i32 {
    use corfu::Error;
    match err {
        Error::Disconnected(_)
        | Error::Timeout(_)
        | Error::NotBootstrapped
        | Error::NotReady(_) => UNREACHABLE,
        Error::AlreadyBootstrapped
        | Error::Overwrite(_)
        | Error::Rejected(_)
        | Error::WrongEpoch(_)
        | Error::IllegalState(_) => CONFLICT,
        Error::InvalidLayout(_) => CONFIG_ERROR,
        _ => FAILURE,
    }
}

/// The exit code of an error chain, by its first recognized cause.
pub fn of_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<ConfigError>().is_some() {
            return CONFIG_ERROR;
        }
        if let Some(e) = cause.downcast_ref::<corfu::Error>() {
            return of(e);
        }
    }
    FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;

    use anyhow::Context;

    #[test]
    fn classify_errors() {
        assert_eq!(of(&corfu::Error::Timeout(String::from("a"))), UNREACHABLE);
        assert_eq!(of(&corfu::Error::NotBootstrapped), UNREACHABLE);
        assert_eq!(of(&corfu::Error::NotReady(3)), UNREACHABLE);
        assert_eq!(of(&corfu::Error::AlreadyBootstrapped), CONFLICT);
        assert_eq!(of(&corfu::Error::WrongEpoch(2)), CONFLICT);
        assert_eq!(of(&corfu::Error::InvalidLayout(String::new())), CONFIG_ERROR);
        assert_eq!(of(&corfu::Error::Corrupted(String::new())), FAILURE);

        let err = Err::<(), _>(corfu::Error::Disconnected(String::from("a")))
            .context("query layout")
            .unwrap_err();
        assert_eq!(of_error(&err), UNREACHABLE);

        let err = anyhow::Error::new(ConfigError::InvalidValue {
            name: String::from("x"),
            value: String::from("y"),
        });
        assert_eq!(of_error(&err), CONFIG_ERROR);
        assert_eq!(of_error(&anyhow::anyhow!("other")), FAILURE);
    }
}
