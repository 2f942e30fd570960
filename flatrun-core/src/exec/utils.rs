/*
 * flatrun-core
 *
 * Copyright (C) 2023-2024 Xavier Moffett <sapphirus@azorium.net>
 * SPDX-License-Identifier: GPL-3.0-only
 *
 * This library is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, version 3.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Auxiliary process bookkeeping shared by the supervisor and bus proxies.
//!
//! Grounded on `exec/utils.rs::wait_on_process`/`decode_info_json`; the
//! latter is adapted from reading a pipe tee'd off `--info-fd` to reading
//! the `bwrapinfo.json` file directly, since the instance directory now
//! supplies a real path for `--info-fd` to write into (§6 instance layout).

use std::{fs::read_to_string, path::Path, process::Child};

use serde_yaml::Value;

use crate::{err, Error, ErrorKind, Result};

pub fn wait_on_process(name: &'static str, mut child: Child) -> Result<()> {
    match child.wait() {
        Ok(_) => Ok(()),
        Err(error) => err!(ErrorKind::ProcessWaitFailure(name, error.kind())),
    }
}

/// Read `child-pid` out of the instance's `bwrapinfo.json`; `None` if the
/// supervisor has not yet written it (caller retries with backoff).
pub fn read_info_file(path: &Path) -> Result<Option<i32>> {
    let content = match read_to_string(path) {
        Ok(content) if !content.is_empty() => content,
        Ok(_) => return Ok(None),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => err!(ErrorKind::IOError(path.display().to_string(), error.kind()))?,
    };

    match serde_yaml::from_str::<Value>(&content) {
        Ok(value) => Ok(value["child-pid"].as_u64().map(|pid| pid as i32)),
        Err(_) => err!(ErrorKind::Message("Unable to parse bwrapinfo.json written by the supervisor.")),
    }
}
