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

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{remove_file, File},
    os::unix::fs::MetadataExt,
    path::Path,
};

use crate::{err, impl_error, Error, ErrorGeneric, ErrorTrait, Result};

#[derive(Debug)]
pub enum LockError {
    Locked(String),
    NotAcquired,
}

impl Display for LockError {
    fn fmt(&self, fmter: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Locked(lock) => write!(fmter, "Lock file is present: '{}'", lock),
            Self::NotAcquired => write!(fmter, "Lock not acquired."),
        }
    }
}

impl_error!(LockError);

/// A single-holder advisory lock backed by the existence of a file at
/// `lock`. Used for per-instance state (the pidfile lock); the per-ref
/// deploy lock is a separate, shared `flock`-backed type in `store.rs`,
/// since multiple launches must be able to hold it concurrently.
pub struct Lock {
    lock: String,
    time: i64,
}

impl Lock {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            lock: path.into(),
            time: 0,
        }
    }

    pub fn lock(mut self) -> Result<Self> {
        if self.exists() {
            err!(LockError::Locked(self.lock.clone()))?
        }

        File::create(&self.lock).prepend(|| format!("Failed to create lock file '{}'", self.lock))?;
        self.time = Path::new(&self.lock)
            .metadata()
            .prepend(|| format!("Failed to acquire metadata on lock file '{}'", self.lock))?
            .ctime();
        Ok(self)
    }

    pub fn assert(&self) -> Result<()> {
        if !self.exists()
            || Path::new(&self.lock)
                .metadata()
                .prepend(|| format!("Failed to acquire metadata on lock file '{}'", self.lock))?
                .ctime()
                != self.time
        {
            err!(LockError::NotAcquired)?
        }

        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        Ok(remove_file(&self.lock).prepend(|| format!("Failed to remove lock file '{}'", self.lock))?)
    }

    pub fn exists(&self) -> bool {
        Path::new(&self.lock).exists()
    }
}
