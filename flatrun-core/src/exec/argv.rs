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

//! Ordered supervisor argument buffer with attached file descriptors.
//!
//! Grounded on `exec/args.rs::ExecutionArgs` (the original categorized
//! bind/env/sys argument buffer) generalized into a single ordered sequence:
//! components that need a specific emission order (`exports`, in particular)
//! build their own ordered directive list and append it here in one pass,
//! rather than the buffer itself categorizing arguments by kind.

use std::{
    fmt::{Debug, Formatter},
    io::Write,
    os::fd::{AsRawFd, OwnedFd, RawFd},
};

use memfd::{Memfd, MemfdOptions};

use crate::{err, impl_error, Error, Result};

#[derive(Debug, Clone)]
pub enum EnvSetupError {
    MemfdCreate(String),
    MemfdWrite(String),
    MemfdSeal(String),
}

impl std::fmt::Display for EnvSetupError {
    fn fmt(&self, fmter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemfdCreate(name) => write!(fmter, "Failed to create sealed memfd '{name}'."),
            Self::MemfdWrite(name) => write!(fmter, "Failed to write sealed memfd '{name}'."),
            Self::MemfdSeal(name) => write!(fmter, "Failed to seal memfd '{name}'."),
        }
    }
}

impl_error!(EnvSetupError);

/// A file descriptor owned by the `ArgVec`. Inheritable FDs survive `exec`
/// (their close-on-exec flag is cleared just before spawn); non-inheritable
/// FDs are held open only to keep some underlying resource alive (e.g. a
/// lock file) until the supervisor has started, then closed on drop.
enum Owned {
    Inheritable(OwnedFd),
    NoInherit(OwnedFd),
}

/// Ordered supervisor argument buffer with attached inheritable and
/// non-inheritable file descriptors; supports argument bundling into a
/// sealed memfd (§4.1).
pub struct ArgVec {
    args: Vec<String>,
    fds: Vec<Owned>,
    finished: bool,
}

impl Default for ArgVec {
    fn default() -> Self {
        Self::new()
    }
}

impl ArgVec {
    pub fn new() -> Self {
        Self {
            args: Vec::new(),
            fds: Vec::new(),
            finished: false,
        }
    }

    pub fn add_arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn add_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>, {
        for arg in args {
            self.args.push(arg.into());
        }
        self
    }

    pub fn add_arg_printf(&mut self, fmt: std::fmt::Arguments<'_>) -> &mut Self {
        self.args.push(fmt.to_string());
        self
    }

    /// Record `fd` as inheritable across exec; returns the same raw number
    /// so the caller can embed it into an argument (e.g. `--seccomp <n>`).
    pub fn add_fd(&mut self, fd: OwnedFd) -> RawFd {
        let raw = fd.as_raw_fd();
        self.fds.push(Owned::Inheritable(fd));
        raw
    }

    /// Take ownership of `fd`, closing it only when this `ArgVec` drops;
    /// used to keep e.g. a lock file alive until the supervisor starts.
    pub fn add_noinherit_fd(&mut self, fd: OwnedFd) {
        self.fds.push(Owned::NoInherit(fd));
    }

    /// Seal `bytes` into a read-only memfd and append
    /// `--ro-bind-data <n> <dest_path>` where `<n>` is the inheritable fd.
    pub fn add_args_data(&mut self, name: &str, bytes: &[u8], dest_path: &str) -> Result<&mut Self> {
        let fd = seal_memfd(name, bytes)?;
        let n = self.add_fd(fd);

        self.add_arg("--ro-bind-data").add_arg(n.to_string()).add_arg(dest_path);
        Ok(self)
    }

    /// Splice `other`'s args and fds into this buffer, stealing its fds.
    pub fn append(&mut self, mut other: ArgVec) -> &mut Self {
        self.args.append(&mut other.args);
        self.fds.append(&mut other.fds);
        self
    }

    /// Collapse `self.args[start..end]` into a single sealed memfd referenced
    /// by `--args <fd>` (or `--argv0 <fd>` when `one_arg`); keeps argv short
    /// and prevents argument snooping via `/proc/<pid>/cmdline`.
    pub fn bundle(&mut self, start: usize, end: usize, one_arg: bool) -> Result<&mut Self> {
        let bundled: Vec<String> = self.args.splice(start .. end, std::iter::empty()).collect();
        let mut payload = Vec::new();

        for arg in &bundled {
            payload.extend_from_slice(arg.as_bytes());
            payload.push(0);
        }

        let fd = seal_memfd("argv-bundle", &payload)?;
        let n = self.add_fd(fd);
        let directive = if one_arg { "--argv0" } else { "--args" };

        self.args.insert(start, n.to_string());
        self.args.insert(start, directive.into());
        Ok(self)
    }

    /// Append a trailing sentinel and freeze the buffer against further
    /// mutation of its argument list (fds may still be inspected at spawn).
    pub fn finish(&mut self) -> &mut Self {
        self.args.push("--".into());
        self.finished = true;
        self
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Raw numbers of every FD that must survive exec.
    pub fn inheritable_fds(&self) -> Vec<RawFd> {
        self.fds
            .iter()
            .filter_map(|f| match f {
                Owned::Inheritable(fd) => Some(fd.as_raw_fd()),
                Owned::NoInherit(_) => None,
            })
            .collect()
    }
}

impl Debug for ArgVec {
    fn fmt(&self, fmter: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(fmter, "args: {:?}", self.args)?;
        write!(fmter, "fds:  {} inheritable", self.inheritable_fds().len())
    }
}

pub(crate) fn seal_memfd(name: &str, bytes: &[u8]) -> Result<OwnedFd> {
    let opts = MemfdOptions::default().allow_sealing(true);
    let mfd: Memfd = match opts.create(name) {
        Ok(mfd) => mfd,
        Err(_) => err!(EnvSetupError::MemfdCreate(name.into()))?,
    };

    if mfd.as_file().write_all(bytes).is_err() {
        err!(EnvSetupError::MemfdWrite(name.into()))?
    }

    if mfd
        .add_seals(&[memfd::FileSeal::SealShrink, memfd::FileSeal::SealGrow, memfd::FileSeal::SealWrite])
        .is_err()
    {
        err!(EnvSetupError::MemfdSeal(name.into()))?
    }

    if mfd.add_seal(memfd::FileSeal::SealSeal).is_err() {
        err!(EnvSetupError::MemfdSeal(name.into()))?
    }

    Ok(mfd.into_file().into())
}
