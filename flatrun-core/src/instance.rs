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

//! The per-instance state directory and the public launch handle (§6).
//!
//! Grounded on `lock.rs`'s single-holder `Lock` for the instance pidfile
//! and on `config/vars.rs::ContainerVariables` for the "one directory per
//! live thing, torn down on drop" shape; generalized from per-container
//! config paths to the ephemeral `$XDG_RUNTIME_DIR/.flatpak/<id>/` layout
//! §6 specifies.

use std::{
    fs::{remove_dir_all, write},
    path::PathBuf,
    process::Child,
};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::{dbus_proxy::ProxyHandle, err, exec::utils::read_info_file, impl_error, lock::Lock, ErrorGeneric, ErrorTrait, Result};

#[derive(Debug, Clone)]
pub enum InstanceError {
    KillFailed(i32, String),
}

impl std::fmt::Display for InstanceError {
    fn fmt(&self, fmter: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::KillFailed(pid, reason) => write!(fmter, "Unable to signal pid {pid}: {reason}"),
        }
    }
}

impl_error!(InstanceError);

/// The instance state directory, created by `AppInfoSealer`'s id
/// allocation and owned by the orchestrator for the rest of the launch;
/// reaped by `InstanceHandle::drop` once all process handles close.
pub struct InstanceDir {
    pub id: u32,
    pub path: PathBuf,
}

impl InstanceDir {
    pub fn new(id: u32, path: PathBuf) -> Self {
        Self { id, path }
    }

    pub fn info_path(&self) -> PathBuf {
        self.path.join("info")
    }

    pub fn bwrapinfo_path(&self) -> PathBuf {
        self.path.join("bwrapinfo.json")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.path.join("pid")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.path.join("lock")
    }

    pub fn write_pidfile(&self, pid: i32) -> Result<()> {
        write(self.pid_path(), pid.to_string()).prepend_io(|| format!("Failed to write pidfile '{}'", self.pid_path().display()))
    }
}

/// The public handle returned by `LaunchOrchestrator::launch`: the
/// supervisor's pid, the sandboxed command's pid (once known), and the
/// means to wait on or signal the instance.
pub struct InstanceHandle {
    pub id: u32,
    dir: InstanceDir,
    supervisor: Child,
    proxies: Vec<ProxyHandle>,
    _pidfile_lock: Option<Lock>,
}

impl InstanceHandle {
    pub fn new(dir: InstanceDir, supervisor: Child, proxies: Vec<ProxyHandle>, pidfile_lock: Option<Lock>) -> Self {
        Self {
            id: dir.id,
            dir,
            supervisor,
            proxies,
            _pidfile_lock: pidfile_lock,
        }
    }

    /// The supervisor's own pid (the process directly spawned by this
    /// process).
    pub fn app_pid(&self) -> i32 {
        self.supervisor.id() as i32
    }

    /// The sandboxed command's pid, read from `bwrapinfo.json`; `None`
    /// until the supervisor has written it.
    pub fn child_pid(&self) -> Result<Option<i32>> {
        read_info_file(&self.dir.bwrapinfo_path())
    }

    pub fn wait(mut self) -> Result<std::process::ExitStatus> {
        match self.supervisor.wait() {
            Ok(status) => Ok(status),
            Err(error) => err!(InstanceError::KillFailed(self.app_pid(), error.to_string())),
        }
    }

    pub fn kill(&mut self, signal: Signal) -> Result<()> {
        let pid = Pid::from_raw(self.app_pid());
        match kill(pid, signal) {
            Ok(()) => Ok(()),
            Err(errno) => err!(InstanceError::KillFailed(self.app_pid(), errno.to_string())),
        }
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        for proxy in &mut self.proxies {
            proxy.terminate().ok();
        }

        if matches!(self.supervisor.try_wait(), Ok(Some(_))) {
            remove_dir_all(&self.dir.path).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_layout_is_rooted_under_the_instance_path() {
        let dir = InstanceDir::new(7, PathBuf::from("/run/user/1000/.flatpak/7"));
        assert_eq!(dir.info_path(), PathBuf::from("/run/user/1000/.flatpak/7/info"));
        assert_eq!(dir.bwrapinfo_path(), PathBuf::from("/run/user/1000/.flatpak/7/bwrapinfo.json"));
        assert_eq!(dir.pid_path(), PathBuf::from("/run/user/1000/.flatpak/7/pid"));
        assert_eq!(dir.lock_path(), PathBuf::from("/run/user/1000/.flatpak/7/lock"));
    }

    #[test]
    fn write_pidfile_round_trips_through_the_filesystem() {
        let tmp = std::env::temp_dir().join(format!("flatrun-instance-test-{}", std::process::id()));
        std::fs::create_dir_all(&tmp).unwrap();
        let dir = InstanceDir::new(1, tmp.clone());

        dir.write_pidfile(4242).unwrap();
        let contents = std::fs::read_to_string(dir.pid_path()).unwrap();
        assert_eq!(contents, "4242");

        std::fs::remove_dir_all(&tmp).ok();
    }
}
