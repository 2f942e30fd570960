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

//! Spawns and supervises `xdg-dbus-proxy` filter instances (§4.5).
//!
//! Grounded on `exec.rs::instantiate_dbus_proxy` (spawn shape, socket-path
//! conventions) but the readiness handshake is rewritten: the original
//! polled the socket path in a sleep loop (`check_socket`), this instead
//! passes the proxy a `--fd` to an `os_pipe` write end and blocks a read on
//! the other end, since `xdg-dbus-proxy` writes a single byte once its
//! filter is installed and listening. Kill-on-timeout and the two-stage
//! `SIGTERM`/`SIGKILL` teardown follow the same `nix::sys::signal` usage the
//! supervisor's cancellation path uses.
//!
//! `Bus` is a closed set rather than the prior `typetag` plugin
//! (`config/dbus.rs::Dbus`) for the same reason `Context` dropped it: the
//! set of buses and privilege levels is fixed by the spec, not
//! user-extensible.

use std::{
    io::Read,
    os::fd::AsRawFd,
    process::{Child, Command, Stdio},
    time::Instant,
};

use command_fds::{CommandFdExt, FdMapping};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use indexmap::IndexMap;

use crate::{
    constants::{DBUS_PROXY_EXECUTABLE, PROXY_KILL_GRACE, PROXY_READY_TIMEOUT},
    context::BusPrivilege,
    err,
    impl_error,
    ErrorTrait,
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bus {
    Session,
    System,
    Accessibility,
}

impl Bus {
    fn env_var(&self) -> &'static str {
        match self {
            Bus::Session => "DBUS_SESSION_BUS_ADDRESS",
            Bus::System => "DBUS_SYSTEM_BUS_ADDRESS",
            Bus::Accessibility => "AT_SPI_BUS_ADDRESS",
        }
    }

    fn container_path(&self, instance_dir: &str) -> String {
        match self {
            Bus::Session => format!("{instance_dir}/bus"),
            Bus::System => format!("{instance_dir}/system-bus"),
            Bus::Accessibility => format!("{instance_dir}/at-spi-bus"),
        }
    }

    /// Fixed in-container path the socket is bound to (§4.5); the value
    /// handed to the sandboxed process via its bus env var must match the
    /// `--ro-bind` destination the supervisor wires up, not the host-side
    /// staging path above.
    pub fn sandbox_dest(&self) -> &'static str {
        match self {
            Bus::Session => "/run/user/flatrun/bus",
            Bus::System => "/run/dbus/system_bus_socket",
            Bus::Accessibility => "/run/flatrun/at-spi-bus",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProxyError {
    Unavailable(std::io::ErrorKind),
    Timeout(Bus),
    BusAddressUnset(Bus),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, fmter: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Unavailable(kind) => write!(fmter, "'{DBUS_PROXY_EXECUTABLE}': Unable to spawn filter proxy: {kind}"),
            Self::Timeout(bus) => write!(fmter, "Timed out waiting on {bus:?} bus filter proxy to become ready"),
            Self::BusAddressUnset(bus) => write!(fmter, "{} is unset; cannot instantiate {bus:?} bus proxy", bus.env_var()),
        }
    }
}

impl_error!(ProxyError);

/// One filter rule, rendered as `--see=NAME`/`--talk=NAME`/`--own=NAME`/
/// `--call=NAME=METHOD`/`--broadcast=NAME=MATCH` on the proxy's argv.
fn render_rule(privilege: BusPrivilege, name: &str) -> Option<String> {
    match privilege {
        BusPrivilege::None => None,
        BusPrivilege::See => Some(format!("--see={name}")),
        BusPrivilege::Talk => Some(format!("--talk={name}")),
        BusPrivilege::Own => Some(format!("--own={name}")),
    }
}

/// A spawned, ready-checked proxy instance; owns the child process and the
/// host-side staging socket path that gets `--ro-bind`ed to `Bus::sandbox_dest()`
/// inside the container.
pub struct ProxyHandle {
    pub bus: Bus,
    pub socket_path: String,
    child: Child,
}

impl ProxyHandle {
    pub fn env_binding(&self) -> (&'static str, String) {
        (self.bus.env_var(), format!("unix:path={}", self.bus.sandbox_dest()))
    }

    /// `SIGTERM`, then `SIGKILL` after a grace period if still alive.
    pub fn terminate(&mut self) -> Result<()> {
        let pid = Pid::from_raw(self.child.id() as i32);
        kill(pid, Signal::SIGTERM).ok();

        let deadline = Instant::now() + PROXY_KILL_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return Ok(()),
                Ok(None) if Instant::now() >= deadline => {
                    kill(pid, Signal::SIGKILL).ok();
                    self.child.wait().ok();
                    return Ok(());
                }
                Ok(None) => std::thread::sleep(std::time::Duration::from_millis(20)),
                Err(_) => return Ok(()),
            }
        }
    }
}

/// The full set of proxies needed for one launch: zero or more buses, each
/// with its own policy table. Built up front, spawned together, and torn
/// down together on any failure past the point any one proxy is live.
#[derive(Debug, Default)]
pub struct DBusProxyPlan {
    policies: IndexMap<Bus, IndexMap<String, BusPrivilege>>,
}

impl DBusProxyPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self, bus: Bus, policy: IndexMap<String, BusPrivilege>) {
        self.policies.insert(bus, policy);
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Spawn every enabled proxy and block until each signals readiness or
    /// times out. On any single failure, every already-spawned proxy in
    /// `handles` is torn down before the error propagates, so a partial
    /// plan never leaks live proxy processes.
    pub fn spawn(&self, instance_dir: &str) -> Result<Vec<ProxyHandle>> {
        let mut handles = Vec::new();

        for (bus, policy) in &self.policies {
            match spawn_one(*bus, policy, instance_dir) {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    for mut handle in handles {
                        handle.terminate().ok();
                    }
                    return Err(error);
                }
            }
        }

        Ok(handles)
    }
}

fn spawn_one(bus: Bus, policy: &IndexMap<String, BusPrivilege>, instance_dir: &str) -> Result<ProxyHandle> {
    let address = match std::env::var(bus.env_var()) {
        Ok(address) if !address.is_empty() => address,
        _ => err!(ProxyError::BusAddressUnset(bus))?,
    };

    let socket_path = bus.container_path(instance_dir);
    let (reader, writer) = match os_pipe::pipe() {
        Ok(pipe) => pipe,
        Err(io_error) => err!(ProxyError::Unavailable(io_error.kind()))?,
    };

    let mut command = Command::new(DBUS_PROXY_EXECUTABLE);
    command.arg(&address).arg(&socket_path).arg("--filter").arg("--fd").arg(writer.as_raw_fd().to_string());
    command.args(policy.iter().filter_map(|(name, privilege)| render_rule(*privilege, name)));
    command.stdout(Stdio::null()).stderr(Stdio::piped());

    let fd_mapping = vec![FdMapping {
        parent_fd: writer.as_raw_fd(),
        child_fd: writer.as_raw_fd(),
    }];

    let child = match command.fd_mappings(fd_mapping).unwrap().spawn() {
        Ok(child) => child,
        Err(error) => err!(ProxyError::Unavailable(error.kind()))?,
    };

    drop(writer);
    wait_ready(bus, reader, PROXY_READY_TIMEOUT)?;

    Ok(ProxyHandle { bus, socket_path, child })
}

/// Block on the readiness pipe's read end until the proxy writes its single
/// ready byte, or `timeout` elapses. The read end is switched to
/// non-blocking so the deadline is actually polled during the wait instead
/// of only being checked between syscalls that themselves never return.
fn wait_ready(bus: Bus, mut reader: os_pipe::PipeReader, timeout: std::time::Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut byte = [0u8; 1];

    let raw = reader.as_raw_fd();
    match nix::fcntl::fcntl(raw, nix::fcntl::FcntlArg::F_GETFL) {
        Ok(flags) => {
            let flags = nix::fcntl::OFlag::from_bits_truncate(flags) | nix::fcntl::OFlag::O_NONBLOCK;
            nix::fcntl::fcntl(raw, nix::fcntl::FcntlArg::F_SETFL(flags)).ok();
        }
        Err(_) => {}
    }

    loop {
        match reader.read(&mut byte) {
            Ok(1) => return Ok(()),
            Ok(_) => err!(ProxyError::Timeout(bus))?,
            Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    err!(ProxyError::Timeout(bus))?;
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(ref error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => err!(ProxyError::Unavailable(error.kind()))?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_rule_skips_none() {
        assert_eq!(render_rule(BusPrivilege::None, "org.example"), None);
        assert_eq!(render_rule(BusPrivilege::See, "org.example"), Some("--see=org.example".into()));
        assert_eq!(render_rule(BusPrivilege::Talk, "org.example"), Some("--talk=org.example".into()));
        assert_eq!(render_rule(BusPrivilege::Own, "org.example"), Some("--own=org.example".into()));
    }

    #[test]
    fn container_paths_are_distinct_per_bus() {
        let dir = "/run/flatrun/7";
        assert_ne!(Bus::Session.container_path(dir), Bus::System.container_path(dir));
        assert_ne!(Bus::System.container_path(dir), Bus::Accessibility.container_path(dir));
    }

    #[test]
    fn empty_plan_spawns_nothing() {
        let plan = DBusProxyPlan::new();
        assert!(plan.is_empty());
    }

    #[test]
    fn sandbox_dest_matches_the_in_container_bind_path() {
        assert_eq!(Bus::Session.sandbox_dest(), "/run/user/flatrun/bus");
        assert_eq!(Bus::System.sandbox_dest(), "/run/dbus/system_bus_socket");
        assert_eq!(Bus::Accessibility.sandbox_dest(), "/run/flatrun/at-spi-bus");
        assert_ne!(Bus::System.sandbox_dest(), Bus::System.container_path("/run/flatrun/7"));
    }

    #[test]
    fn wait_ready_times_out_when_proxy_never_signals() {
        let (reader, writer) = os_pipe::pipe().unwrap();
        let result = wait_ready(Bus::Session, reader, std::time::Duration::from_millis(50));
        drop(writer);
        assert!(result.is_err());
    }

    #[test]
    fn wait_ready_succeeds_once_byte_is_written() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        std::io::Write::write_all(&mut writer, &[1u8]).unwrap();
        drop(writer);
        let result = wait_ready(Bus::Session, reader, std::time::Duration::from_secs(1));
        assert!(result.is_ok());
    }
}
