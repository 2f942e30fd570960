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

//! Supervisor process construction and lifecycle.
//!
//! Grounded on `exec.rs::fakeroot_container`/`transaction_agent` (building a
//! `Command`, attaching `FdMapping`s for the FDs that must survive exec,
//! wiring a seccomp fd, and spawning) generalized to the ordered `ArgVec`
//! buffer that `orchestrator` assembles, rather than a fixed argument list.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    os::unix::process::ExitStatusExt,
    process::{exit, Child, Command, ExitStatus},
};

use command_fds::{CommandFdExt, FdMapping};

use crate::{
    constants::BWRAP_EXECUTABLE,
    err,
    exec::argv::ArgVec,
    utils::TermControl,
    Error,
    ErrorTrait,
    Result,
};

pub mod argv;
pub mod seccomp;
pub mod utils;

#[derive(Debug, Clone)]
pub enum SupervisorError {
    Unavailable(std::io::ErrorKind),
    WaitFailure(std::io::ErrorKind),
    ExitedBeforeExec(ExitStatus),
}

impl Display for SupervisorError {
    fn fmt(&self, fmter: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Unavailable(err) => write!(fmter, "'{BWRAP_EXECUTABLE}': Unable to spawn supervisor: {err}"),
            Self::WaitFailure(err) => write!(fmter, "'{BWRAP_EXECUTABLE}': Unable to wait on supervisor: {err}"),
            Self::ExitedBeforeExec(status) => write!(fmter, "Supervisor exited with {status} before exec of the user command."),
        }
    }
}

impl ErrorTrait for SupervisorError {
    fn code(&self) -> i32 {
        match self {
            Self::ExitedBeforeExec(status) => 128 + status.signal().unwrap_or(0),
            _ => 1,
        }
    }
}

/// Whether a launch is attended at a terminal; governs whether a non-zero
/// supervisor exit is propagated as an error or turned into `process::exit`.
#[derive(Debug, Clone, Copy)]
pub enum ExecutionType {
    Interactive,
    NonInteractive,
}

/// Spawn the supervisor with `argvec`'s argument list and every FD it
/// recorded as inheritable mapped 1:1 into the child. `argvec` is finished
/// (sentinel appended) if the caller has not already done so.
pub fn spawn_supervisor(mut argvec: ArgVec, cwd: &str, env: &[(String, String)]) -> Result<Child> {
    if !argvec.is_finished() {
        argvec.finish();
    }

    let mappings = argvec.inheritable_fds().into_iter().map(|fd| FdMapping { parent_fd: fd, child_fd: fd }).collect();
    let mut command = Command::new(BWRAP_EXECUTABLE);

    command.env_clear().current_dir(cwd).args(argvec.args());

    for (name, value) in env {
        command.env(name, value);
    }

    match command.fd_mappings(mappings).unwrap().spawn() {
        Ok(child) => Ok(child),
        Err(error) => err!(SupervisorError::Unavailable(error.kind())),
    }
}

/// Block on the supervisor's exit, restoring terminal state and translating
/// its exit status per `exec_type`. `trap_cb`, if present, is invoked with
/// the sandboxed process's pid once it is known (signal forwarding setup).
pub fn wait_on_supervisor(exec_type: ExecutionType, mut process: Child, term: TermControl, sandbox_pid: Option<i32>, trap_cb: Option<fn(i32)>) -> Result<()> {
    if let (Some(trap), Some(pid)) = (trap_cb, sandbox_pid) {
        trap(pid)
    }

    match process.wait() {
        Ok(status) => {
            if let Err(err) = term.reset_terminal() {
                err.warn();
            }

            match status.code() {
                Some(0) => Ok(()),
                Some(code) => match exec_type {
                    ExecutionType::Interactive => exit(code),
                    ExecutionType::NonInteractive => err!(SupervisorError::ExitedBeforeExec(status)),
                },
                None => match exec_type {
                    ExecutionType::Interactive => exit(SupervisorError::ExitedBeforeExec(status).code()),
                    ExecutionType::NonInteractive => err!(SupervisorError::ExitedBeforeExec(status)),
                },
            }
        }
        Err(error) => err!(SupervisorError::WaitFailure(error.kind())),
    }
}
