/*
 * flatrun
 *
 * Copyright (C) 2023-2024 Xavier Moffett <sapphirus@azorium.net>
 * SPDX-License-Identifier: GPL-3.0-only
 *
 * This program is free software: you can redistribute it and/or modify
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
    fmt::{Display, Formatter},
    path::Path,
    thread,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use signal_hook::iterator::Signals;

use flatrun_core::{
    constants::{HOME, SIGNAL_LIST},
    err,
    impl_error,
    orchestrator::{CancellationToken, LaunchFlags, LaunchOrchestrator},
    store::{FilesystemDeployStore, Ref, RefKind},
    utils::arguments::{Arguments, InvalidArgument, Operand as Op},
    ErrorTrait,
    Result,
};

#[derive(Debug)]
enum LaunchError {
    MalformedRef(String),
}

impl_error!(LaunchError);

impl Display for LaunchError {
    fn fmt(&self, fmter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedRef(r) => write!(fmter, "'{r}': expected <name>[/<arch>[/<branch>]]"),
        }
    }
}

struct LaunchParams<'a> {
    app: Ref,
    runtime: Option<Ref>,
    flags: LaunchFlags,
    command: &'a str,
    args: Vec<&'a str>,
}

fn parse_ref(kind: RefKind, spec: &str) -> Result<Ref> {
    let mut parts = spec.splitn(3, '/');
    let name = match parts.next() {
        Some(name) if !name.is_empty() => name,
        _ => err!(LaunchError::MalformedRef(spec.into()))?,
    };
    let arch = parts.next().unwrap_or(std::env::consts::ARCH);
    let branch = parts.next().unwrap_or("stable");

    Ok(Ref::new(kind, name, arch, branch))
}

impl<'a> LaunchParams<'a> {
    fn parse(args: &'a mut Arguments) -> Result<Self> {
        let mut runtime = None;
        let mut flags = LaunchFlags::empty();
        let mut app = None;

        while let Some(arg) = args.next() {
            match arg {
                Op::Long("") => break, // literal "--" separator ahead of the sandboxed command
                Op::Long("runtime") => match args.next() {
                    Some(Op::LongPos("runtime", spec) | Op::Value(spec)) => runtime = Some(parse_ref(RefKind::Runtime, spec)?),
                    _ => args.invalid_operand()?,
                },
                Op::Long("devel") | Op::Short('d') => flags |= LaunchFlags::DEVEL,
                Op::Long("sandbox") => flags |= LaunchFlags::SANDBOX,
                Op::Long("background") | Op::Short('b') => flags |= LaunchFlags::BACKGROUND,
                Op::LongPos(_, spec) | Op::ShortPos(_, spec) | Op::Value(spec) if app.is_none() => app = Some(parse_ref(RefKind::App, spec)?),
                _ => args.invalid_operand()?,
            }
        }

        let app = match app {
            Some(app) => app,
            None => err!(InvalidArgument::TargetUnspecified)?,
        };

        let rest = args.inner();
        let sep = rest.iter().position(|a| *a == "--").map(|i| i + 1).unwrap_or(rest.len());
        let trailing = &rest[sep ..];
        let command = trailing.first().copied().unwrap_or("/bin/sh");
        let command_args = trailing.iter().skip(1).copied().collect();

        Ok(Self {
            app,
            runtime,
            flags,
            command,
            args: command_args,
        })
    }
}

pub fn execute(args: &mut Arguments) -> Result<()> {
    let params = LaunchParams::parse(args)?;
    let data_home = format!("{}/.local/share", *HOME);
    let store = FilesystemDeployStore::new(data_home);
    let orchestrator = LaunchOrchestrator::new(&store);
    let cancel = CancellationToken::new();
    let cwd = std::env::current_dir().map(|p| p.display().to_string()).unwrap_or_else(|_| "/".into());
    let command_args: Vec<String> = params.args.iter().map(|s| s.to_string()).collect();

    let handle = orchestrator.launch(
        &params.app,
        params.runtime.as_ref(),
        None,
        None,
        params.flags,
        &cwd,
        params.command,
        &command_args,
        &cancel,
    )?;

    if params.flags.contains(LaunchFlags::BACKGROUND) {
        println!("{}", handle.id);
        std::mem::forget(handle);
        return Ok(());
    }

    trap_signals(handle.app_pid());

    match handle.wait() {
        Ok(status) => match status.code() {
            Some(0) | None => Ok(()),
            Some(code) => std::process::exit(code),
        },
        Err(error) => Err(error),
    }
}

/// Forward the signals in `SIGNAL_LIST` to the supervisor while it's alive,
/// so an interactive Ctrl-C reaches the sandbox instead of just this process.
fn trap_signals(supervisor_pid: i32) {
    let mut signals = match Signals::new(*SIGNAL_LIST) {
        Ok(signals) => signals,
        Err(_) => return,
    };

    thread::Builder::new()
        .name("flatrun-signal".to_string())
        .spawn(move || {
            let proc = format!("/proc/{supervisor_pid}/");

            for _ in signals.forever() {
                if Path::new(&proc).exists() {
                    kill(Pid::from_raw(supervisor_pid), Signal::SIGTERM).ok();
                }
            }
        })
        .ok();
}
