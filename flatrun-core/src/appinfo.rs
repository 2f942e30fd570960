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

//! Allocates an instance id and produces the sealed `/.flatpak-info`
//! document (§4.6).
//!
//! Instance-id allocation mirrors `lock.rs`'s exclusivity idiom
//! (`O_CREAT|O_EXCL`) generalized from a single lock file to a `mkdir`
//! retry loop over an unbounded sequence of candidate subdirectory names;
//! the document itself is hand-rendered key-value text (the same
//! `[Group]\nkey=value` shape `context.rs::save_metadata` already produces)
//! rather than a `serde` structure, since §4.6 interleaves three unrelated
//! groups (`Application`, `Instance`, flattened `Context`) that don't map
//! onto one Rust type.

use std::{fs::create_dir, os::fd::OwnedFd, path::PathBuf};

use crate::{context::Context, err, exec::argv::seal_memfd, impl_error, ErrorTrait, Result};

#[derive(Debug, Clone)]
pub enum SealError {
    InstanceIdExhausted,
    Mkdir(String, std::io::ErrorKind),
}

impl std::fmt::Display for SealError {
    fn fmt(&self, fmter: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::InstanceIdExhausted => write!(fmter, "Unable to allocate an instance id: no candidate available"),
            Self::Mkdir(path, kind) => write!(fmter, "'{path}': Unable to create instance directory: {kind}"),
        }
    }
}

impl_error!(SealError);

/// Static identity facts about the application being launched; everything
/// else in the document is derived from the merged `Context` or supplied
/// per-invocation.
#[derive(Debug, Clone)]
pub struct ApplicationInfo {
    pub name: String,
    pub runtime: String,
    pub arch: String,
    pub branch: String,
    pub commit: String,
    pub devel: bool,
}

#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: u32,
    pub original_app_path: String,
    pub app_path: String,
    pub runtime_path: String,
    pub session_bus_proxy: bool,
    pub system_bus_proxy: bool,
}

/// The smallest positive integer with no existing `<runtime_dir>/<n>`
/// subdirectory, claimed by `mkdir`'s atomicity. Retries on `EEXIST`
/// (another launch won the race on that candidate) and gives up after an
/// arbitrarily generous bound to avoid spinning forever on an unrelated
/// permanent failure.
pub fn allocate_instance_id(runtime_dir: &str) -> Result<(u32, PathBuf)> {
    for candidate in 1..=u32::MAX {
        let path = PathBuf::from(runtime_dir).join(candidate.to_string());

        match create_dir(&path) {
            Ok(()) => return Ok((candidate, path)),
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(error) => err!(SealError::Mkdir(path.display().to_string(), error.kind()))?,
        }
    }

    err!(SealError::InstanceIdExhausted)
}

/// Render the `/.flatpak-info` document: `[Application]`, `[Instance]`,
/// the flattened `[Context]` plus its bus-policy/env/policy groups, in
/// the stable order §4.6 specifies.
pub fn render(app: &ApplicationInfo, instance: &InstanceInfo, context: &Context) -> String {
    let mut out = String::new();

    out.push_str("[Application]\n");
    out.push_str(&format!("name={}\n", app.name));
    out.push_str(&format!("runtime={}\n", app.runtime));
    out.push_str(&format!("arch={}\n", app.arch));
    out.push_str(&format!("branch={}\n", app.branch));
    out.push_str(&format!("commit={}\n", app.commit));
    out.push_str(&format!("devel={}\n\n", app.devel));

    out.push_str("[Instance]\n");
    out.push_str(&format!("instance-id={}\n", instance.id));
    out.push_str(&format!("original-app-path={}\n", instance.original_app_path));
    out.push_str(&format!("app-path={}\n", instance.app_path));
    out.push_str(&format!("runtime-path={}\n", instance.runtime_path));
    out.push_str(&format!("session-bus-proxy={}\n", instance.session_bus_proxy));
    out.push_str(&format!("system-bus-proxy={}\n\n", instance.system_bus_proxy));

    out.push_str(&context.save_metadata(true));
    out
}

/// Seal the rendered document into a read-only memfd, ready to be bound
/// at `/.flatpak-info` via `ArgVec::add_args_data`.
pub fn seal(app: &ApplicationInfo, instance: &InstanceInfo, context: &Context) -> Result<OwnedFd> {
    let document = render(app, instance, context);
    seal_memfd("flatpak-info", document.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> ApplicationInfo {
        ApplicationInfo {
            name: "org.example.App".into(),
            runtime: "org.example.Runtime".into(),
            arch: "x86_64".into(),
            branch: "stable".into(),
            commit: "deadbeef".into(),
            devel: false,
        }
    }

    fn instance() -> InstanceInfo {
        InstanceInfo {
            id: 7,
            original_app_path: "/var/lib/flatrun/app/org.example.App/x86_64/stable/active/files".into(),
            app_path: "/app".into(),
            runtime_path: "/usr".into(),
            session_bus_proxy: true,
            system_bus_proxy: false,
        }
    }

    #[test]
    fn render_orders_application_before_instance_before_context() {
        let document = render(&app(), &instance(), &Context::new());
        let app_pos = document.find("[Application]").unwrap();
        let instance_pos = document.find("[Instance]").unwrap();
        let context_pos = document.find("[Context]").unwrap();
        assert!(app_pos < instance_pos);
        assert!(instance_pos < context_pos);
    }

    #[test]
    fn render_includes_instance_id() {
        let document = render(&app(), &instance(), &Context::new());
        assert!(document.contains("instance-id=7"));
    }

    #[test]
    fn allocate_instance_id_picks_first_free_slot() {
        let dir = std::env::temp_dir().join(format!("flatrun-appinfo-test-{}", std::process::id()));
        create_dir(&dir).ok();
        create_dir(dir.join("1")).ok();

        let (id, path) = allocate_instance_id(dir.to_str().unwrap()).unwrap();
        assert_eq!(id, 2);
        assert!(path.ends_with("2"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
