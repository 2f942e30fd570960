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

//! The filesystem projection engine: turns a [`Context`]'s filesystem table
//! into an ordered, conflict-free directive stream for [`crate::exec::argv::ArgVec`].
//!
//! Grounded on the prior `config/filesystem/{home,root}.rs` `register()`
//! methods (`args.bind(...)`/`args.symlink(...)`), generalized from one
//! directive per fixed mount-point module into a traversal driven by the
//! `Context`'s filesystem table and a pluggable view of the host (`HostFs`),
//! so host symlink layout and autofs markers can be substituted in tests.

use std::{fmt::Debug, fs::read_to_string, path::Path};

use indexmap::IndexMap;

use crate::{context::{Context, FsMode}, err, impl_error, utils::print_warning, Error, ErrorTrait, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    Ro,
    Rw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Bind { src: String, dest: String, mode: BindMode },
    Tmpfs(String),
    Dir(String),
    Symlink { target: String, link: String },
}

#[derive(Debug, Clone)]
pub enum ExportsError {
    HostAccess(String),
}

impl std::fmt::Display for ExportsError {
    fn fmt(&self, fmter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HostAccess(path) => write!(fmter, "Unable to access host path '{path}'."),
        }
    }
}

impl_error!(ExportsError);

/// A view of the host filesystem the projection algorithm queries; the real
/// implementation reads `/proc/self/mountinfo` and `std::fs`, a test double
/// can fake arbitrary layouts (Fedora-like, Arch-like, §8 scenarios S3/S4).
pub trait HostFs: Debug {
    fn exists(&self, path: &str) -> bool;
    fn is_dir(&self, path: &str) -> bool;
    /// `Some(target)` if `path`'s final component is a symlink.
    fn read_link(&self, path: &str) -> Option<String>;
    /// `true` if `path` (or any parent) is the root of an autofs mount.
    fn is_autofs(&self, path: &str) -> bool;
    /// `false` only on a catastrophic failure to open the host root.
    fn root_accessible(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct RealHostFs;

impl HostFs for RealHostFs {
    fn exists(&self, path: &str) -> bool {
        Path::new(path).symlink_metadata().is_ok()
    }

    fn is_dir(&self, path: &str) -> bool {
        Path::new(path).metadata().map(|m| m.is_dir()).unwrap_or(false)
    }

    fn read_link(&self, path: &str) -> Option<String> {
        std::fs::read_link(path).ok().map(|p| p.to_string_lossy().into_owned())
    }

    fn is_autofs(&self, path: &str) -> bool {
        autofs_mounts().iter().any(|mount| mount == path)
    }

    fn root_accessible(&self) -> bool {
        Path::new("/").read_dir().is_ok()
    }
}

fn autofs_mounts() -> Vec<String> {
    let Ok(contents) = read_to_string("/proc/self/mountinfo") else {
        return Vec::new();
    };

    contents
        .lines()
        .filter(|line| line.contains(" - autofs "))
        .filter_map(|line| line.split(' ').nth(4).map(String::from))
        .collect()
}

/// The host directories considered for the plain `host` token (a direct,
/// 1:1 passthrough at matching container paths — distinct from `host-os`/
/// `host-etc`, which project under `/run/host`).
const HOST_PASSTHROUGH_DIRS: &[&str] =
    &["/bin", "/etc", "/home", "/lib", "/lib32", "/lib64", "/libexec", "/media", "/mnt", "/opt", "/root", "/run/media", "/sbin", "/srv", "/usr", "/var"];

const USR_MERGE_LINKS: &[&str] = &["/bin", "/sbin", "/lib", "/lib32", "/lib64", "/libexec"];

/// The projection result: an ordered directive stream plus a visibility
/// index for longest-prefix queries (§4.3.5).
#[derive(Debug, Default)]
pub struct Exports {
    symlinks: Vec<Directive>,
    ro_binds: Vec<Directive>,
    os_release: Option<Directive>,
    tmpfs: Vec<Directive>,
    rw_binds: Vec<Directive>,
    dirs: Vec<Directive>,
    visibility: IndexMap<String, FsMode>,
}

impl Exports {
    pub fn project(context: &Context, host: &dyn HostFs, home: &str, xdg: &dyn Fn(&str) -> Option<String>) -> Result<Exports> {
        let mut exports = Exports::default();

        if !host.root_accessible() {
            err!(ExportsError::HostAccess("/".into()))?
        }

        if let Some(mode) = context.filesystems().get("host-os") {
            exports.project_host_os(host, *mode);
        }

        if let Some(mode) = context.filesystems().get("host-etc") {
            exports.project_host_etc(host, *mode);
        }

        // The os-release bind is unconditional (§4.3.1/§8 S1): it's emitted
        // even with no `host-os`/`host-etc` grant, as long as either source
        // path exists on the host.
        if exports.os_release.is_none() {
            if host.exists("/etc/os-release") {
                exports.push_os_release_like("/etc/os-release", "/run/host/os-release", BindMode::Ro);
            } else if host.exists("/usr/lib/os-release") {
                exports.push_os_release_like("/usr/lib/os-release", "/run/host/os-release", BindMode::Ro);
            }
        }

        if context.filesystems().contains_key("host") {
            for dir in HOST_PASSTHROUGH_DIRS {
                exports.expose_path(host, dir, FsMode::Ro);
            }
        }

        for (token, mode) in context.filesystems() {
            if matches!(token.as_str(), "host" | "host-os" | "host-etc") {
                continue;
            }

            match resolve_token(token, home, xdg) {
                Some(path) => exports.expose_path(host, &path, *mode),
                None => print_warning(&format!("Unrecognized filesystem token '{token}' at projection time.")),
            }
        }

        Ok(exports)
    }

    /// Expose `/usr` (and the usr-merge symlinks or binds that mirror it)
    /// under `/run/host` (§4.3.1).
    fn project_host_os(&mut self, host: &dyn HostFs, mode: FsMode) {
        let bind_mode = match mode {
            FsMode::Ro | FsMode::Create => BindMode::Ro,
            _ => BindMode::Rw,
        };

        self.push_bind("/usr", "/run/host/usr", bind_mode);

        for dir in USR_MERGE_LINKS {
            let container_path = format!("/run/host{dir}");

            if let Some(target) = host.read_link(dir) {
                let rewritten = rewrite_usr_symlink(&target);
                self.symlinks.push(Directive::Symlink { target: rewritten, link: container_path });
            } else if host.is_dir(dir) {
                self.push_bind(dir, &container_path, bind_mode);
            }
        }

        if host.exists("/etc/ld.so.cache") {
            self.push_os_release_like("/etc/ld.so.cache", "/run/host/etc/ld.so.cache", bind_mode);
        } else if host.exists("/usr/lib/os-release") {
            self.push_os_release_like("/usr/lib/os-release", "/run/host/os-release", bind_mode);
        }

        if let Some(target) = host.read_link("/usr/local") {
            let real = if target.starts_with('/') { target } else { format!("/usr/{target}") };
            if host.exists(&real) {
                self.push_bind(&real, &real, bind_mode);
            }
        }
    }

    /// Expose `/etc` under `/run/host/etc` (§4.3.2).
    fn project_host_etc(&mut self, host: &dyn HostFs, mode: FsMode) {
        let bind_mode = match mode {
            FsMode::Ro | FsMode::Create => BindMode::Ro,
            _ => BindMode::Rw,
        };

        self.push_bind("/etc", "/run/host/etc", bind_mode);

        if host.exists("/etc/os-release") {
            self.push_os_release_like("/etc/os-release", "/run/host/os-release", bind_mode);
        } else if host.exists("/usr/lib/os-release") {
            self.push_os_release_like("/usr/lib/os-release", "/run/host/os-release", bind_mode);
        }
    }

    /// The path-expose algorithm (§4.3.3), applied to one resolved absolute
    /// host path at the given mode; per-entry failures are silently
    /// recovered per the §4.3.6 failure model.
    fn expose_path(&mut self, host: &dyn HostFs, path: &str, mode: FsMode) {
        if mode == FsMode::None {
            self.visibility.shift_remove(path);
            self.visibility.insert(path.to_string(), FsMode::None);
            self.shadow_if_needed(path);
            return;
        }

        if let Some(parent) = Path::new(path).parent().and_then(|p| p.to_str()) {
            if !parent.is_empty() && host.is_autofs(parent) {
                return;
            }
        }

        if let Some(target) = host.read_link(path) {
            if target.starts_with('/') {
                let relative = make_relative(path, &target);
                self.symlinks.push(Directive::Symlink { target: relative, link: path.to_string() });

                if host.exists(&target) {
                    self.expose_path(host, &target, mode);
                }
            } else {
                self.symlinks.push(Directive::Symlink { target, link: path.to_string() });
            }
            return;
        }

        if !host.exists(path) {
            if mode == FsMode::Create {
                self.dirs.push(Directive::Dir(path.to_string()));
                self.record_visibility(path, mode);
            } else {
                self.record_visibility(path, FsMode::None);
            }
            return;
        }

        match mode {
            FsMode::Ro => self.push_bind(path, path, BindMode::Ro),
            FsMode::Rw | FsMode::Create => self.push_bind(path, path, BindMode::Rw),
            FsMode::None | FsMode::Reset => unreachable!("reset/none handled above"),
        }

        self.record_visibility(path, mode);
    }

    fn shadow_if_needed(&mut self, path: &str) {
        let Some(parent) = Path::new(path).parent().and_then(|p| p.to_str()) else { return };

        match self.path_get_mode(parent) {
            FsMode::None => {}
            _ if self.is_bound(parent) => self.tmpfs.push(Directive::Tmpfs(path.to_string())),
            _ => self.dirs.push(Directive::Dir(path.to_string())),
        }
    }

    fn is_bound(&self, path: &str) -> bool {
        self.ro_binds.iter().chain(&self.rw_binds).any(|d| matches!(d, Directive::Bind { dest, .. } if dest == path))
    }

    /// No-op if `dest` is already bound; the first bind to a given
    /// destination wins; later grants of the same path still update
    /// visibility (via `record_visibility` in the caller) even when the
    /// directive itself is not re-emitted.
    fn push_bind(&mut self, src: &str, dest: &str, mode: BindMode) {
        if self.is_bound(dest) {
            return;
        }

        match mode {
            BindMode::Ro => self.ro_binds.push(Directive::Bind { src: src.into(), dest: dest.into(), mode }),
            BindMode::Rw => self.rw_binds.push(Directive::Bind { src: src.into(), dest: dest.into(), mode }),
        }
    }

    fn push_os_release_like(&mut self, src: &str, dest: &str, mode: BindMode) {
        self.os_release = Some(Directive::Bind { src: src.into(), dest: dest.into(), mode });
    }

    fn record_visibility(&mut self, path: &str, mode: FsMode) {
        self.visibility.shift_remove(path);
        self.visibility.insert(path.to_string(), mode);
    }

    /// Longest-prefix-first lookup of the effective mode for `path`.
    pub fn path_get_mode(&self, path: &str) -> FsMode {
        if let Some(mode) = self.visibility.get(path) {
            return *mode;
        }

        let mut candidate = Path::new(path);
        while let Some(parent) = candidate.parent() {
            if let Some(mode) = parent.to_str().and_then(|p| self.visibility.get(p)) {
                return *mode;
            }
            candidate = parent;
        }

        FsMode::None
    }

    pub fn path_is_visible(&self, path: &str) -> bool {
        self.path_get_mode(path) != FsMode::None
    }

    /// The final directive stream in the stable emission order (§4.3.4):
    /// symlinks, ro-binds (os-release last), tmpfs, rw-binds, dirs.
    pub fn directives(&self) -> Vec<&Directive> {
        let mut out = Vec::with_capacity(self.symlinks.len() + self.ro_binds.len() + self.tmpfs.len() + self.rw_binds.len() + self.dirs.len() + 1);

        out.extend(&self.symlinks);
        out.extend(&self.ro_binds);
        out.extend(self.os_release.iter());
        out.extend(&self.tmpfs);
        out.extend(&self.rw_binds);
        out.extend(&self.dirs);
        out
    }

    /// Append every directive onto `argvec` in emission order, as the
    /// supervisor argument dialect expects.
    pub fn apply(&self, argvec: &mut crate::exec::argv::ArgVec) {
        for directive in self.directives() {
            match directive {
                Directive::Bind { src, dest, mode: BindMode::Ro } => {
                    argvec.add_arg("--ro-bind").add_arg(src.clone()).add_arg(dest.clone());
                }
                Directive::Bind { src, dest, mode: BindMode::Rw } => {
                    argvec.add_arg("--bind").add_arg(src.clone()).add_arg(dest.clone());
                }
                Directive::Tmpfs(path) => {
                    argvec.add_arg("--tmpfs").add_arg(path.clone());
                }
                Directive::Dir(path) => {
                    argvec.add_arg("--dir").add_arg(path.clone());
                }
                Directive::Symlink { target, link } => {
                    argvec.add_arg("--symlink").add_arg(target.clone()).add_arg(link.clone());
                }
            }
        }
    }
}

fn resolve_token(token: &str, home: &str, xdg: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(rest) = token.strip_prefix("home") {
        return Some(format!("{home}{rest}"));
    }

    if let Some(rest) = token.strip_prefix("xdg-") {
        let (bucket, subpath) = rest.split_once('/').map_or((rest, ""), |(b, s)| (b, s));
        let base = xdg(bucket)?;
        return Some(if subpath.is_empty() { base } else { format!("{base}/{subpath}") });
    }

    if token.starts_with('/') {
        return Some(token.to_string());
    }

    None
}

fn rewrite_usr_symlink(target: &str) -> String {
    if let Some(rest) = target.strip_prefix("/usr/") {
        format!("usr/{rest}")
    } else if let Some(rest) = target.strip_prefix("usr/") {
        rest.to_string()
    } else {
        target.to_string()
    }
}

fn make_relative(link: &str, target: &str) -> String {
    let link_dir = Path::new(link).parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();

    if let Some(rest) = target.strip_prefix(&format!("{link_dir}/")) {
        rest.to_string()
    } else {
        target.trim_start_matches('/').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct FakeHost {
        dirs: Vec<&'static str>,
        files: Vec<&'static str>,
        symlinks: Vec<(&'static str, &'static str)>,
        autofs: Vec<&'static str>,
    }

    impl HostFs for FakeHost {
        fn exists(&self, path: &str) -> bool {
            self.dirs.contains(&path) || self.files.contains(&path) || self.symlinks.iter().any(|(l, _)| *l == path)
        }

        fn is_dir(&self, path: &str) -> bool {
            self.dirs.contains(&path)
        }

        fn read_link(&self, path: &str) -> Option<String> {
            self.symlinks.iter().find(|(l, _)| *l == path).map(|(_, t)| t.to_string())
        }

        fn is_autofs(&self, path: &str) -> bool {
            self.autofs.contains(&path)
        }
    }

    fn no_xdg(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn empty_context_projects_only_os_release() {
        let host = FakeHost {
            files: vec!["/etc/os-release"],
            dirs: vec!["/etc"],
            ..Default::default()
        };
        let ctx = Context::new();
        let exports = Exports::project(&ctx, &host, "/home/alice", &no_xdg).unwrap();
        let directives = exports.directives();

        assert_eq!(directives.len(), 1);
        assert!(matches!(
            directives[0],
            Directive::Bind { src, dest, mode: BindMode::Ro }
                if src == "/etc/os-release" && dest == "/run/host/os-release"
        ));
    }

    #[test]
    fn host_token_passthrough_is_always_ro_and_explicit_grants_do_not_duplicate() {
        let host = FakeHost {
            dirs: vec!["/etc", "/home", "/usr"],
            ..Default::default()
        };
        let mut ctx = Context::new();
        ctx.set_filesystem("host", crate::context::FsMode::Rw);
        ctx.set_filesystem("/home", crate::context::FsMode::Rw);
        ctx.set_filesystem("/opt", crate::context::FsMode::None);
        let exports = Exports::project(&ctx, &host, "/home/alice", &no_xdg).unwrap();
        let directives = exports.directives();

        for dest in ["/home", "/etc", "/usr"] {
            let count = directives
                .iter()
                .filter(|d| matches!(d, Directive::Bind { dest: bound, .. } if bound == dest))
                .count();
            assert_eq!(count, 1, "expected exactly one bind for {dest}");
            assert!(matches!(
                directives.iter().find(|d| matches!(d, Directive::Bind { dest: bound, .. } if bound == dest)),
                Some(Directive::Bind { mode: BindMode::Ro, .. })
            ));
        }

        assert!(!directives.iter().any(|d| matches!(d, Directive::Bind { dest, .. } if dest == "/opt")));
        assert_eq!(exports.path_get_mode("/opt"), FsMode::None);
        assert_eq!(exports.path_get_mode("/home/alice"), FsMode::Rw);
    }

    #[test]
    fn host_etc_projects_os_release_to_run_host() {
        let host = FakeHost {
            files: vec!["/etc/os-release"],
            dirs: vec!["/etc"],
            ..Default::default()
        };
        let mut ctx = Context::new();
        ctx.set_filesystem("host-etc", crate::context::FsMode::Rw);
        let exports = Exports::project(&ctx, &host, "/home/alice", &no_xdg).unwrap();

        let has_etc_bind = exports
            .directives()
            .iter()
            .any(|d| matches!(d, Directive::Bind { src, dest, .. } if src == "/etc" && dest == "/run/host/etc"));
        assert!(has_etc_bind);
    }

    #[test]
    fn negated_path_is_not_visible() {
        let host = FakeHost {
            dirs: vec!["/home/alice", "/opt"],
            ..Default::default()
        };
        let mut ctx = Context::new();
        ctx.set_filesystem("/home/alice", crate::context::FsMode::Rw);
        ctx.set_filesystem("/opt", crate::context::FsMode::None);
        let exports = Exports::project(&ctx, &host, "/home/alice", &no_xdg).unwrap();

        assert_eq!(exports.path_get_mode("/opt"), FsMode::None);
        assert!(!exports.path_is_visible("/opt"));
        assert_eq!(exports.path_get_mode("/home/alice"), FsMode::Rw);
    }

    #[test]
    fn usr_merge_symlink_is_mirrored_under_run_host() {
        let host = FakeHost {
            dirs: vec!["/usr"],
            symlinks: vec![("/bin", "usr/bin")],
            files: vec!["/etc/ld.so.cache"],
            ..Default::default()
        };
        let mut ctx = Context::new();
        ctx.set_filesystem("host-os", crate::context::FsMode::Rw);
        let exports = Exports::project(&ctx, &host, "/home/alice", &no_xdg).unwrap();

        let has_symlink = exports
            .directives()
            .iter()
            .any(|d| matches!(d, Directive::Symlink { target, link } if target == "usr/bin" && link == "/run/host/bin"));
        assert!(has_symlink);
    }
}
