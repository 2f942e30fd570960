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

//! The deploy store: resolves `(app, runtime)` refs to deploy directories
//! and metadata, standing in for the OSTree object store and ref resolver
//! (§3.1, out of scope).
//!
//! Grounded on `config.rs::provide_handle`/`compose_handle` for the
//! resolve-or-error shape and on `config/vars.rs::ContainerVariables` for
//! per-instance path layout, re-scoped from per-container config paths to
//! per-ref deploy paths under `$DATA_HOME/flatpak/{app,runtime}`. The
//! per-ref lock is a *shared* `flock`, unlike `lock.rs`'s single-holder
//! file lock, since §4.7 step 3 requires multiple concurrent launches of
//! the same ref to coexist while only a concurrent uninstall is excluded.

use std::{
    fs::{read_to_string, File, OpenOptions},
    os::fd::AsRawFd,
    path::PathBuf,
};

use nix::fcntl::{flock, FlockArg};

use crate::{context::Context, err, impl_error, ErrorTrait, Result};

#[derive(Debug, Clone)]
pub enum StoreError {
    NotFound(String),
    NotInstalled(String),
    HostAccess(String, std::io::ErrorKind),
    LockContended(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, fmter: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::NotFound(r) => write!(fmter, "'{r}': Ref is not deployed"),
            Self::NotInstalled(r) => write!(fmter, "'{r}': Runtime is not installed"),
            Self::HostAccess(path, kind) => write!(fmter, "'{path}': Unable to access deploy directory: {kind}"),
            Self::LockContended(r) => write!(fmter, "'{r}': Deploy lock is held by a concurrent uninstall"),
        }
    }
}

impl_error!(StoreError);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    App,
    Runtime,
}

impl RefKind {
    fn directory(&self) -> &'static str {
        match self {
            RefKind::App => "app",
            RefKind::Runtime => "runtime",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ref {
    pub kind: RefKind,
    pub name: String,
    pub arch: String,
    pub branch: String,
}

impl Ref {
    pub fn new(kind: RefKind, name: impl Into<String>, arch: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            arch: arch.into(),
            branch: branch.into(),
        }
    }

    fn display(&self) -> String {
        format!("{}/{}/{}/{}", self.kind.directory(), self.name, self.arch, self.branch)
    }
}

/// A declared extension point, overlaid under its owning deploy's tree
/// (e.g. `/app/lib/debug` for a debug extension).
#[derive(Debug, Clone)]
pub struct Extension {
    pub id: String,
    pub directory: String,
    pub subdirectories: bool,
}

#[derive(Debug, Clone)]
pub struct Deploy {
    pub ref_: Ref,
    pub commit: String,
    pub path: PathBuf,
    pub metadata: Context,
    pub extensions: Vec<Extension>,
}

pub trait DeployStore {
    fn deploy(&self, r: &Ref) -> Result<Deploy>;
    fn runtime_for(&self, app: &Deploy) -> Result<Deploy>;
    fn lock(&self, r: &Ref) -> Result<DeployLock>;
}

/// A shared advisory lock on a ref's deploy directory: multiple launches
/// may hold it at once (`LOCK_SH`); an uninstall takes `LOCK_EX` and thus
/// blocks behind any active launch.
pub struct DeployLock {
    _file: File,
}

impl DeployLock {
    fn acquire_shared(path: &PathBuf, r: &str) -> Result<Self> {
        let file = match OpenOptions::new().read(true).open(path) {
            Ok(file) => file,
            Err(error) => err!(StoreError::HostAccess(path.display().to_string(), error.kind()))?,
        };

        match flock(file.as_raw_fd(), FlockArg::LockSharedNonblock) {
            Ok(()) => Ok(DeployLock { _file: file }),
            Err(_) => err!(StoreError::LockContended(r.to_string())),
        }
    }
}

/// Resolves refs under `$DATA_HOME/flatpak/{app,runtime}/<name>/<arch>/<branch>/active`,
/// reading a `metadata` key-value document at that path with
/// `Context::load_metadata` — the layout and parser are the same as the
/// permission document format (§6).
pub struct FilesystemDeployStore {
    data_home: PathBuf,
}

impl FilesystemDeployStore {
    pub fn new(data_home: impl Into<PathBuf>) -> Self {
        Self {
            data_home: data_home.into(),
        }
    }

    fn active_path(&self, r: &Ref) -> PathBuf {
        self.data_home.join("flatpak").join(r.kind.directory()).join(&r.name).join(&r.arch).join(&r.branch).join("active")
    }
}

impl DeployStore for FilesystemDeployStore {
    fn deploy(&self, r: &Ref) -> Result<Deploy> {
        let path = self.active_path(r);

        if !path.exists() {
            err!(StoreError::NotFound(r.display()))?
        }

        let metadata_path = path.join("metadata");
        let metadata_doc = match read_to_string(&metadata_path) {
            Ok(doc) => doc,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(error) => err!(StoreError::HostAccess(metadata_path.display().to_string(), error.kind()))?,
        };

        let metadata = Context::load_metadata(&metadata_doc)?;
        let commit_path = path.join("..").join("active-commit");
        let commit = read_to_string(&commit_path).unwrap_or_default().trim().to_string();

        Ok(Deploy {
            ref_: r.clone(),
            commit,
            path,
            metadata,
            extensions: Vec::new(),
        })
    }

    /// The declared runtime dependency lives in a `[Policy Application]`
    /// group's `runtime` key (`name/arch/branch`); absent that, the app
    /// is assumed to be its own runtime (a runtime deploy launched bare).
    fn runtime_for(&self, app: &Deploy) -> Result<Deploy> {
        let runtime = app
            .metadata
            .generic_policy()
            .get("Application/runtime")
            .and_then(|values| values.first())
            .cloned()
            .unwrap_or_else(|| format!("{}/{}/{}", app.ref_.name, app.ref_.arch, app.ref_.branch));

        let mut parts = runtime.splitn(3, '/');
        let name = parts.next().unwrap_or_default().to_string();
        let arch = parts.next().unwrap_or(&app.ref_.arch).to_string();
        let branch = parts.next().unwrap_or(&app.ref_.branch).to_string();
        let runtime_ref = Ref::new(RefKind::Runtime, name, arch, branch);

        match self.deploy(&runtime_ref) {
            Ok(deploy) => Ok(deploy),
            Err(_) => err!(StoreError::NotInstalled(runtime_ref.display())),
        }
    }

    fn lock(&self, r: &Ref) -> Result<DeployLock> {
        let path = self.active_path(r);
        DeployLock::acquire_shared(&path, &r.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_not_found_reports_ref_path() {
        let store = FilesystemDeployStore::new("/nonexistent-flatrun-test-root");
        let r = Ref::new(RefKind::App, "org.example.App", "x86_64", "stable");
        let error = store.deploy(&r).unwrap_err();
        assert!(error.to_string().contains("app/org.example.App/x86_64/stable"));
    }

    #[test]
    fn ref_display_includes_all_components() {
        let r = Ref::new(RefKind::Runtime, "org.example.Runtime", "x86_64", "23.08");
        assert_eq!(r.display(), "runtime/org.example.Runtime/x86_64/23.08");
    }
}
