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

//! Drives `LaunchOrchestrator` against a temp-directory-backed
//! `FilesystemDeployStore`, exercising the deploy-resolution and
//! cancellation steps of the launch sequence (§4.7 steps 1-3) without
//! reaching the point of spawning `bwrap`/`xdg-dbus-proxy` themselves.

use std::fs::{create_dir_all, write};

use flatrun_core::{
    orchestrator::{CancellationToken, LaunchFlags, LaunchOrchestrator},
    store::{DeployStore, FilesystemDeployStore, Ref, RefKind},
    ErrorKind,
};

struct Fixture {
    root: std::path::PathBuf,
    store: FilesystemDeployStore,
}

impl Fixture {
    fn new(name: &str) -> Self {
        let root = std::env::temp_dir().join(format!("flatrun-orchestrator-test-{name}-{}", std::process::id()));
        std::fs::remove_dir_all(&root).ok();
        let store = FilesystemDeployStore::new(root.clone());
        Self { root, store }
    }

    /// Lay down `active/` (and optionally `metadata`) for a ref, the way
    /// an installed deploy would look on disk (§6 deploy layout).
    fn deploy(&self, r: &Ref, metadata: &str) {
        let kind_dir = match r.kind {
            RefKind::App => "app",
            RefKind::Runtime => "runtime",
        };
        let active = self.root.join("flatpak").join(kind_dir).join(&r.name).join(&r.arch).join(&r.branch).join("active");
        create_dir_all(&active).unwrap();
        if !metadata.is_empty() {
            write(active.join("metadata"), metadata).unwrap();
        }
        write(active.join("..").join("active-commit"), "deadbeef").unwrap();
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.root).ok();
    }
}

/// `InstanceHandle` (the `Ok` side of a launch) wraps a `std::process::Child`
/// and isn't `Debug`, so `Result::unwrap_err` can't be used directly.
fn expect_err<T>(result: flatrun_core::Result<T>, context: &str) -> flatrun_core::Error {
    match result {
        Err(error) => error,
        Ok(_) => panic!("{context}: expected an error, got Ok"),
    }
}

#[test]
fn cancellation_halts_the_pipeline_after_resolving_deploys() {
    let fx = Fixture::new("cancel");
    let app = Ref::new(RefKind::App, "org.example.App", "x86_64", "stable");
    let runtime = Ref::new(RefKind::Runtime, "org.example.Runtime", "x86_64", "stable");
    fx.deploy(&app, "");
    fx.deploy(&runtime, "");

    let orchestrator = LaunchOrchestrator::new(&fx.store);
    let mut cancel = CancellationToken::new();
    cancel.cancel();

    let result = orchestrator.launch(&app, Some(&runtime), None, None, LaunchFlags::empty(), "/", "/bin/sh", &[], &cancel);
    let error = expect_err(result, "pre-cancelled launch");

    // Both deploys resolved and merged (steps 1-2) before the cancellation
    // check at step 3 fired — a StoreError here would mean resolution
    // itself failed, which this assertion rules out.
    assert!(matches!(error.downcast::<ErrorKind>(), Ok(ErrorKind::Cancelled)));
}

#[test]
fn missing_app_deploy_is_reported_before_any_lock_or_cancellation_check() {
    let fx = Fixture::new("missing-app");
    let app = Ref::new(RefKind::App, "org.example.Missing", "x86_64", "stable");
    let runtime = Ref::new(RefKind::Runtime, "org.example.Runtime", "x86_64", "stable");
    fx.deploy(&runtime, "");

    let orchestrator = LaunchOrchestrator::new(&fx.store);
    let cancel = CancellationToken::new();

    let result = orchestrator.launch(&app, Some(&runtime), None, None, LaunchFlags::empty(), "/", "/bin/sh", &[], &cancel);
    let error = expect_err(result, "missing app deploy");

    let store_error = error.downcast::<flatrun_core::store::StoreError>().expect("a StoreError");
    assert!(matches!(store_error, flatrun_core::store::StoreError::NotFound(_)));
}

#[test]
fn missing_explicit_runtime_is_reported_as_not_found() {
    let fx = Fixture::new("missing-runtime");
    let app = Ref::new(RefKind::App, "org.example.App", "x86_64", "stable");
    let runtime = Ref::new(RefKind::Runtime, "org.example.Absent", "x86_64", "stable");
    fx.deploy(&app, "");

    let orchestrator = LaunchOrchestrator::new(&fx.store);
    let cancel = CancellationToken::new();

    let result = orchestrator.launch(&app, Some(&runtime), None, None, LaunchFlags::empty(), "/", "/bin/sh", &[], &cancel);
    let error = expect_err(result, "missing explicit runtime");

    let store_error = error.downcast::<flatrun_core::store::StoreError>().expect("a StoreError");
    assert!(matches!(store_error, flatrun_core::store::StoreError::NotFound(_)));
}

#[test]
fn app_without_explicit_runtime_falls_back_to_its_declared_dependency() {
    let fx = Fixture::new("declared-runtime");
    let app = Ref::new(RefKind::App, "org.example.App", "x86_64", "stable");
    let runtime = Ref::new(RefKind::Runtime, "org.example.Runtime", "x86_64", "23.08");
    fx.deploy(&app, "[Policy Application]\nruntime=org.example.Runtime/x86_64/23.08;\n");
    fx.deploy(&runtime, "");

    let orchestrator = LaunchOrchestrator::new(&fx.store);
    let mut cancel = CancellationToken::new();
    cancel.cancel();

    // No `runtime` override passed: `runtime_for` must resolve the deploy
    // declared in the app's own metadata, not the bare `NotInstalled`
    // fallback, before cancellation is observed at step 3.
    let result = orchestrator.launch(&app, None, None, None, LaunchFlags::empty(), "/", "/bin/sh", &[], &cancel);
    let error = expect_err(result, "declared-runtime fallback");

    assert!(matches!(error.downcast::<ErrorKind>(), Ok(ErrorKind::Cancelled)));
}

#[test]
fn shared_deploy_lock_allows_concurrent_launches_of_the_same_ref() {
    let fx = Fixture::new("shared-lock");
    let app = Ref::new(RefKind::App, "org.example.App", "x86_64", "stable");
    fx.deploy(&app, "");

    let first = fx.store.lock(&app).expect("first shared lock");
    let second = fx.store.lock(&app).expect("a second concurrent launch may also hold it");
    drop(first);
    drop(second);
}
