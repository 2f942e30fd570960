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

//! The top-level launch sequence (§4.7): resolves deploys, composes every
//! other component, and hands the assembled `ArgVec` to the supervisor.
//!
//! Grounded directly on the prior CLI's `execute_container` (build args,
//! spawn proxies, exec, wait) and `fakeroot_container` (`Command` + FD
//! mappings + spawn). Reverse teardown on any failure past lock acquisition
//! mirrors the same function's cleanup path on a failed transaction.

use std::{fs::create_dir_all, path::PathBuf};

use bitflags::bitflags;

use crate::{
    appinfo::{self, ApplicationInfo, InstanceInfo},
    constants::RUNTIME_DIR,
    context::{BusPrivilege, Context},
    dbus_proxy::{Bus, DBusProxyPlan},
    environment::{AppIdentity, EnvironmentBuilder},
    err,
    exec::{
        argv::ArgVec,
        spawn_supervisor,
    },
    exports::{Exports, RealHostFs},
    instance::{InstanceDir, InstanceHandle},
    store::{Deploy, DeployStore, Ref},
    ErrorKind,
    Result,
};

bitflags! {
    #[derive(Default)]
    pub struct LaunchFlags: u32 {
        const DEVEL                     = 0b00001;
        const SANDBOX                   = 0b00010;
        const BACKGROUND                = 0b00100;
        const NO_SESSION_HELPER         = 0b01000;
        const NO_TALK_NAME_RESOLUTION   = 0b10000;
    }
}

/// Cooperative cancellation: the orchestrator checks this at every
/// suspension point named in §5 (proxy readiness, lock acquisition).
#[derive(Debug, Default, Clone, Copy)]
pub struct CancellationToken(bool);

impl CancellationToken {
    pub fn new() -> Self {
        Self(false)
    }

    pub fn cancel(&mut self) {
        self.0 = true;
    }

    fn check(&self) -> Result<()> {
        if self.0 {
            err!(ErrorKind::Cancelled)?
        }
        Ok(())
    }
}

pub struct LaunchOrchestrator<'s> {
    store: &'s dyn DeployStore,
}

impl<'s> LaunchOrchestrator<'s> {
    pub fn new(store: &'s dyn DeployStore) -> Self {
        Self { store }
    }

    /// Run the full §4.7 sequence. `runtime` overrides the app's declared
    /// runtime dependency; `overrides` is the user's persistent override
    /// document; `extra_context` is a one-off, per-invocation context
    /// (e.g. `--share=network` passed on a command line).
    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        &self,
        app: &Ref,
        runtime: Option<&Ref>,
        overrides: Option<&Context>,
        extra_context: Option<&Context>,
        flags: LaunchFlags,
        cwd: &str,
        cmd: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<InstanceHandle> {
        // 1. Resolve deploys, compute base context = runtime ⊕ app.
        let app_deploy = self.store.deploy(app)?;
        let runtime_deploy = match runtime {
            Some(r) => self.store.deploy(r)?,
            None => self.store.runtime_for(&app_deploy)?,
        };
        let mut context = runtime_deploy.metadata.merge(&app_deploy.metadata);

        // 2. User overrides, per-invocation context, flag-derived overrides.
        if let Some(overrides) = overrides {
            context = context.merge(overrides);
        }
        if let Some(extra) = extra_context {
            context = context.merge(extra);
        }
        apply_flag_overrides(&mut context, flags);

        // 3. Acquire the shared per-app deploy lock.
        cancel.check()?;
        let _deploy_lock = self.store.lock(app)?;

        self.launch_locked(app, &app_deploy, &runtime_deploy, &context, flags, cwd, cmd, args, cancel)
    }

    #[allow(clippy::too_many_arguments)]
    fn launch_locked(
        &self,
        app: &Ref,
        app_deploy: &Deploy,
        runtime_deploy: &Deploy,
        context: &Context,
        flags: LaunchFlags,
        cwd: &str,
        cmd: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<InstanceHandle> {
        // 4. Build Exports, then an ArgVec carrying the namespace flags.
        let home = crate::constants::HOME.to_string();
        let xdg = |bucket: &str| -> Option<String> { xdg_bucket_path(bucket) };
        let exports = Exports::project(context, &RealHostFs, &home, &xdg)?;

        let mut argvec = ArgVec::new();
        argvec.add_arg("--unshare-user").add_arg("--unshare-pid");

        if !context.shares().contains(crate::context::Shares::NETWORK) {
            argvec.add_arg("--unshare-net");
        }
        if !context.shares().contains(crate::context::Shares::IPC) {
            argvec.add_arg("--unshare-ipc");
        }

        argvec.add_arg("--die-with-parent").add_arg("--new-session");

        // 5. Bind runtime tree at /usr, app tree at /app; overlay extensions.
        argvec.add_arg("--ro-bind").add_arg(runtime_deploy.path.display().to_string()).add_arg("/usr");
        argvec.add_arg("--ro-bind").add_arg(app_deploy.path.display().to_string()).add_arg("/app");

        let mut extension_lib_paths = Vec::new();
        for extension in &app_deploy.extensions {
            let dest = format!("/app/{}", extension.directory);
            argvec.add_arg("--ro-bind").add_arg(extension.id.clone()).add_arg(dest.clone());
            extension_lib_paths.push(format!("{dest}/lib"));
        }

        // 6. Exports, then environment.
        exports.apply(&mut argvec);

        let env_start = argvec.args().len();

        let environment = EnvironmentBuilder::new()
            .base()
            .library_path(&[], &["/usr/lib".into()], &extension_lib_paths, &[], flags.contains(LaunchFlags::DEVEL))
            .context_overrides(context);

        // 7. D-Bus proxies: spawn, wait for readiness, splice socket binds.
        cancel.check()?;
        let mut plan = DBusProxyPlan::new();
        let mut session_policy = context.session_bus_policy().clone();
        if !flags.contains(LaunchFlags::NO_SESSION_HELPER) {
            session_policy.entry("org.freedesktop.Flatpak".into()).or_insert(BusPrivilege::Talk);
        }
        if !flags.contains(LaunchFlags::NO_TALK_NAME_RESOLUTION) {
            session_policy.entry("org.freedesktop.DBus".into()).or_insert(BusPrivilege::See);
        }
        if !session_policy.is_empty() {
            plan.enable(Bus::Session, session_policy);
        }
        if !context.system_bus_policy().is_empty() {
            plan.enable(Bus::System, context.system_bus_policy().clone());
        }

        let staging_dir = format!("{}/launch-staging-{}", *RUNTIME_DIR, std::process::id());
        create_dir_all(&staging_dir).ok();
        let proxies = plan.spawn(&staging_dir)?;

        for proxy in &proxies {
            argvec.add_arg("--ro-bind").add_arg(proxy.socket_path.clone()).add_arg(proxy.bus.sandbox_dest());
        }

        // 8. AppInfoSealer: allocate the instance id, materialize /.flatpak-info.
        let (instance_id, instance_path) = match appinfo::allocate_instance_id(*RUNTIME_DIR) {
            Ok(pair) => pair,
            Err(error) => {
                teardown_proxies(proxies);
                return Err(error);
            }
        };

        let application = ApplicationInfo {
            name: app.name.clone(),
            runtime: runtime_deploy.ref_.name.clone(),
            arch: app.arch.clone(),
            branch: app.branch.clone(),
            commit: app_deploy.commit.clone(),
            devel: flags.contains(LaunchFlags::DEVEL),
        };
        let instance_info = InstanceInfo {
            id: instance_id,
            original_app_path: app_deploy.path.display().to_string(),
            app_path: "/app".into(),
            runtime_path: "/usr".into(),
            session_bus_proxy: !context.session_bus_policy().is_empty(),
            system_bus_proxy: !context.system_bus_policy().is_empty(),
        };

        let mut environment = environment.identity(&AppIdentity {
            id: &application.name,
            arch: &application.arch,
            branch: &application.branch,
            instance_id: &instance_id.to_string(),
        });

        for (env_var, value) in proxies.iter().map(|p| p.env_binding()) {
            environment.set(env_var, value);
        }

        environment.apply(&mut argvec);

        let sealed = match appinfo::seal(&application, &instance_info, context) {
            Ok(fd) => fd,
            Err(error) => {
                teardown_proxies(proxies);
                remove_instance_dir(&instance_path);
                return Err(error);
            }
        };
        let fd_number = argvec.add_fd(sealed);
        argvec.add_arg("--ro-bind-data").add_arg(fd_number.to_string()).add_arg("/.flatpak-info");

        // 9. Bundle the env-setup arguments (everything from the environment
        // layer onward) to keep argv short.
        let env_end = argvec.args().len();
        if env_end > env_start {
            if let Err(error) = argvec.bundle(env_start, env_end, false) {
                teardown_proxies(proxies);
                remove_instance_dir(&instance_path);
                return Err(error);
            }
        }

        let bwrapinfo_fd = match std::fs::File::create(instance_path.join("bwrapinfo.json")) {
            Ok(file) => std::os::fd::OwnedFd::from(file),
            Err(error) => {
                teardown_proxies(proxies);
                remove_instance_dir(&instance_path);
                err!(ErrorKind::IOError(instance_path.display().to_string(), error.kind()))?
            }
        };
        let info_fd_number = argvec.add_fd(bwrapinfo_fd);
        argvec.add_arg("--info-fd").add_arg(info_fd_number.to_string());

        argvec.finish();
        argvec.add_arg(cmd);
        argvec.add_args(args.iter().cloned());

        // 10. Transient supervision scope, then spawn.
        enable_subreaper();

        let supervisor = match spawn_supervisor(argvec, cwd, &environment.as_map().into_iter().collect::<Vec<_>>()) {
            Ok(child) => child,
            Err(error) => {
                teardown_proxies(proxies);
                remove_instance_dir(&instance_path);
                return Err(error);
            }
        };

        let dir = InstanceDir::new(instance_id, instance_path);
        dir.write_pidfile(supervisor.id() as i32).ok();

        // 11. Return the instance handle; caller decides whether to wait.
        Ok(InstanceHandle::new(dir, supervisor, proxies, None))
    }
}

fn apply_flag_overrides(context: &mut Context, flags: LaunchFlags) {
    if flags.contains(LaunchFlags::DEVEL) {
        context.set_filesystem("host-os", crate::context::FsMode::Ro);
    }
    if flags.contains(LaunchFlags::SANDBOX) {
        let mut lockdown = Context::new();
        lockdown.set_filesystem("host-reset", crate::context::FsMode::Reset);
        *context = context.merge(&lockdown);
    }
}

fn xdg_bucket_path(bucket: &str) -> Option<String> {
    let base = match bucket {
        "xdg-data" => format!("{}/.local/share", *crate::constants::HOME),
        "xdg-config" => format!("{}/.config", *crate::constants::HOME),
        "xdg-cache" => format!("{}/.cache", *crate::constants::HOME),
        "xdg-run" => crate::constants::XDG_RUNTIME_DIR.to_string(),
        "xdg-music" => format!("{}/Music", *crate::constants::HOME),
        "xdg-pictures" => format!("{}/Pictures", *crate::constants::HOME),
        "xdg-videos" => format!("{}/Videos", *crate::constants::HOME),
        "xdg-documents" => format!("{}/Documents", *crate::constants::HOME),
        "xdg-download" => format!("{}/Downloads", *crate::constants::HOME),
        "xdg-desktop" => format!("{}/Desktop", *crate::constants::HOME),
        "xdg-public-share" => format!("{}/Public", *crate::constants::HOME),
        "xdg-templates" => format!("{}/Templates", *crate::constants::HOME),
        _ => return None,
    };
    Some(base)
}

fn teardown_proxies(mut proxies: Vec<crate::dbus_proxy::ProxyHandle>) {
    for proxy in &mut proxies {
        proxy.terminate().ok();
    }
}

fn remove_instance_dir(path: &PathBuf) {
    std::fs::remove_dir_all(path).ok();
}

/// Best-effort `PR_SET_CHILD_SUBREAPER`; on hosts where `bwrap` cannot be
/// reparented to a systemd scope, this keeps the sandboxed process from
/// being orphaned onto pid 1 if this process exits first.
fn enable_subreaper() {
    unsafe {
        nix::libc::prctl(nix::libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FsMode;

    #[test]
    fn cancellation_token_check_fails_once_cancelled() {
        let mut token = CancellationToken::new();
        assert!(token.check().is_ok());

        token.cancel();
        assert!(token.check().is_err());
    }

    #[test]
    fn devel_flag_forces_host_os_read_only() {
        let mut context = Context::new();
        apply_flag_overrides(&mut context, LaunchFlags::DEVEL);
        assert_eq!(context.filesystems().get("host-os"), Some(&FsMode::Ro));
    }

    #[test]
    fn sandbox_flag_merges_host_reset() {
        let mut context = Context::new();
        apply_flag_overrides(&mut context, LaunchFlags::SANDBOX);
        assert_eq!(context.filesystems().get("host-reset"), Some(&FsMode::Reset));
    }

    #[test]
    fn no_flags_leaves_context_untouched() {
        let mut context = Context::new();
        apply_flag_overrides(&mut context, LaunchFlags::empty());
        assert!(context.filesystems().is_empty());
    }

    #[test]
    fn xdg_bucket_path_resolves_known_buckets_and_rejects_unknown() {
        assert!(xdg_bucket_path("xdg-music").is_some());
        assert!(xdg_bucket_path("xdg-download").is_some());
        assert_eq!(xdg_bucket_path("xdg-nonsense"), None);
    }
}
