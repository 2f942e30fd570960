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

//! Computes the in-sandbox process environment (§4.4).
//!
//! Grounded on `config/filesystem/xdg_home.rs`'s env/bind conventions and
//! `exec/args.rs::ExecutionArgs::env` (accumulating `--setenv`/`--unsetenv`
//! pairs onto the same buffer that carries bind directives); generalized
//! here into its own ordered builder since the spec gives the environment a
//! fixed base plus several distinct override layers (§4.4).

use std::env::var;

use indexmap::IndexMap;

use crate::{constants::DEFAULT_PATH, context::Context, exec::argv::ArgVec};

const LOCALE_VARS: &[&str] = &["LANG", "LC_ALL", "LANGUAGE"];

/// Identity fields the sandbox needs for `FLATPAK_*` introspection vars.
pub struct AppIdentity<'a> {
    pub id: &'a str,
    pub arch: &'a str,
    pub branch: &'a str,
    pub instance_id: &'a str,
}

/// Builds the final environment an instance receives, one layer at a time:
/// fixed base, then library paths, then `FLATPAK_*` introspection, then the
/// context's own `env_vars` (applied last, so an explicit unset always
/// wins).
#[derive(Debug, Default)]
pub struct EnvironmentBuilder {
    vars: IndexMap<String, Option<String>>,
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the fixed minimal base (§4.4): `PATH`, XDG dir lists,
    /// `SHELL`, and any locale variables the caller had set.
    pub fn base(mut self) -> Self {
        self.set("PATH", DEFAULT_PATH);
        self.set("XDG_CONFIG_DIRS", "/app/etc/xdg:/etc/xdg");
        self.set("XDG_DATA_DIRS", "/app/share:/usr/share");
        self.set("SHELL", "/bin/sh");

        for name in LOCALE_VARS {
            if let Ok(value) = var(name) {
                self.set(name, value);
            }
        }

        self
    }

    /// Compose `LD_LIBRARY_PATH` from a caller-supplied prefix/suffix plus
    /// the runtime's and any extensions' library paths; `devel` appends
    /// `/usr/lib/debug`-style entries.
    pub fn library_path(mut self, prefix: &[String], runtime_lib_paths: &[String], extension_lib_paths: &[String], suffix: &[String], devel: bool) -> Self {
        let mut parts: Vec<String> = Vec::new();

        parts.extend(prefix.iter().cloned());
        parts.extend(runtime_lib_paths.iter().cloned());
        parts.extend(extension_lib_paths.iter().cloned());

        if devel {
            parts.extend(runtime_lib_paths.iter().map(|p| format!("{p}/debug")));
        }

        parts.extend(suffix.iter().cloned());

        if !parts.is_empty() {
            self.set("LD_LIBRARY_PATH", parts.join(":"));
        }

        self
    }

    /// Set the always-present `FLATPAK_*` introspection variables.
    pub fn identity(mut self, identity: &AppIdentity) -> Self {
        self.set("FLATPAK_ID", identity.id);
        self.set("FLATPAK_ARCH", identity.arch);
        self.set("FLATPAK_BRANCH", identity.branch);
        self.set("FLATPAK_SANDBOX_DIR", format!("/run/flatpak/{}", identity.instance_id));
        self
    }

    /// Apply the context's `env_vars` last; an explicit unset removes any
    /// prior definition from the base, library-path, or identity layers.
    pub fn context_overrides(mut self, context: &Context) -> Self {
        for (name, value) in context.env_vars() {
            match value {
                Some(value) => self.set(name, value.clone()),
                None => self.unset(name),
            }
        }
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.vars.shift_remove(&name);
        self.vars.insert(name, Some(value.into()));
    }

    pub fn unset(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.vars.shift_remove(&name);
        self.vars.insert(name, None);
    }

    /// Emit `--setenv NAME VALUE` / `--unsetenv NAME` pairs, in the order
    /// each variable was last touched.
    pub fn apply(&self, argvec: &mut ArgVec) {
        for (name, value) in &self.vars {
            match value {
                Some(value) => {
                    argvec.add_arg("--setenv").add_arg(name.clone()).add_arg(value.clone());
                }
                None => {
                    argvec.add_arg("--unsetenv").add_arg(name.clone());
                }
            }
        }
    }

    /// The subset of variables that are `set` (not `unset`), for callers
    /// (e.g. the bus proxy spawn) that need a literal child-process
    /// environment rather than a `--setenv` argument stream.
    pub fn as_map(&self) -> IndexMap<String, String> {
        self.vars.iter().filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone()))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_unset_overrides_base() {
        let mut ctx = Context::new();
        ctx.set_env("PATH", None);

        let env = EnvironmentBuilder::new().base().context_overrides(&ctx);
        assert_eq!(env.vars.get("PATH"), Some(&None));
    }

    #[test]
    fn context_set_overrides_base() {
        let mut ctx = Context::new();
        ctx.set_env("PATH", Some("/custom/bin".into()));

        let env = EnvironmentBuilder::new().base().context_overrides(&ctx);
        assert_eq!(env.as_map().get("PATH").map(String::as_str), Some("/custom/bin"));
    }

    #[test]
    fn identity_sets_sandbox_dir() {
        let identity = AppIdentity {
            id: "org.example.App",
            arch: "x86_64",
            branch: "stable",
            instance_id: "7",
        };
        let env = EnvironmentBuilder::new().identity(&identity);
        assert_eq!(env.as_map().get("FLATPAK_SANDBOX_DIR").map(String::as_str), Some("/run/flatpak/7"));
    }
}
