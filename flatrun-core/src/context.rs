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

//! The permission algebra: `Context` is the merged permission document that
//! drives every other component in the launch pipeline.
//!
//! Bitset fields replace the prior plugin-based `Permission` trait object
//! (`config/permission.rs`, `typetag`+`dyn-clone`): shares/sockets/devices/
//! features form a small closed set, so a `bitflags` pair (value + valid
//! mask) expresses the merge algebra directly instead of through dynamic
//! dispatch over boxed trait objects.

use std::fmt::{Display, Formatter, Result as FmtResult};

use bitflags::bitflags;
use indexmap::{IndexMap, IndexSet};

use crate::{err, impl_error, Error, ErrorTrait, Result};

bitflags! {
    #[derive(Default)]
    pub struct Shares: u8 {
        const NETWORK = 0b0000_0001;
        const IPC     = 0b0000_0010;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct Sockets: u16 {
        const X11          = 0b0000_0000_0001;
        const FALLBACK_X11 = 0b0000_0000_0010;
        const WAYLAND      = 0b0000_0000_0100;
        const PULSEAUDIO   = 0b0000_0000_1000;
        const SESSION_BUS  = 0b0000_0001_0000;
        const SYSTEM_BUS   = 0b0000_0010_0000;
        const SSH_AUTH     = 0b0000_0100_0000;
        const PCSC         = 0b0000_1000_0000;
        const CUPS         = 0b0001_0000_0000;
        const GPG_AGENT    = 0b0010_0000_0000;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct Devices: u8 {
        const DRI = 0b0001;
        const ALL = 0b0010;
        const KVM = 0b0100;
        const SHM = 0b1000;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct Features: u8 {
        const DEVEL           = 0b0_0001;
        const MULTIARCH       = 0b0_0010;
        const BLUETOOTH       = 0b0_0100;
        const CANBUS          = 0b0_1000;
        const PER_APP_DEV_SHM = 0b1_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsMode {
    None,
    Ro,
    Rw,
    Create,
    Reset,
}

impl Display for FsMode {
    fn fmt(&self, fmter: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::None => write!(fmter, "none"),
            Self::Ro => write!(fmter, "ro"),
            Self::Rw => write!(fmter, "rw"),
            Self::Create => write!(fmter, "create"),
            Self::Reset => write!(fmter, "reset"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BusPrivilege {
    None,
    See,
    Talk,
    Own,
}

#[derive(Debug, Clone)]
pub enum ParseError {
    Filesystem(String),
    DuplicateKey(String),
    Syntax(String),
}

impl Display for ParseError {
    fn fmt(&self, fmter: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Filesystem(token) => write!(fmter, "Invalid filesystem entry '{token}'."),
            Self::DuplicateKey(key) => write!(fmter, "Duplicate key '{key}' in permission document."),
            Self::Syntax(line) => write!(fmter, "Syntax error: '{line}'."),
        }
    }
}

impl_error!(ParseError);

const XDG_BUCKETS: &[&str] =
    &["desktop", "documents", "download", "music", "pictures", "public", "templates", "videos", "data", "cache", "config", "run"];

/// The merged permission document: shares, sockets, devices, features,
/// filesystem grants, persistent subpaths, environment overrides, and bus
/// policies. Mutable only while being built via `merge`; treated as
/// read-only once handed to [`crate::exports::Exports`] or
/// [`crate::environment::EnvironmentBuilder`].
#[derive(Debug, Clone, Default)]
pub struct Context {
    shares: Shares,
    shares_valid: Shares,
    sockets: Sockets,
    sockets_valid: Sockets,
    devices: Devices,
    devices_valid: Devices,
    features: Features,
    features_valid: Features,
    filesystems: IndexMap<String, FsMode>,
    persistent: IndexSet<String>,
    env_vars: IndexMap<String, Option<String>>,
    session_bus_policy: IndexMap<String, BusPrivilege>,
    system_bus_policy: IndexMap<String, BusPrivilege>,
    generic_policy: IndexMap<String, Vec<String>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shares(&self) -> Shares {
        self.shares
    }

    pub fn sockets(&self) -> Sockets {
        self.sockets
    }

    pub fn devices(&self) -> Devices {
        self.devices
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn filesystems(&self) -> &IndexMap<String, FsMode> {
        &self.filesystems
    }

    pub fn persistent(&self) -> &IndexSet<String> {
        &self.persistent
    }

    pub fn env_vars(&self) -> &IndexMap<String, Option<String>> {
        &self.env_vars
    }

    pub fn session_bus_policy(&self) -> &IndexMap<String, BusPrivilege> {
        &self.session_bus_policy
    }

    pub fn system_bus_policy(&self) -> &IndexMap<String, BusPrivilege> {
        &self.system_bus_policy
    }

    pub fn generic_policy(&self) -> &IndexMap<String, Vec<String>> {
        &self.generic_policy
    }

    pub fn set_filesystem(&mut self, token: impl Into<String>, mode: FsMode) {
        insert_last(&mut self.filesystems, token.into(), mode);
    }

    pub fn set_env(&mut self, name: impl Into<String>, value: Option<String>) {
        insert_last(&mut self.env_vars, name.into(), value);
    }

    /// Combine `self` with `other`, `other` taking precedence per field.
    /// Associative: `merge(merge(a,b),c) == merge(a,merge(b,c))`.
    pub fn merge(&self, other: &Context) -> Context {
        let shares = (self.shares & !other.shares_valid) | (other.shares & other.shares_valid);
        let sockets = (self.sockets & !other.sockets_valid) | (other.sockets & other.sockets_valid);
        let devices = (self.devices & !other.devices_valid) | (other.devices & other.devices_valid);
        let features = (self.features & !other.features_valid) | (other.features & other.features_valid);

        let mut filesystems = self.filesystems.clone();
        for (token, mode) in &other.filesystems {
            match mode {
                FsMode::None => {
                    filesystems.shift_remove(token);
                }
                FsMode::Reset => reset_domain(&mut filesystems, token),
                mode => insert_last(&mut filesystems, token.clone(), *mode),
            }
        }

        let mut env_vars = self.env_vars.clone();
        for (name, value) in &other.env_vars {
            insert_last(&mut env_vars, name.clone(), value.clone());
        }

        let session_bus_policy = merge_policy(&self.session_bus_policy, &other.session_bus_policy);
        let system_bus_policy = merge_policy(&self.system_bus_policy, &other.system_bus_policy);

        let mut persistent = self.persistent.clone();
        persistent.extend(other.persistent.iter().cloned());

        let mut generic_policy = self.generic_policy.clone();
        for (prefix, values) in &other.generic_policy {
            generic_policy.entry(prefix.clone()).or_default().extend(values.iter().cloned());
        }

        Context {
            shares,
            shares_valid: self.shares_valid | other.shares_valid,
            sockets,
            sockets_valid: self.sockets_valid | other.sockets_valid,
            devices,
            devices_valid: self.devices_valid | other.devices_valid,
            features,
            features_valid: self.features_valid | other.features_valid,
            filesystems,
            persistent,
            env_vars,
            session_bus_policy,
            system_bus_policy,
            generic_policy,
        }
    }

    /// Parse a single filesystem grammar entry (§4.2/§6). `negated` is
    /// forced `true` additionally when `s` itself carries a leading `!`.
    pub fn parse_filesystem(s: &str, negated: bool) -> Result<(String, FsMode)> {
        let negated = negated || s.starts_with('!');
        let s = s.strip_prefix('!').unwrap_or(s);
        let (body, suffix) = split_trailing_mode(s);
        let unescaped = unescape(body);

        let mut mode = if negated {
            FsMode::None
        } else {
            match suffix {
                None => FsMode::Rw,
                Some("ro") => FsMode::Ro,
                Some("rw") => FsMode::Rw,
                Some("create") => FsMode::Create,
                Some("reset") => FsMode::Reset,
                Some("none") => FsMode::None,
                Some(_) => err!(ParseError::Filesystem(s.to_string()))?,
            }
        };

        let mut token = normalize_token(&unescaped)?;

        if suffix == Some("reset") {
            token = format!("{token}-reset");
            if negated {
                mode = FsMode::None;
            }
        }

        Ok((token, mode))
    }

    /// Parse a `[Context]`/`[Session Bus Policy]`/`[System Bus Policy]`/
    /// `[Environment]`/`[Policy …]` key-value document (§6).
    pub fn load_metadata(doc: &str) -> Result<Context> {
        let mut ctx = Context::new();
        let mut group = String::new();

        for raw_line in doc.lines() {
            let line = strip_comment(raw_line).trim();

            if line.is_empty() {
                continue;
            }

            if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                group = header.to_string();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                err!(ParseError::Syntax(line.to_string()))?
            };
            let (key, value) = (key.trim(), value.trim());

            match group.as_str() {
                "Context" => ctx.load_context_key(key, value)?,
                "Session Bus Policy" => load_bus_entry(&mut ctx.session_bus_policy, key, value)?,
                "System Bus Policy" => load_bus_entry(&mut ctx.system_bus_policy, key, value)?,
                "Environment" => ctx.set_env(key, if value.is_empty() { None } else { Some(value.to_string()) }),
                other if other.starts_with("Policy ") => {
                    let prefix = other.trim_start_matches("Policy ").to_string();
                    let values = value.split(';').map(str::trim).filter(|v| !v.is_empty()).map(String::from).collect();
                    ctx.generic_policy.insert(format!("{prefix}/{key}"), values);
                }
                _ => err!(ParseError::Syntax(line.to_string()))?,
            }
        }

        Ok(ctx)
    }

    fn load_context_key(&mut self, key: &str, value: &str) -> Result<()> {
        let list = || value.split(';').map(str::trim).filter(|v| !v.is_empty());

        match key {
            "shared" => {
                for item in list() {
                    let (bit, valid) = match item {
                        "network" => (Shares::NETWORK, Shares::NETWORK),
                        "ipc" => (Shares::IPC, Shares::IPC),
                        _ => err!(ParseError::Syntax(item.to_string()))?,
                    };
                    self.shares |= bit;
                    self.shares_valid |= valid;
                }
            }
            "sockets" => {
                for item in list() {
                    let bit = match item {
                        "x11" => Sockets::X11,
                        "fallback-x11" => Sockets::FALLBACK_X11,
                        "wayland" => Sockets::WAYLAND,
                        "pulseaudio" => Sockets::PULSEAUDIO,
                        "session-bus" => Sockets::SESSION_BUS,
                        "system-bus" => Sockets::SYSTEM_BUS,
                        "ssh-auth" => Sockets::SSH_AUTH,
                        "pcsc" => Sockets::PCSC,
                        "cups" => Sockets::CUPS,
                        "gpg-agent" => Sockets::GPG_AGENT,
                        _ => err!(ParseError::Syntax(item.to_string()))?,
                    };
                    self.sockets |= bit;
                    self.sockets_valid |= bit;
                }
            }
            "devices" => {
                for item in list() {
                    let bit = match item {
                        "dri" => Devices::DRI,
                        "all" => Devices::ALL,
                        "kvm" => Devices::KVM,
                        "shm" => Devices::SHM,
                        _ => err!(ParseError::Syntax(item.to_string()))?,
                    };
                    self.devices |= bit;
                    self.devices_valid |= bit;
                }
            }
            "features" => {
                for item in list() {
                    let bit = match item {
                        "devel" => Features::DEVEL,
                        "multiarch" => Features::MULTIARCH,
                        "bluetooth" => Features::BLUETOOTH,
                        "canbus" => Features::CANBUS,
                        "per-app-dev-shm" => Features::PER_APP_DEV_SHM,
                        _ => err!(ParseError::Syntax(item.to_string()))?,
                    };
                    self.features |= bit;
                    self.features_valid |= bit;
                }
            }
            "filesystems" => {
                for item in list() {
                    let (token, mode) = Context::parse_filesystem(item, false)?;
                    self.set_filesystem(token, mode);
                }
            }
            "persistent" => {
                for item in list() {
                    self.persistent.insert(item.to_string());
                }
            }
            "unset-environment" => {
                for item in list() {
                    self.set_env(item, None);
                }
            }
            _ => err!(ParseError::Syntax(key.to_string()))?,
        }

        Ok(())
    }

    /// Serialize back to the §6 document format. `flatten` collapses
    /// negations with affirmatives, emitting only the net effective grant.
    pub fn save_metadata(&self, flatten: bool) -> String {
        let mut out = String::from("[Context]\n");

        let shares: Vec<&str> = [(Shares::NETWORK, "network"), (Shares::IPC, "ipc")]
            .into_iter()
            .filter(|(bit, _)| self.shares.contains(*bit))
            .map(|(_, name)| name)
            .collect();
        if !shares.is_empty() {
            out.push_str(&format!("shared={};\n", shares.join(";")));
        }

        out.push_str("filesystems=");
        for (token, mode) in &self.filesystems {
            if flatten && *mode == FsMode::None {
                continue;
            }
            match mode {
                FsMode::None => out.push_str(&format!("!{token};")),
                FsMode::Rw => out.push_str(&format!("{token};")),
                FsMode::Ro => out.push_str(&format!("{token}:ro;")),
                FsMode::Create => out.push_str(&format!("{token}:create;")),
                FsMode::Reset => out.push_str(&format!("{token};")),
            }
        }
        out.push('\n');

        if !self.persistent.is_empty() {
            out.push_str(&format!("persistent={};\n", self.persistent.iter().cloned().collect::<Vec<_>>().join(";")));
        }

        let unset: Vec<&str> = self.env_vars.iter().filter(|(_, v)| v.is_none()).map(|(k, _)| k.as_str()).collect();
        if !unset.is_empty() {
            out.push_str(&format!("unset-environment={};\n", unset.join(";")));
        }

        let sets: Vec<(&str, &str)> = self.env_vars.iter().filter_map(|(k, v)| v.as_deref().map(|v| (k.as_str(), v))).collect();
        if !sets.is_empty() {
            out.push_str("\n[Environment]\n");
            for (k, v) in sets {
                out.push_str(&format!("{k}={v}\n"));
            }
        }

        write_bus_group(&mut out, "Session Bus Policy", &self.session_bus_policy);
        write_bus_group(&mut out, "System Bus Policy", &self.system_bus_policy);

        for (prefix, values) in &self.generic_policy {
            let Some((prefix, key)) = prefix.split_once('/') else { continue };
            out.push_str(&format!("\n[Policy {prefix}]\n{key}={};\n", values.join(";")));
        }

        out
    }
}

fn insert_last<K: std::hash::Hash + Eq, V>(map: &mut IndexMap<K, V>, key: K, value: V) {
    map.shift_remove(&key);
    map.insert(key, value);
}

fn merge_policy(a: &IndexMap<String, BusPrivilege>, b: &IndexMap<String, BusPrivilege>) -> IndexMap<String, BusPrivilege> {
    let mut out = a.clone();
    for (name, priv_b) in b {
        if *priv_b == BusPrivilege::None {
            out.shift_remove(name);
            continue;
        }
        let combined = match out.get(name) {
            Some(priv_a) => (*priv_a).max(*priv_b),
            None => *priv_b,
        };
        insert_last(&mut out, name.clone(), combined);
    }
    out
}

fn load_bus_entry(map: &mut IndexMap<String, BusPrivilege>, key: &str, value: &str) -> Result<()> {
    let privilege = match value {
        "see" => BusPrivilege::See,
        "talk" => BusPrivilege::Talk,
        "own" => BusPrivilege::Own,
        "none" => BusPrivilege::None,
        _ => err!(ParseError::Syntax(value.to_string()))?,
    };
    insert_last(map, key.to_string(), privilege);
    Ok(())
}

fn write_bus_group(out: &mut String, name: &str, policy: &IndexMap<String, BusPrivilege>) {
    if policy.is_empty() {
        return;
    }
    out.push_str(&format!("\n[{name}]\n"));
    for (bus, privilege) in policy {
        let value = match privilege {
            BusPrivilege::See => "see",
            BusPrivilege::Talk => "talk",
            BusPrivilege::Own => "own",
            BusPrivilege::None => "none",
        };
        out.push_str(&format!("{bus}={value}\n"));
    }
}

fn strip_comment(line: &str) -> &str {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ';' if !escaped => return &line[.. i],
            _ => escaped = false,
        }
    }
    line
}

/// Split on the last unescaped `:` when the trailing segment is a known
/// mode keyword; otherwise the whole string is the body (no mode suffix).
fn split_trailing_mode(s: &str) -> (&str, Option<&str>) {
    let mut escaped = false;
    let mut last_colon = None;

    for (i, c) in s.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ':' if !escaped => last_colon = Some(i),
            _ => escaped = false,
        }
    }

    if let Some(i) = last_colon {
        let suffix = &s[i + 1 ..];
        if matches!(suffix, "ro" | "rw" | "create" | "reset" | "none") {
            return (&s[.. i], Some(suffix));
        }
    }

    (s, None)
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }

    out
}

/// Lexically collapse `.`/empty segments and resolve `..`; errors if a
/// leading `..` has nothing to pop against.
fn clean_segments(path: &str) -> Result<Vec<String>> {
    let mut stack: Vec<String> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if stack.pop().is_none() {
                    err!(ParseError::Filesystem(path.to_string()))?
                }
            }
            segment => stack.push(segment.to_string()),
        }
    }

    Ok(stack)
}

fn normalize_token(unescaped: &str) -> Result<String> {
    if unescaped == "~" {
        return Ok("home".into());
    }

    if let Some(rest) = unescaped.strip_prefix("~/") {
        let segments = clean_segments(rest)?;
        return Ok(if segments.is_empty() { "home".into() } else { format!("home/{}", segments.join("/")) });
    }

    if let Some(rest) = unescaped.strip_prefix('/') {
        let segments = clean_segments(rest)?;
        if segments.is_empty() {
            err!(ParseError::Filesystem(unescaped.to_string()))?
        }
        return Ok(format!("/{}", segments.join("/")));
    }

    match unescaped {
        "host" | "host-etc" | "host-os" | "host-reset" => return Ok(unescaped.to_string()),
        _ => {}
    }

    if let Some(rest) = unescaped.strip_prefix("xdg-") {
        let (bucket, subpath) = rest.split_once('/').map_or((rest, ""), |(b, s)| (b, s));

        if !XDG_BUCKETS.contains(&bucket) {
            err!(ParseError::Filesystem(unescaped.to_string()))?
        }

        let segments = clean_segments(subpath)?;

        if bucket == "run" && segments.is_empty() {
            err!(ParseError::Filesystem(unescaped.to_string()))?
        }

        return Ok(if segments.is_empty() { format!("xdg-{bucket}") } else { format!("xdg-{bucket}/{}", segments.join("/")) });
    }

    err!(ParseError::Filesystem(unescaped.to_string()))
}

fn reset_domain(filesystems: &mut IndexMap<String, FsMode>, reset_token: &str) {
    let Some(base) = reset_token.strip_suffix("-reset") else { return };

    if base == "host" {
        filesystems.retain(|token, _| token != "host" && token != "host-etc" && token != "host-os" && !token.starts_with('/'));
    } else {
        filesystems.retain(|token, _| token != base && !token.starts_with(&format!("{base}/")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_escaped_colon_path() {
        let (token, mode) = Context::parse_filesystem(r"/srv/obs/debian\:sid\:main:create", false).unwrap();
        assert_eq!(token, "/srv/obs/debian:sid:main");
        assert_eq!(mode, FsMode::Create);
    }

    #[test]
    fn parses_tilde_music() {
        let (token, mode) = Context::parse_filesystem("~/Music", false).unwrap();
        assert_eq!(token, "home/Music");
        assert_eq!(mode, FsMode::Rw);
    }

    #[test]
    fn collapses_dot_segments_in_xdg_bucket() {
        let (token, mode) = Context::parse_filesystem("xdg-config/././//.", false).unwrap();
        assert_eq!(token, "xdg-config");
        assert_eq!(mode, FsMode::Rw);
    }

    #[test]
    fn negated_host_reset() {
        let (token, mode) = Context::parse_filesystem("!host:reset", false).unwrap();
        assert_eq!(token, "host-reset");
        assert_eq!(mode, FsMode::None);
    }

    #[test]
    fn xdg_run_without_subpath_is_error() {
        assert!(Context::parse_filesystem("xdg-run", false).is_err());
    }

    #[test]
    fn negation_idempotence() {
        let a = Context::parse_filesystem("!/opt", false).unwrap();
        let b = Context::parse_filesystem("/opt:none", false).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.1, FsMode::None);
    }

    #[test]
    fn merge_is_associative_for_filesystems() {
        let mut a = Context::new();
        a.set_filesystem("/home", FsMode::Rw);

        let mut b = Context::new();
        b.set_filesystem("/home", FsMode::Ro);

        let mut c = Context::new();
        c.set_filesystem("/opt", FsMode::Rw);

        let left = a.merge(&b).merge(&c);
        let right = a.merge(&b.merge(&c));

        assert_eq!(left.filesystems, right.filesystems);
        assert_eq!(left.filesystems.get("/home"), Some(&FsMode::Ro));
    }

    #[test]
    fn bus_policy_takes_maximum_privilege() {
        let mut a = Context::new();
        a.session_bus_policy.insert("org.example.Svc".into(), BusPrivilege::Own);

        let mut b = Context::new();
        b.session_bus_policy.insert("org.example.Svc".into(), BusPrivilege::Talk);

        let merged = a.merge(&b);
        assert_eq!(merged.session_bus_policy.get("org.example.Svc"), Some(&BusPrivilege::Own));

        let mut c = Context::new();
        c.session_bus_policy.insert("org.example.Svc".into(), BusPrivilege::None);

        let merged = a.merge(&c);
        assert!(!merged.session_bus_policy.contains_key("org.example.Svc"));
    }

    #[test]
    fn host_reset_clears_host_domain() {
        let mut a = Context::new();
        a.set_filesystem("host", FsMode::Rw);
        a.set_filesystem("host-etc", FsMode::Rw);
        a.set_filesystem("/opt", FsMode::Rw);
        a.set_filesystem("home", FsMode::Rw);

        let mut b = Context::new();
        b.set_filesystem("host-reset", FsMode::Reset);

        let merged = a.merge(&b);
        assert!(!merged.filesystems.contains_key("host"));
        assert!(!merged.filesystems.contains_key("host-etc"));
        assert!(!merged.filesystems.contains_key("/opt"));
        assert!(merged.filesystems.contains_key("home"));
    }
}
