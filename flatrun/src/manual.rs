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

use flatrun_core::{
    constants::{BOLD, RESET},
    utils::arguments::Arguments,
    Result,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn help(_args: &mut Arguments) -> Result<()> {
    println!(
        "{}flatrun{} {VERSION}\n\n\
         Launches sandboxed applications atop flatrun-core.\n\n\
         USAGE:\n\
         \tflatrun launch <app>[/<arch>/<branch>] [OPTIONS] [-- <command> [args..]]\n\n\
         OPTIONS:\n\
         \t--runtime=<ref>      Override the runtime the app declares\n\
         \t-d, --devel          Mount the host's /usr read-only for debugging\n\
         \t--sandbox            Apply an additional host-reset lockdown\n\
         \t-b, --background     Detach once the instance has launched\n\n\
         \t-h, --help           Print this message\n\
         \t-V, --version        Print version information",
        *BOLD,
        *RESET
    );

    Ok(())
}

pub fn print_version(_args: &mut Arguments) -> Result<()> {
    println!("flatrun {VERSION}");
    Ok(())
}
