/*
 * This file is part of Corewatch.
 *
 * Copyright (C) 2025 Corewatch contributors
 *
 * Corewatch is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corewatch is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corewatch. If not, see <https://www.gnu.org/licenses/>.
 */

use std::io::stdout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use corewatch::cli::{self, Cli, Session};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_env_filter(cli.log_filter())
        .init();

    info!("corewatch {} starting", env!("CARGO_PKG_VERSION"));

    // SAFETY: geteuid has no preconditions and cannot fail.
    if !cli.simulate && !cli.no_driver && unsafe { libc::geteuid() } != 0 {
        warn!("Not running as root; register sensors will stay empty");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Interrupted, shutting down");
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    let mut session = Session::build(&cli)?;
    let mut out = stdout().lock();
    let result = cli::run(&cli, &mut session, &stop, &mut out);
    session.close()?;
    result?;

    info!("corewatch finished");
    Ok(())
}
